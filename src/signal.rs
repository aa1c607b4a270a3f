//! File-presence signal bus between the dashboard backend and the supervisor.
//!
//! A writer requests work by creating a marker file in the signal directory;
//! the supervisor loop is the only reader and removes the marker once the
//! requested action has finished. Writes go through a temp file and a rename
//! so a reader never sees a half-written payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const STATUS_FILE: &str = "update-status.json";

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Signal directory error ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode status: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Kind of request an external actor can make.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Restart,
    Update,
}

impl SignalKind {
    /// Marker file name for this kind
    pub fn file_name(&self) -> &'static str {
        match self {
            SignalKind::Restart => "restart-backend",
            SignalKind::Update => "update-requested",
        }
    }
}

impl std::str::FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "restart" | "restart-backend" => Ok(Self::Restart),
            "update" | "update-requested" => Ok(Self::Update),
            _ => Err(format!("Unknown signal '{}'. Use: restart or update", s)),
        }
    }
}

/// Progress of the most recent update, published for the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub state: String,
    pub branch: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub commits_behind: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SignalBus {
    dir: PathBuf,
}

impl SignalBus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: SignalKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Create the signal directory if needed.
    pub fn ensure_dir(&self) -> Result<(), SignalError> {
        fs::create_dir_all(&self.dir).map_err(|source| SignalError::Io {
            path: self.dir.clone(),
            source,
        })
    }

    /// Payload of a pending signal, `None` when no request is pending.
    ///
    /// An unreadable marker still counts as a request with an empty payload.
    pub fn peek(&self, kind: SignalKind) -> Option<String> {
        let path = self.path(kind);
        match fs::read_to_string(&path) {
            Ok(contents) => Some(contents.trim().to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                if path.exists() {
                    warn!("Signal {} unreadable ({}), treating as empty", path.display(), e);
                    Some(String::new())
                } else {
                    None
                }
            }
        }
    }

    /// Remove a signal. Removing an absent signal is not an error.
    pub fn consume(&self, kind: SignalKind) -> Result<(), SignalError> {
        let path = self.path(kind);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Consumed signal {}", kind.file_name());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SignalError::Io { path, source }),
        }
    }

    /// Raise a signal with the given payload.
    pub fn request(&self, kind: SignalKind, payload: &str) -> Result<(), SignalError> {
        self.ensure_dir()?;
        self.write_atomic(kind.file_name(), payload.as_bytes())
    }

    /// Publish the update progress document.
    pub fn write_status(&self, status: &UpdateStatus) -> Result<(), SignalError> {
        self.ensure_dir()?;
        let json = serde_json::to_vec_pretty(status)?;
        self.write_atomic(STATUS_FILE, &json)
    }

    /// Last published update progress, if any.
    pub fn read_status(&self) -> Option<UpdateStatus> {
        let contents = fs::read(self.dir.join(STATUS_FILE)).ok()?;
        serde_json::from_slice(&contents).ok()
    }

    fn write_atomic(&self, name: &str, contents: &[u8]) -> Result<(), SignalError> {
        let target = self.dir.join(name);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", name, std::process::id()));
        let io_err = |source: std::io::Error| SignalError::Io {
            path: target.clone(),
            source,
        };

        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(contents).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        if let Err(source) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(source));
        }
        Ok(())
    }
}
