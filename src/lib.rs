//! Host-side supervisor for the BirdNET display appliance.
//!
//! Keeps the audio socket and the container group running, applies
//! operator-requested restarts and updates, and installs the appliance.

pub mod audio;
pub mod config;
pub mod containers;
pub mod exec;
pub mod installer;
pub mod panic_handler;
pub mod service;
pub mod signal;
pub mod supervisor;
pub mod update;
pub mod vcs;

pub use config::Config;
