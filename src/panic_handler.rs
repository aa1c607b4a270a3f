//! Panic hook writing crash reports next to the persistent log.
//!
//! The supervisor runs unattended under systemd; a crash report on disk is
//! often the only trace an operator gets.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};

/// Install the panic hook. Call before anything else in `main`.
pub fn install(log_dir: &Path) {
    if std::env::var("RUST_BACKTRACE").is_err() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }

    let path = crash_report_path(log_dir);
    panic::set_hook(Box::new(move |info| {
        handle_panic(info, &path);
    }));
}

fn crash_report_path(log_dir: &Path) -> PathBuf {
    log_dir.join("crash.log")
}

fn handle_panic(info: &PanicHookInfo, path: &Path) {
    let report = format_crash_report(info);
    eprintln!("{}", report);

    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    // Append so earlier crashes in a restart loop are kept.
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = file.write_all(report.as_bytes());
        let _ = file.flush();
        eprintln!("Crash report appended to: {}", path.display());
    }
}

fn panic_message(info: &PanicHookInfo) -> String {
    if let Some(s) = info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

fn format_crash_report(info: &PanicHookInfo) -> String {
    let thread = std::thread::current();
    let location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "unknown".to_string());

    format!(
        "\n==== birdnet-supervisor {} crash at {} ====\n\
         Thread:   {} ({:?})\n\
         Location: {}\n\
         Message:  {}\n\n\
         Backtrace:\n{}\n",
        env!("CARGO_PKG_VERSION"),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        thread.name().unwrap_or("<unnamed>"),
        thread.id(),
        location,
        panic_message(info),
        std::backtrace::Backtrace::force_capture(),
    )
}
