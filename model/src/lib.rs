//! Copying followings and bookmarks between Instagram accounts.

use anyhow::Error;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod accounts;
pub mod cache;
pub mod instagram;
pub mod session;
pub mod transfer;

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if logging is already initialized, so tests may call it freely.
pub fn init_logging() {
    init_logging_to(None).ok();
}

/// Log to stderr and, if `log_dir` is given, to a new file `clonner_HH_MM_SS.log` in it.
///
/// The file is created even if a subscriber is already installed, in which case an error is
/// returned and log lines keep going to the existing subscriber.
pub fn init_logging_to(log_dir: Option<&Path>) -> Result<(), Error> {
    let file = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let path = dir.join(format!("clonner_{}.log", time_of_day()));
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(File::create(path)?)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(file)
        .try_init()?;
    Ok(())
}

/// The current time of day as `HH_MM_SS`.
///
/// This is UTC rather than local time, so file names do not depend on the host's time zone.
fn time_of_day() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
        % 86400;
    format!("{:02}_{:02}_{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}
