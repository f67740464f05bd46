// =============================================================================
// LOGGING - env_logger setup
// =============================================================================
//
// Info by default, RUST_LOG overrides. With `debug.log_to_file` every record
// goes to the configured file (truncated on start) instead of stderr.

use anyhow::{Context, Result};
use env_logger::{Builder, Target};
use log::LevelFilter;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::config::DebugConfig;

/// Truncate `path` and write the session header.
fn open_log_file(path: &Path) -> Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {:?}", path))?;

    writeln!(file, "=== Photon Log ===")?;
    writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
    writeln!(file)?;
    Ok(file)
}

/// Logger builder for `debug`, not yet installed.
pub fn builder(debug: &DebugConfig) -> Result<Builder> {
    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    if let Ok(filter) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filter);
    }

    if debug.log_to_file {
        let file = open_log_file(Path::new(&debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    Ok(builder)
}

/// Install the global logger. Call once, before anything logs.
pub fn init(debug: &DebugConfig) -> Result<()> {
    builder(debug)?
        .try_init()
        .context("Logger already initialized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    fn temp_log(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("photon-{name}-{}.log", std::process::id()))
    }

    #[test]
    fn file_target_receives_records() {
        let path = temp_log("file-target");
        let debug = DebugConfig {
            log_to_file: true,
            log_file: path.to_string_lossy().into_owned(),
            ..DebugConfig::default()
        };

        let logger = builder(&debug).unwrap().build();
        logger.log(
            &log::Record::builder()
                .args(format_args!("swapchain rebuilt"))
                .level(log::Level::Error)
                .target("photon")
                .build(),
        );
        logger.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(contents.starts_with("=== Photon Log ==="));
        assert!(contents.contains("swapchain rebuilt"));
    }

    #[test]
    fn existing_log_is_truncated() {
        let path = temp_log("truncate");
        std::fs::write(&path, "stale line from last run\n").unwrap();

        open_log_file(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(!contents.contains("stale line"));
    }

    #[test]
    fn unwritable_log_path_is_reported() {
        let debug = DebugConfig {
            log_to_file: true,
            log_file: "no/such/dir/photon.log".to_string(),
            ..DebugConfig::default()
        };
        let err = match builder(&debug) {
            Ok(_) => panic!("opened a log file under a missing directory"),
            Err(err) => err,
        };
        assert!(format!("{err}").contains("Failed to open log file"));
    }
}
