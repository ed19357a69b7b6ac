// File-based logging - tees every log record to stderr and a timestamped log file.
//
// Creates a new log file on every launch:
//   ~/.local/share/clinic-relay/logs/relay-2026-03-01_14-30-00.log
//
// Keeps last 5 log files, deletes older ones.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Once;

static INIT: Once = Once::new();

const LOG_PREFIX: &str = "relay-";
const KEEP_LOGS: usize = 5;

/// Writes each record to stderr and, when available, to the log file.
struct TeeWriter {
    file: Option<fs::File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            // A failing log file must not take stderr logging down with it
            if file.write_all(buf).is_err() {
                self.file = None;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        Ok(())
    }
}

/// Initialize logging. Call once at startup, before any log macros fire.
///
/// `default_level` applies when `RUST_LOG` is unset. Passing `None` for
/// `logs_dir` logs to stderr only.
pub fn init(logs_dir: Option<&Path>, default_level: &str) {
    INIT.call_once(|| {
        let file = logs_dir.and_then(|dir| match open_log_file(dir) {
            Ok((file, path)) => {
                eprintln!("Logging: Writing to {}", path.display());
                Some(file)
            }
            Err(e) => {
                eprintln!("Warning: Failed to initialize file logging: {}", e);
                None
            }
        });

        let result = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(default_level),
        )
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(TeeWriter { file })))
        .try_init();

        if let Err(e) = result {
            eprintln!("Warning: Logger already initialized: {}", e);
        }
    });
}

fn open_log_file(logs_dir: &Path) -> Result<(fs::File, PathBuf), io::Error> {
    fs::create_dir_all(logs_dir)?;
    rotate_logs(logs_dir, KEEP_LOGS.saturating_sub(1))?;

    let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let log_file_path = logs_dir.join(format!("{}{}.log", LOG_PREFIX, timestamp));

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file_path)?;

    Ok((file, log_file_path))
}

/// Delete old log files, keeping the most recent `keep` files.
fn rotate_logs(logs_dir: &Path, keep: usize) -> Result<(), io::Error> {
    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

    for entry in fs::read_dir(logs_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_relay_log = path.extension().and_then(|e| e.to_str()) == Some("log")
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(LOG_PREFIX))
                .unwrap_or(false);
        if is_relay_log {
            if let Ok(metadata) = entry.metadata() {
                let modified = metadata.modified().unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first; name breaks ties since timestamps sort lexically
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    for (path, _) in log_files.iter().skip(keep) {
        eprintln!("Logging: Removing old log {}", path.display());
        let _ = fs::remove_file(path);
    }

    Ok(())
}

/// Get the logs directory path.
pub fn logs_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("clinic-relay").join("logs"))
}
