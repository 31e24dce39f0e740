//! Where report lines go: the console, or one append-only file per destination.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Receives one line per probe, hop or summary.
pub trait LogSink {
    fn record(&mut self, line: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn record(&mut self, line: &str) {
        println!("{}", line);
    }
}

/// Collects lines in memory.
impl LogSink for Vec<String> {
    fn record(&mut self, line: &str) {
        self.push(line.to_string());
    }
}

/// Appends lines to `<unix-seconds>-<tool>-<host>.log`.
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    pub fn create(dir: &Path, tool: &str, host: &str) -> io::Result<Self> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = dir.join(format!("{}-{}-{}.log", stamp, tool, file_safe(host)));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(FileSink { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn record(&mut self, line: &str) {
        if let Err(e) = writeln!(self.file, "{}", line) {
            warn!(path = %self.path.display(), error = %e, "Failed to write log line");
        }
    }
}

fn file_safe(host: &str) -> String {
    host.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Diagnostics go to stderr through `tracing`. `RUST_LOG` wins over `verbose`.
pub fn init_diagnostics(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
