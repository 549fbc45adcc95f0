//! Append-only session log.
//!
//! Each port writes a plain-text event log, one line per event, with an
//! ISO-8601 timestamp prefix. Files are named
//! `<basename>-YYYYMMDD-HHMMSS.<ext>` (UTC session time) in the
//! configured directory.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};

use crate::error::Result;

pub const SESSION_LOG_EXT: &str = "log";

#[derive(Debug)]
enum Sink {
    File(Mutex<BufWriter<File>>),
    Null,
}

#[derive(Debug)]
pub struct SessionLog {
    path: Option<PathBuf>,
    sink: Sink,
}

impl SessionLog {
    /// Open `<dir>/<basename>-YYYYMMDD-HHMMSS.log` for append.
    pub fn create(dir: &Path, basename: &str) -> Result<SessionLog> {
        let session = Utc::now().format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("{basename}-{session}.{SESSION_LOG_EXT}"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(SessionLog {
            path: Some(path),
            sink: Sink::File(Mutex::new(BufWriter::new(file))),
        })
    }

    /// A log that discards everything; used by tests and by ports
    /// configured without a log directory.
    pub fn null() -> SessionLog {
        SessionLog {
            path: None,
            sink: Sink::Null,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one timestamped event line and flush it.
    pub fn event(&self, msg: &str) {
        if let Sink::File(w) = &self.sink {
            let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            if let Ok(mut w) = w.lock() {
                let _ = writeln!(w, "{ts} {msg}");
                let _ = w.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_timestamped_lines_to_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::create(dir.path(), "netif-trn").unwrap();
        let path = log.path().unwrap().to_path_buf();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("netif-trn-"));
        assert!(name.ends_with(".log"));
        // netif-trn-YYYYMMDD-HHMMSS.log
        assert_eq!(name.len(), "netif-trn-".len() + 15 + ".log".len());

        log.event("[TCPCON.trn]:ADD_CLI - id[5/127.0.0.1:5000] n[1]");
        log.event("*** netif session end ***");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("ADD_CLI"));
        // ISO-8601 prefix
        assert!(lines[0].split(' ').next().unwrap().contains('T'));
    }

    #[test]
    fn null_log_is_silent() {
        let log = SessionLog::null();
        assert!(log.path().is_none());
        log.event("dropped");
    }
}
