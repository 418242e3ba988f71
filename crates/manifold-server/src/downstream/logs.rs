// crates/manifold-server/src/downstream/logs.rs
// Rotating per-downstream stderr capture

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

/// Rotate once the active log exceeds this size.
const MAX_BYTES: u64 = 1024 * 1024;

/// Files kept per downstream: the active log plus `.1` and `.2`.
const KEEP: usize = 3;

/// Size-capped log sink for one downstream's stderr.
///
/// Child stderr must never reach the protocol stream, so each stdio
/// downstream gets `logs/<name>.stderr.log` with shift rotation.
/// Failures are logged and swallowed — a full disk must not take the
/// connection down.
pub struct StderrLog {
    path: PathBuf,
    file: Option<File>,
    written: u64,
}

impl StderrLog {
    pub fn open(logs_dir: PathBuf, downstream: &str) -> Self {
        let path = logs_dir.join(format!("{downstream}.stderr.log"));
        let file = match std::fs::create_dir_all(&logs_dir) {
            Ok(()) => match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(path = %path.display(), "Cannot open stderr log: {e}");
                    None
                }
            },
            Err(e) => {
                warn!(dir = %logs_dir.display(), "Cannot create logs directory: {e}");
                None
            }
        };
        let written = file
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map(|m| m.len())
            .unwrap_or(0);
        Self {
            path,
            file,
            written,
        }
    }

    pub fn write_line(&mut self, line: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(file, "{line}") {
            warn!(path = %self.path.display(), "stderr log write failed: {e}");
            self.file = None;
            return;
        }
        self.written += line.len() as u64 + 1;
        if self.written > MAX_BYTES {
            self.rotate();
        }
    }

    /// Shift rotation: `.log` -> `.log.1` -> `.log.2`, oldest dropped.
    fn rotate(&mut self) {
        self.file = None;
        for index in (1..KEEP).rev() {
            let from = if index == 1 {
                self.path.clone()
            } else {
                rotated(&self.path, index - 1)
            };
            let to = rotated(&self.path, index);
            if from.exists() {
                let _ = std::fs::rename(&from, &to);
            }
        }
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            Ok(f) => {
                self.file = Some(f);
                self.written = 0;
            }
            Err(e) => warn!(path = %self.path.display(), "stderr log reopen failed: {e}"),
        }
    }
}

fn rotated(path: &std::path::Path, index: usize) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(format!(".{index}"));
    PathBuf::from(os)
}
