//! Transcript of a provisioning run
//!
//! Keeps a timestamped copy of everything the provisioning shell printed, so
//! a failed native build can be inspected after the package manager has
//! scrolled it away.

use crate::provisioner::{OutputLine, ProvisionEvent};
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const FILE_PREFIX: &str = "nixprep-provision-";
const FILE_SUFFIX: &str = ".log";
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Timestamped log file; clones share the same file
#[derive(Clone)]
pub struct Transcript {
    file: Arc<Mutex<Option<File>>>,
    path: PathBuf,
}

impl Transcript {
    /// Create a new transcript file in `dir`.
    ///
    /// Names carry a millisecond timestamp and the process id; a name that is
    /// still taken gets a numeric suffix, so concurrent runs never share a file.
    pub fn create_in(dir: &Path) -> Result<Self> {
        let stem = format!(
            "{}{}-{}",
            FILE_PREFIX,
            chrono::Local::now().format("%Y%m%d_%H%M%S%.3f"),
            std::process::id()
        );

        let mut attempt = 0u32;
        let (file, path) = loop {
            let name = if attempt == 0 {
                format!("{}{}", stem, FILE_SUFFIX)
            } else {
                format!("{}-{}{}", stem, attempt, FILE_SUFFIX)
            };
            let path = dir.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (file, path),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS => {
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to create transcript at {}", path.display())
                    })
                }
            }
        };

        let transcript = Self {
            file: Arc::new(Mutex::new(Some(file))),
            path,
        };

        transcript.info("=== nixprep provisioning transcript ===");
        transcript.info(&format!("Version: {}", env!("CARGO_PKG_VERSION")));
        transcript.info(&format!(
            "Started: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        ));

        Ok(transcript)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: &str) {
        self.write_line(Some("INFO"), message);
    }

    pub fn warn(&self, message: &str) {
        self.write_line(Some("WARN"), message);
    }

    pub fn error(&self, message: &str) {
        self.write_line(Some("ERROR"), message);
    }

    /// Record a line of child output
    pub fn record(&self, line: &OutputLine) {
        self.write_line(None, &format!("  {}: {}", line.stream.prefix(), line.text));
    }

    /// Record any provisioning event
    pub fn record_event(&self, event: &ProvisionEvent) {
        match event {
            ProvisionEvent::Output(line) => self.record(line),
            ProvisionEvent::Exited(Some(0)) => self.info("child process exited with code 0"),
            ProvisionEvent::Exited(Some(code)) => {
                self.error(&format!("child process exited with code {}", code))
            }
            ProvisionEvent::Exited(None) => self.error("child process terminated by signal"),
        }
    }

    fn write_line(&self, level: Option<&str>, message: &str) {
        let timestamp = chrono::Local::now().format("%H:%M:%S");
        let formatted = match level {
            Some(level) => format!("[{}] [{}] {}", timestamp, level, message),
            None => format!("[{}] {}", timestamp, message),
        };

        if let Ok(mut guard) = self.file.lock() {
            if let Some(ref mut file) = *guard {
                let _ = writeln!(file, "{}", formatted);
                let _ = file.flush();
            }
        }
    }

    pub fn finalize(&self) {
        self.info(&format!(
            "Finished: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
    }

    /// Remove all but the newest `keep` transcripts in `dir`
    pub fn cleanup_old(dir: &Path, keep: usize) -> Result<()> {
        let mut transcripts: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
                    .unwrap_or(false)
            })
            .collect();

        // Oldest first
        transcripts.sort_by_key(|path| std::fs::metadata(path).and_then(|m| m.modified()).ok());

        if transcripts.len() > keep {
            let excess = transcripts.len() - keep;
            for path in transcripts.iter().take(excess) {
                if let Err(e) = std::fs::remove_file(path) {
                    log::debug!("Could not remove {}: {}", path.display(), e);
                }
            }
        }

        Ok(())
    }
}

impl Drop for Transcript {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(ref mut file) = *guard {
                let _ = file.flush();
            }
        }
    }
}
