//! Filesystem mailbox that lets another process hand messages to a running
//! server.
//!
//! Both sides derive the same location from the canonical listen address:
//!
//! ```text
//! <backlog_dir>/<sha1(listen_url)>.log     one payload path per line
//! <backlog_dir>/<sha1(listen_url)>/*.msg   payload files
//! ```
//!
//! Consumed lines stay in the log with a ` [checked]` suffix.

use crate::config::ServerConfig;
use crate::ServerError;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

const CHECKED_SUFFIX: &str = " [checked]";

/// Location of one server's mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backlog {
    root: PathBuf,
    log: PathBuf,
}

impl Backlog {
    /// Builds the mailbox for `listen_url` under `base_dir`.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Directory shared by every server on this machine
    /// * `listen_url` - Canonical `tcp://host:port/path` address
    pub fn new(base_dir: impl AsRef<Path>, listen_url: &str) -> Self {
        let digest = hex::encode(Sha1::digest(listen_url.as_bytes()));
        let base_dir = base_dir.as_ref();
        Self {
            root: base_dir.join(&digest),
            log: base_dir.join(format!("{digest}.log")),
        }
    }

    pub fn for_config(config: &ServerConfig) -> Self {
        Self::new(&config.backlog_dir, &config.listen_url())
    }

    /// Directory holding the payload files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_path(&self) -> &Path {
        &self.log
    }

    /// Stores `data` in a fresh payload file and appends its path to the log.
    ///
    /// Returns the path of the payload file.
    pub fn put(&self, data: &[u8]) -> Result<PathBuf, ServerError> {
        fs::create_dir_all(&self.root).map_err(ServerError::BacklogIo)?;

        let path = self.root.join(format!("{}.msg", Uuid::new_v4()));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(ServerError::BacklogIo)?;
        file.write_all(data).map_err(ServerError::BacklogIo)?;
        file.sync_all().map_err(ServerError::BacklogIo)?;

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log)
            .map_err(ServerError::BacklogIo)?;
        writeln!(log, "{}", path.display()).map_err(ServerError::BacklogIo)?;

        debug!("Backlog entry {} stored ({} bytes)", path.display(), data.len());
        Ok(path)
    }

    /// Reads, deletes and marks every unprocessed entry.
    ///
    /// Entries whose payload file is missing or unreadable are skipped with
    /// a warning and still marked, so they are not retried on every tick.
    /// Payloads already read are returned even if the log cannot be
    /// rewritten; their files are gone, so a retry only marks them.
    pub fn take_pending(&self) -> Result<Vec<Vec<u8>>, ServerError> {
        let content = match fs::read_to_string(&self.log) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ServerError::BacklogIo(e)),
        };

        let pending: Vec<&str> = content
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty() && !line.ends_with(CHECKED_SUFFIX))
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut messages = Vec::with_capacity(pending.len());
        let mut processed = HashSet::with_capacity(pending.len());
        for line in pending {
            let path = Path::new(line);
            match fs::read(path) {
                Ok(data) => {
                    if let Err(e) = fs::remove_file(path) {
                        warn!("Failed to delete backlog file {}: {}", path.display(), e);
                    }
                    trace!("Backlog entry {} drained", path.display());
                    messages.push(data);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!("Backlog file {} is missing, skipping", path.display());
                }
                Err(e) => {
                    warn!("Backlog file {} is unreadable, skipping: {}", path.display(), e);
                }
            }
            processed.insert(line.to_string());
        }

        if let Err(e) = self.mark_checked(&processed) {
            error!("Failed to mark backlog entries in {}: {}", self.log.display(), e);
        }
        Ok(messages)
    }

    /// Removes the log and every payload file.
    pub fn clear(&self) -> Result<(), ServerError> {
        for result in [fs::remove_file(&self.log), fs::remove_dir_all(&self.root)] {
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(ServerError::BacklogIo(e)),
            }
        }
        debug!("Backlog at {} cleared", self.log.display());
        Ok(())
    }

    /// Rewrites the log with `processed` lines marked.
    ///
    /// The log is read again first; lines a producer appended meanwhile are
    /// kept untouched.
    fn mark_checked(&self, processed: &HashSet<String>) -> io::Result<()> {
        let current = fs::read_to_string(&self.log)?;
        let mut rewritten = String::with_capacity(current.len() + processed.len() * CHECKED_SUFFIX.len());
        for line in current.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            rewritten.push_str(line);
            if !line.ends_with(CHECKED_SUFFIX) && processed.contains(line) {
                rewritten.push_str(CHECKED_SUFFIX);
            }
            rewritten.push('\n');
        }

        let mut file = File::create(&self.log)?;
        file.write_all(rewritten.as_bytes())?;
        file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backlog(dir: &TempDir) -> Backlog {
        Backlog::new(dir.path(), "tcp://127.0.0.1:8080/")
    }

    #[test]
    fn test_location_is_keyed_by_address() {
        let dir = TempDir::new().unwrap();
        let a = Backlog::new(dir.path(), "tcp://127.0.0.1:8080/");
        let b = Backlog::new(dir.path(), "tcp://127.0.0.1:8081/");

        assert_eq!(a, backlog(&dir));
        assert_ne!(a.log_path(), b.log_path());
        assert_eq!(a.log_path().extension().and_then(|e| e.to_str()), Some("log"));
        assert_eq!(a.root().file_name(), a.log_path().file_stem());
    }

    #[test]
    fn test_put_then_take() {
        let dir = TempDir::new().unwrap();
        let backlog = backlog(&dir);

        let path = backlog.put(b"hi").unwrap();
        assert!(path.exists());

        let messages = backlog.take_pending().unwrap();
        assert_eq!(messages, vec![b"hi".to_vec()]);
        assert!(!path.exists());

        let log = fs::read_to_string(backlog.log_path()).unwrap();
        assert_eq!(log, format!("{} [checked]\n", path.display()));

        assert!(backlog.take_pending().unwrap().is_empty());
    }

    #[test]
    fn test_entries_drain_in_order() {
        let dir = TempDir::new().unwrap();
        let backlog = backlog(&dir);

        backlog.put(b"one").unwrap();
        backlog.put(b"two").unwrap();
        let drained = backlog.take_pending().unwrap();
        assert_eq!(drained, vec![b"one".to_vec(), b"two".to_vec()]);

        backlog.put(b"three").unwrap();
        assert_eq!(backlog.take_pending().unwrap(), vec![b"three".to_vec()]);
    }

    #[test]
    fn test_missing_payload_is_skipped_and_marked() {
        let dir = TempDir::new().unwrap();
        let backlog = backlog(&dir);

        let lost = backlog.put(b"lost").unwrap();
        fs::remove_file(&lost).unwrap();
        backlog.put(b"kept").unwrap();

        assert_eq!(backlog.take_pending().unwrap(), vec![b"kept".to_vec()]);
        let log = fs::read_to_string(backlog.log_path()).unwrap();
        assert_eq!(log.matches(CHECKED_SUFFIX).count(), 2);
    }

    #[test]
    fn test_unreadable_entry_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let backlog = backlog(&dir);

        let good = backlog.put(b"precious").unwrap();
        let bad = dir.path().join("not-a-file");
        fs::create_dir(&bad).unwrap();
        let mut log = OpenOptions::new().append(true).open(backlog.log_path()).unwrap();
        writeln!(log, "{}", bad.display()).unwrap();
        backlog.put(b"after").unwrap();

        let drained = backlog.take_pending().unwrap();
        assert_eq!(drained, vec![b"precious".to_vec(), b"after".to_vec()]);
        assert!(!good.exists());

        let log = fs::read_to_string(backlog.log_path()).unwrap();
        assert_eq!(log.matches(CHECKED_SUFFIX).count(), 3);
        assert!(backlog.take_pending().unwrap().is_empty());
    }

    #[test]
    fn test_no_log_means_nothing_pending() {
        let dir = TempDir::new().unwrap();
        assert!(backlog(&dir).take_pending().unwrap().is_empty());
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let backlog = backlog(&dir);
        backlog.put(b"x").unwrap();

        backlog.clear().unwrap();
        assert!(!backlog.log_path().exists());
        assert!(!backlog.root().exists());
        backlog.clear().unwrap();
    }
}
