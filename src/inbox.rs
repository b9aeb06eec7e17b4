//! Broadcast message inbox.
//!
//! The downstream decryption pipeline drops every satellite message addressed
//! to this receiver's key into a spool directory. The registrar polls the
//! inbox for the registration verification code; everything else about the
//! satellite data path lives outside this crate.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::trace;

/// A poll-able queue of raw (still encrypted) messages for this receiver.
///
/// `Ok(None)` means the inbox is currently empty, which is the expected state
/// for most of the wait.
#[async_trait]
pub trait Inbox: Send {
    async fn next_message(&mut self) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Inbox over a spool directory, consuming files oldest-first.
///
/// Files are never deleted here; consumed names are remembered so duplicates
/// delivered by the broadcast pipeline surface only once.
pub struct SpoolInbox {
    dir: PathBuf,
    seen: HashSet<OsString>,
}

impl SpoolInbox {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            seen: HashSet::new(),
        }
    }
}

#[async_trait]
impl Inbox for SpoolInbox {
    async fn next_message(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        // A missing spool directory just means nothing has arrived yet.
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut candidates: Vec<(SystemTime, PathBuf, OsString)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if self.seen.contains(&name) || !entry.file_type()?.is_file() {
                continue;
            }
            let mtime = entry
                .metadata()?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push((mtime, entry.path(), name));
        }

        candidates.sort();

        let Some((_, path, name)) = candidates.into_iter().next() else {
            return Ok(None);
        };

        trace!("consuming inbox message {}", path.display());
        let bytes = std::fs::read(&path)?;
        self.seen.insert(name);
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut inbox = SpoolInbox::new(dir.path().join("inbox"));
        assert!(inbox.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_messages_consumed_once_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.msg"), b"first").unwrap();

        let mut inbox = SpoolInbox::new(dir.path().to_path_buf());
        assert_eq!(inbox.next_message().await.unwrap().unwrap(), b"first");

        std::fs::write(dir.path().join("b.msg"), b"second").unwrap();
        assert_eq!(inbox.next_message().await.unwrap().unwrap(), b"second");

        // Both consumed; nothing left.
        assert!(inbox.next_message().await.unwrap().is_none());
    }
}
