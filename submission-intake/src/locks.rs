//! Exclusive sections keyed by (course, assignment, account).
//!
//! A section is held both in process, through an async mutex per key, and
//! across processes, through an advisory lock on a file under the storer
//! root. Keys never contend with each other.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::sync::{Arc, Weak};

use fs2::FileExt;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::error::{Error, Result, ResultExt};
use crate::paths::StorerPaths;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SectionKey {
    pub course: String,
    pub assignment: String,
    pub account: String,
}

impl std::fmt::Display for SectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.course, self.assignment, self.account)
    }
}

pub struct SectionLocks {
    paths: StorerPaths,
    sections: Mutex<HashMap<SectionKey, Weak<tokio::sync::Mutex<()>>>>,
}

impl SectionLocks {
    pub fn new(paths: StorerPaths) -> Self {
        Self { paths, sections: Mutex::new(HashMap::new()) }
    }

    fn local_mutex(&self, key: &SectionKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut sections = self.sections.lock();
        if let Some(existing) = sections.get(key).and_then(Weak::upgrade) {
            return existing
        }
        sections.retain(|_, section| section.strong_count() > 0);
        let section = Arc::new(tokio::sync::Mutex::new(()));
        sections.insert(key.clone(), Arc::downgrade(&section));
        section
    }

    /// Wait until the section for this key is free and take it
    pub async fn lock(&self, course: &str, assignment: &str, account: &str) -> Result<SectionGuard> {
        let key = SectionKey { course: course.to_owned(), assignment: assignment.to_owned(), account: account.to_owned() };
        let local = self.local_mutex(&key).lock_owned().await;

        let path = self.paths.lock_file(course, assignment, account);
        let file = tokio::task::spawn_blocking(move || -> Result<File> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).internal(|| format!("Could not create {}", parent.to_string_lossy()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .internal(|| format!("Could not open lock file {}", path.to_string_lossy()))?;
            file.lock_exclusive().internal(|| format!("Could not lock {}", path.to_string_lossy()))?;
            Ok(file)
        }).await.map_err(|err| Error::internal("Lock task panicked", err))??;

        debug!("Entered section {key}");
        Ok(SectionGuard { key, file, _local: local })
    }
}

/// Proof that the section for one key is held, released on drop
pub struct SectionGuard {
    key: SectionKey,
    file: File,
    _local: OwnedMutexGuard<()>,
}

impl SectionGuard {
    pub fn key(&self) -> &SectionKey {
        &self.key
    }

    /// Whether this guard is the section for the given key
    pub fn covers(&self, course: &str, assignment: &str, account: &str) -> bool {
        self.key.course == course && self.key.assignment == assignment && self.key.account == account
    }

    pub(crate) fn ensure_covers(&self, course: &str, assignment: &str, account: &str) -> Result<()> {
        if self.covers(course, assignment, account) {
            Ok(())
        } else {
            Err(Error::internal(
                format!("Section {} held while working on {course}/{assignment}/{account}", self.key),
                std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            ))
        }
    }
}

impl Drop for SectionGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!("Could not release file lock for {}: {err}", self.key);
        }
        debug!("Left section {}", self.key);
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::paths::StorerPaths;

    use super::SectionLocks;

    #[tokio::test]
    async fn same_key_waits() {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(SectionLocks::new(StorerPaths::new(dir.path().to_owned())));

        let guard = locks.lock("c1", "hw1", "A1").await.unwrap();
        assert!(guard.covers("c1", "hw1", "A1"));
        assert!(!guard.covers("c1", "hw1", "A2"));
        assert!(dir.path().join("locks/c1/hw1/A1.lock").exists());

        let waiting = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.lock("c1", "hw1", "A1").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), waiting).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn keys_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let locks = SectionLocks::new(StorerPaths::new(dir.path().to_owned()));

        let _first = locks.lock("c1", "hw1", "A1").await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), locks.lock("c1", "hw1", "A2")).await.unwrap().unwrap();
        let third = tokio::time::timeout(Duration::from_secs(5), locks.lock("c1", "hw2", "A1")).await.unwrap().unwrap();
        assert_eq!(second.key().account, "A2");
        assert_eq!(third.key().assignment, "hw2");

        let other_course = tokio::time::timeout(Duration::from_secs(5), locks.lock("c2", "hw1", "A1")).await.unwrap().unwrap();
        assert!(other_course.covers("c2", "hw1", "A1"));
        assert!(!other_course.covers("c1", "hw1", "A1"));
        assert!(dir.path().join("locks/c2/hw1/A1.lock").exists());
    }

    #[tokio::test]
    async fn unused_sections_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let locks = SectionLocks::new(StorerPaths::new(dir.path().to_owned()));
        for account in ["A1", "A2", "A3"] {
            drop(locks.lock("c1", "hw1", account).await.unwrap());
        }
        let _held = locks.lock("c1", "hw1", "A4").await.unwrap();
        assert_eq!(locks.sections.lock().len(), 1);
    }
}
