//! Per (course, assignment, account) timestamps consulted by the rate limit.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, ResultExt};
use crate::paths::StorerPaths;

/// Lookups never fail, a missing or unreadable entry reads as no history.
/// Writers are expected to hold the section lock for the key being written.
#[async_trait]
pub trait SubmissionIndex: Send + Sync {
    async fn last_upload_time(&self, course: &str, assignment: &str, account: &str) -> Option<NaiveDateTime>;
    async fn last_eval_queueing_time(&self, course: &str, assignment: &str, account: &str) -> Option<NaiveDateTime>;
    async fn record_upload(&self, course: &str, assignment: &str, account: &str, time: NaiveDateTime) -> Result<()>;
    async fn record_eval_queueing(&self, course: &str, assignment: &str, account: &str, time: NaiveDateTime) -> Result<()>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(default, with = "crate::timestamp::text_option")]
    pub last_upload_time: Option<NaiveDateTime>,
    #[serde(default, with = "crate::timestamp::text_option")]
    pub last_eval_queueing_time: Option<NaiveDateTime>,
}

/// Keeps one small json document per key under the storer root
pub struct FileIndex {
    paths: StorerPaths,
}

impl FileIndex {
    pub fn new(paths: StorerPaths) -> Self {
        Self { paths }
    }

    async fn read(&self, course: &str, assignment: &str, account: &str) -> Option<IndexEntry> {
        let path = self.paths.index_file(course, assignment, account);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("Could not read submission index {}: {err}", path.to_string_lossy());
                return None
            }
        };
        match serde_json::from_slice(&body) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("Ignoring corrupt submission index {}: {err}", path.to_string_lossy());
                None
            }
        }
    }

    async fn update(&self, course: &str, assignment: &str, account: &str, change: impl FnOnce(&mut IndexEntry)) -> Result<()> {
        let mut entry = self.read(course, assignment, account).await.unwrap_or_default();
        change(&mut entry);

        let path = self.paths.index_file(course, assignment, account);
        let body = serde_json::to_vec_pretty(&entry).internal(|| "Could not encode submission index")?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&target, &body))
            .await
            .map_err(|err| Error::internal("Submission index writer panicked", err))??;
        debug!("Updated submission index {}", path.to_string_lossy());
        Ok(())
    }
}

/// Replace `path` so readers see either the old or the new document
fn write_atomically(path: &Path, body: &[u8]) -> Result<()> {
    let parent: PathBuf = match path.parent() {
        Some(parent) => parent.to_owned(),
        None => return Err(Error::internal(format!("No parent directory for {}", path.to_string_lossy()), std::io::Error::from(std::io::ErrorKind::InvalidInput))),
    };
    std::fs::create_dir_all(&parent).internal(|| format!("Could not create {}", parent.to_string_lossy()))?;
    let mut temp = tempfile::NamedTempFile::new_in(&parent).internal(|| format!("Could not create temporary file in {}", parent.to_string_lossy()))?;
    temp.write_all(body).internal(|| format!("Could not write {}", path.to_string_lossy()))?;
    temp.as_file().sync_all().internal(|| format!("Could not sync {}", path.to_string_lossy()))?;
    temp.persist(path).map_err(|err| Error::internal(format!("Could not replace {}", path.to_string_lossy()), err.error))?;
    Ok(())
}

#[async_trait]
impl SubmissionIndex for FileIndex {
    async fn last_upload_time(&self, course: &str, assignment: &str, account: &str) -> Option<NaiveDateTime> {
        self.read(course, assignment, account).await?.last_upload_time
    }

    async fn last_eval_queueing_time(&self, course: &str, assignment: &str, account: &str) -> Option<NaiveDateTime> {
        self.read(course, assignment, account).await?.last_eval_queueing_time
    }

    async fn record_upload(&self, course: &str, assignment: &str, account: &str, time: NaiveDateTime) -> Result<()> {
        self.update(course, assignment, account, |entry| entry.last_upload_time = Some(time)).await
    }

    async fn record_eval_queueing(&self, course: &str, assignment: &str, account: &str, time: NaiveDateTime) -> Result<()> {
        self.update(course, assignment, account, |entry| entry.last_eval_queueing_time = Some(time)).await
    }
}
