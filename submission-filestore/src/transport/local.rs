use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use log::debug;

use crate::errors::IncompleteTransfer;
use crate::transport::{partial_name, validate_name};

use super::Transport;

/// A tester queue that lives in a directory on this machine
pub struct LocalTransport {
    path: PathBuf,
}

impl LocalTransport {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn normalize(&self, name: &str) -> Result<PathBuf> {
        let s = safe_path::scoped_join(&self.path, validate_name(name)?)?;
        debug!("local normalized: {} -> {}", name, s.to_string_lossy());
        return Ok(s)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn upload(&self, source: &Path, name: &str) -> Result<()> {
        // names are resolved against the canonical queue directory, so it must exist first
        tokio::fs::create_dir_all(&self.path).await?;
        let path = self.normalize(name)?;

        // a hard link appears atomically under its final name
        _ = tokio::fs::remove_file(&path).await;
        if tokio::fs::hard_link(source, &path).await.is_ok() {
            return Ok(())
        }

        let partial = self.path.join(partial_name(name));
        let expected = tokio::fs::metadata(source).await?.len();
        let written = tokio::fs::copy(source, &partial).await?;
        if written != expected {
            _ = tokio::fs::remove_file(&partial).await;
            return Err(IncompleteTransfer { name: name.to_owned(), expected, remote: written }.into())
        }
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("file://{:?}", self.path))
    }
}
