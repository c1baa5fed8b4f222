use std::path::Path;

use anyhow::{bail, Result};
use async_trait::async_trait;

pub mod local;
pub mod sftp;

/// A destination that bundles can be delivered to.
///
/// Names are single path segments relative to the transport's base directory.
/// `upload` must never leave a partially written file under the final name.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn upload(&self, path: &Path, name: &str) -> Result<()>;

    /// Release any connection held by the transport.
    async fn close(&self) -> Result<()>;
}

/// Reject names that would address anything other than a direct child of the base directory
pub(crate) fn validate_name(name: &str) -> Result<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        bail!("Invalid blob name: {name:?}");
    }
    Ok(name)
}

/// Name a file is written under before being renamed into place
pub(crate) fn partial_name(name: &str) -> String {
    format!(".{name}.part")
}

#[cfg(test)]
mod test {
    use super::{partial_name, validate_name};

    #[test]
    fn names() {
        assert!(validate_name("c1_hw1_A1_x8Jq.zip").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name("/abs").is_err());
        assert!(validate_name("a\\b").is_err());
        assert_eq!(partial_name("bundle.zip"), ".bundle.zip.part");
    }
}
