//! Layout of the storer's repository.
//!
//! ```text
//! <root>/repo/<course>/<assignment>/<account>/current          -> <version> (symlink)
//! <root>/repo/<course>/<assignment>/<account>/<version>/git/submission-config
//! <root>/repo/<course>/<assignment>/<account>/<version>/git/archive/...
//! <root>/repo/<course>/<assignment>/<account>/<version>/git/md5.txt
//! <root>/repo/<course>/<assignment>/<account>/<version>/archive.zip
//! <root>/repo/<course>/<assignment>/<account>/<version>/results/
//! <root>/index/<course>/<assignment>/<account>.json
//! <root>/locks/<course>/<assignment>/<account>.lock
//! ```
//!
//! Courses share one storer, so every key starts with the course.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct StorerPaths {
    root: PathBuf,
}

impl StorerPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn repository(&self) -> PathBuf {
        self.root.join("repo")
    }

    /// Directory holding every version submitted by an account for an assignment
    pub fn submissions_dir(&self, course: &str, assignment: &str, account: &str) -> PathBuf {
        self.repository().join(course).join(assignment).join(account)
    }

    pub fn current_pointer(&self, course: &str, assignment: &str, account: &str) -> PathBuf {
        self.submissions_dir(course, assignment, account).join("current")
    }

    pub fn index_file(&self, course: &str, assignment: &str, account: &str) -> PathBuf {
        self.root.join("index").join(course).join(assignment).join(format!("{account}.json"))
    }

    pub fn lock_file(&self, course: &str, assignment: &str, account: &str) -> PathBuf {
        self.root.join("locks").join(course).join(assignment).join(format!("{account}.lock"))
    }

    pub fn default_tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }
}

pub fn version_git_dir(version: &Path) -> PathBuf {
    version.join("git")
}

pub fn submission_config_file(version: &Path) -> PathBuf {
    version_git_dir(version).join("submission-config")
}

pub fn expanded_archive_dir(version: &Path) -> PathBuf {
    version_git_dir(version).join("archive")
}

pub fn reference_file(version: &Path) -> PathBuf {
    version_git_dir(version).join("md5.txt")
}

/// The unmodified upload
pub fn archive_file(version: &Path) -> PathBuf {
    version.join("archive.zip")
}

pub fn results_dir(version: &Path) -> PathBuf {
    version.join("results")
}

/// Identifiers are used as path segments, so they must be a single plain segment
pub fn validate_identifier<'a>(field: &'static str, value: &'a str) -> Result<&'a str> {
    let acceptable = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.starts_with('.')
        && value.chars().all(|c| !c.is_control() && c != '/' && c != '\\' && c != ':');
    if acceptable {
        Ok(value)
    } else {
        Err(Error::InvalidIdentifier { field, value: value.to_owned() })
    }
}
