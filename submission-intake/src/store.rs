//! Durable, write-once submission versions and the pointer to the current one.
//!
//! A version directory is created for every admitted upload. Its
//! configuration is written and flushed before any payload lands next to it.
//! Once the payload is in place the `current` pointer is swapped to the new
//! version. Failed admissions leave their version directory behind unreferenced.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use log::{debug, error, info};
use rand::distr::Alphanumeric;
use rand::Rng;

use crate::archive::unzip_safely;
use crate::error::{Error, Result, ResultExt};
use crate::locks::SectionGuard;
use crate::paths::{self, StorerPaths};
use crate::record::{StorageKind, SubmissionRecord};
use crate::timestamp::format_time;

const SUFFIX_LENGTH: usize = 8;
const GRADE_FILE: &str = "grade.vmr";
const PLACEHOLDER_GRADE: &str = "ungraded\n";

pub(crate) fn random_suffix(length: usize) -> String {
    rand::rng().sample_iter(&Alphanumeric).take(length).map(char::from).collect()
}

/// Content stored with a new version
#[derive(Debug, Clone)]
pub enum Payload {
    /// An uploaded zip, extracted up to `max_size` bytes
    Archive { path: PathBuf, max_size: u64 },
    /// A file identifying content stored elsewhere
    Reference(PathBuf),
}

impl Payload {
    pub fn storage(&self) -> StorageKind {
        match self {
            Payload::Archive { .. } => StorageKind::Standard,
            Payload::Reference(_) => StorageKind::Large,
        }
    }
}

/// Who is submitting what, and when
#[derive(Debug, Clone, Copy)]
pub struct Admission<'a> {
    pub course: &'a str,
    pub assignment: &'a str,
    pub account: &'a str,
    pub submitting_user: Option<&'a str>,
    pub upload_time: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentSubmission {
    pub version_dir: PathBuf,
    pub record: SubmissionRecord,
}

pub struct SubmissionStore {
    paths: StorerPaths,
    storer_username: String,
    storer_hostname: String,
}

impl SubmissionStore {
    pub fn new(paths: StorerPaths, storer_username: String, storer_hostname: String) -> Self {
        Self { paths, storer_username, storer_hostname }
    }

    pub fn paths(&self) -> &StorerPaths {
        &self.paths
    }

    /// Store a new version and make it current.
    ///
    /// The caller must hold the section for the admission's course, assignment and account.
    pub async fn admit(&self, section: &SectionGuard, admission: &Admission<'_>, payload: Payload) -> Result<CurrentSubmission> {
        section.ensure_covers(admission.course, admission.assignment, admission.account)?;

        let submissions = self.paths.submissions_dir(admission.course, admission.assignment, admission.account);
        let version_dir = create_version_dir(&submissions, admission).await?;

        let record = SubmissionRecord {
            account: admission.account.to_owned(),
            submitting_user: admission.submitting_user.map(str::to_owned),
            assignment: admission.assignment.to_owned(),
            course_id: admission.course.to_owned(),
            upload_time: admission.upload_time,
            storage: payload.storage(),
            results_dest: paths::results_dir(&version_dir),
            remote_username: self.storer_username.clone(),
            remote_hostname: self.storer_hostname.clone(),
        };

        let document = record.to_document();
        let version = version_dir.clone();
        let result = tokio::task::spawn_blocking(move || materialize(&version, &document, &payload))
            .await
            .map_err(|err| Error::internal("Admission task panicked", err))?;
        if let Err(err) = result {
            error!("Could not admit {} for {}/{} into {}: {err}", admission.course, admission.assignment, admission.account, version_dir.to_string_lossy());
            return Err(err)
        }

        let pointer_dir = submissions.clone();
        let name = version_name(&version_dir)?;
        tokio::task::spawn_blocking(move || publish_current(&pointer_dir, &name))
            .await
            .map_err(|err| Error::internal("Pointer task panicked", err))?
            .internal(|| format!("Could not update current submission in {}", submissions.to_string_lossy()))?;

        info!("Admitted {} submission of {}/{} for {} at {}", record.storage, admission.course, admission.assignment, admission.account, version_dir.to_string_lossy());
        Ok(CurrentSubmission { version_dir, record })
    }

    /// The version currently designated for this course, assignment and account, if any
    pub async fn current(&self, course: &str, assignment: &str, account: &str) -> Result<Option<CurrentSubmission>> {
        let submissions = self.paths.submissions_dir(course, assignment, account);
        let pointer = self.paths.current_pointer(course, assignment, account);
        let target = match read_pointer(&pointer).await {
            Ok(target) => target,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::internal(format!("Could not read {}", pointer.to_string_lossy()), err)),
        };

        let version_dir = submissions.join(target);
        let config = paths::submission_config_file(&version_dir);
        let body = tokio::fs::read_to_string(&config).await
            .internal(|| format!("Could not read {}", config.to_string_lossy()))?;
        let record = SubmissionRecord::from_document(&body)
            .internal(|| format!("Could not parse {}", config.to_string_lossy()))?;
        Ok(Some(CurrentSubmission { version_dir, record }))
    }

    /// Remove results left by an earlier evaluation of this version
    pub async fn clear_results(&self, version_dir: &Path) -> Result<()> {
        let results = paths::results_dir(version_dir);
        match tokio::fs::remove_dir_all(&results).await {
            Ok(()) => {
                debug!("Removed {}", results.to_string_lossy());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::internal(format!("Could not remove {}", results.to_string_lossy()), err)),
        }
    }

    /// Record a placeholder grade for versions that are never sent to a tester
    pub async fn write_placeholder_grade(&self, version_dir: &Path) -> Result<PathBuf> {
        let results = paths::results_dir(version_dir);
        tokio::fs::create_dir_all(&results).await
            .internal(|| format!("Could not create {}", results.to_string_lossy()))?;
        let grade = results.join(GRADE_FILE);
        tokio::fs::write(&grade, PLACEHOLDER_GRADE).await
            .internal(|| format!("Could not write {}", grade.to_string_lossy()))?;
        Ok(grade)
    }
}

fn version_name(version_dir: &Path) -> Result<String> {
    match version_dir.file_name() {
        Some(name) => Ok(name.to_string_lossy().into_owned()),
        None => Err(Error::internal(format!("Version directory {} has no name", version_dir.to_string_lossy()), std::io::Error::from(std::io::ErrorKind::InvalidInput))),
    }
}

async fn create_version_dir(submissions: &Path, admission: &Admission<'_>) -> Result<PathBuf> {
    tokio::fs::create_dir_all(submissions).await
        .internal(|| format!("Could not create {}", submissions.to_string_lossy()))?;

    let stem = format!("{}_{}_{}_{}", admission.course, admission.assignment, admission.account, format_time(&admission.upload_time))
        .replace(' ', "__")
        .replace(':', ".");
    loop {
        let candidate = submissions.join(format!("{stem}_{}", random_suffix(SUFFIX_LENGTH)));
        match tokio::fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(Error::internal(format!("Could not create {}", candidate.to_string_lossy()), err)),
        }
    }
}

fn materialize(version: &Path, document: &str, payload: &Payload) -> Result<()> {
    let git = paths::version_git_dir(version);
    std::fs::create_dir_all(&git).internal(|| format!("Could not create {}", git.to_string_lossy()))?;

    let config = paths::submission_config_file(version);
    let mut file = File::create(&config).internal(|| format!("Could not create {}", config.to_string_lossy()))?;
    file.write_all(document.as_bytes()).internal(|| format!("Could not write {}", config.to_string_lossy()))?;
    file.sync_all().internal(|| format!("Could not sync {}", config.to_string_lossy()))?;

    match payload {
        Payload::Reference(source) => {
            copy_durably(source, &paths::reference_file(version))?;
        }
        Payload::Archive { path, max_size } => {
            let backup = paths::archive_file(version);
            copy_durably(path, &backup)?;
            unzip_safely(&backup, &paths::expanded_archive_dir(version), *max_size)?;
        }
    }
    Ok(())
}

fn copy_durably(source: &Path, destination: &Path) -> Result<()> {
    std::fs::copy(source, destination)
        .internal(|| format!("Could not copy {} to {}", source.to_string_lossy(), destination.to_string_lossy()))?;
    File::open(destination)
        .and_then(|file| file.sync_all())
        .internal(|| format!("Could not sync {}", destination.to_string_lossy()))
}

#[cfg(unix)]
fn publish_current(submissions: &Path, version: &str) -> std::io::Result<()> {
    let pointer = submissions.join("current");
    let staged = loop {
        let staged = submissions.join(format!(".current.{}", random_suffix(SUFFIX_LENGTH)));
        match std::os::unix::fs::symlink(version, &staged) {
            Ok(()) => break staged,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    };
    // rename replaces the old link in one step, readers never see it missing
    if let Err(err) = std::fs::rename(&staged, &pointer) {
        _ = std::fs::remove_file(&staged);
        return Err(err)
    }
    Ok(())
}

#[cfg(not(unix))]
fn publish_current(submissions: &Path, version: &str) -> std::io::Result<()> {
    let pointer = submissions.join("current");
    let staged = submissions.join(format!(".current.{}", random_suffix(SUFFIX_LENGTH)));
    std::fs::write(&staged, version)?;
    std::fs::rename(&staged, &pointer)
}

#[cfg(unix)]
async fn read_pointer(pointer: &Path) -> std::io::Result<PathBuf> {
    tokio::fs::read_link(pointer).await
}

#[cfg(not(unix))]
async fn read_pointer(pointer: &Path) -> std::io::Result<PathBuf> {
    Ok(PathBuf::from(tokio::fs::read_to_string(pointer).await?.trim()))
}
