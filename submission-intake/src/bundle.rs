//! Assembly of the package a tester needs to evaluate one submission.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info};

use crate::archive::{check_archive_for_file_override, create_zip};
use crate::course::CourseCatalog;
use crate::error::{Error, Result, ResultExt};
use crate::locks::SectionGuard;
use crate::paths;
use crate::record::StorageKind;
use crate::store::SubmissionStore;

pub const RUN_SCRIPT: &str = "run.sh";
pub const BUILD_SCRIPT: &str = "build.sh";
pub const TESTS: &str = "tests.zip";
pub const COURSE_CONFIG: &str = "course-config";
pub const SUBMISSION_CONFIG: &str = "submission-config";
pub const ARCHIVE: &str = "archive.zip";
pub const REFERENCE: &str = "md5.txt";

pub struct BundleBuilder {
    catalog: Arc<dyn CourseCatalog>,
    tmp_dir: PathBuf,
}

impl BundleBuilder {
    pub fn new(catalog: Arc<dyn CourseCatalog>, tmp_dir: PathBuf) -> Self {
        Self { catalog, tmp_dir }
    }

    /// Package the current version of a submission into a new zip under the
    /// staging directory and return its path. The caller owns the file.
    pub async fn build(&self, section: &SectionGuard, store: &SubmissionStore, course: &str, assignment: &str, account: &str) -> Result<PathBuf> {
        section.ensure_covers(course, assignment, account)?;

        let assignment_config = self.catalog.assignment(course, assignment)?;
        let machine = self.catalog.machine(course, &assignment_config.machine)?;
        let current = store.current(course, assignment, account).await?
            .ok_or_else(|| Error::NoCurrentSubmission { course: course.to_owned(), assignment: assignment.to_owned(), account: account.to_owned() })?;

        let mut manifest: Vec<(String, PathBuf)> = vec![
            (RUN_SCRIPT.to_owned(), machine.run_script.clone()),
            (BUILD_SCRIPT.to_owned(), machine.build_script.clone()),
            (TESTS.to_owned(), machine.tests_archive.clone()),
            (COURSE_CONFIG.to_owned(), self.catalog.course_config_path(course)?),
            (SUBMISSION_CONFIG.to_owned(), paths::submission_config_file(&current.version_dir)),
        ];
        match current.record.storage {
            StorageKind::Standard => manifest.push((ARCHIVE.to_owned(), paths::archive_file(&current.version_dir))),
            StorageKind::Large => manifest.push((REFERENCE.to_owned(), paths::reference_file(&current.version_dir))),
        }
        if let Some(runner) = &machine.custom_runner {
            let Some(name) = runner.file_name() else {
                return Err(Error::InvalidConfiguration(format!("custom runner {} has no file name", runner.to_string_lossy())))
            };
            manifest.push((name.to_string_lossy().into_owned(), runner.clone()));
        }

        let mut names = HashSet::new();
        for (name, _) in &manifest {
            if !names.insert(name.as_str()) {
                return Err(Error::InvalidConfiguration(format!("bundle for {course}/{assignment} has two entries named {name}")))
            }
        }

        let prefix = format!("{course}_{assignment}_{account}_");
        let tmp_dir = self.tmp_dir.clone();
        let storage = current.record.storage;
        let result = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            if storage == StorageKind::Standard {
                let reserved: Vec<&str> = manifest.iter().map(|(name, _)| name.as_str()).collect();
                check_archive_for_file_override(&manifest_path(&manifest, ARCHIVE)?, &reserved)?;
            }

            std::fs::create_dir_all(&tmp_dir).internal(|| format!("Could not create {}", tmp_dir.to_string_lossy()))?;
            let temp = tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(".zip")
                .tempfile_in(&tmp_dir)
                .internal(|| format!("Could not create bundle in {}", tmp_dir.to_string_lossy()))?;
            let output = temp.as_file().try_clone().internal(|| "Could not open bundle for writing")?;
            // dropping the temporary file on failure removes the partial bundle
            create_zip(output, &manifest)?;
            let (_, path) = temp.keep().map_err(|err| Error::internal("Could not keep bundle", err.error))?;
            Ok(path)
        }).await.map_err(|err| Error::internal("Bundle task panicked", err))?;

        match result {
            Ok(path) => {
                info!("Created bundle {} for {course}/{assignment}/{account}", path.to_string_lossy());
                Ok(path)
            }
            Err(err) => {
                error!("Could not build bundle for {course}/{assignment}/{account}: {err}");
                Err(err)
            }
        }
    }

    /// Resolve a bundle kept in the staging directory after a failed dispatch.
    /// Anything else, including bundles staged for another assignment, is refused.
    pub async fn staged(&self, bundle: &Path, course: &str, assignment: &str) -> Result<PathBuf> {
        let not_staged = || Error::NotStagedBundle { bundle: bundle.to_owned(), course: course.to_owned(), assignment: assignment.to_owned() };
        let (Ok(path), Ok(tmp_dir)) = (tokio::fs::canonicalize(bundle).await, tokio::fs::canonicalize(&self.tmp_dir).await) else {
            return Err(not_staged())
        };

        let prefix = format!("{course}_{assignment}_");
        let named_like_bundle = path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".zip"));
        let is_file = tokio::fs::metadata(&path).await.map(|meta| meta.is_file()).unwrap_or(false);
        if path.parent() != Some(tmp_dir.as_path()) || !named_like_bundle || !is_file {
            return Err(not_staged())
        }
        Ok(path)
    }
}

fn manifest_path(manifest: &[(String, PathBuf)], name: &str) -> Result<PathBuf> {
    manifest.iter()
        .find(|(entry, _)| entry == name)
        .map(|(_, path)| path.clone())
        .ok_or_else(|| Error::internal(format!("Bundle manifest has no {name}"), std::io::Error::from(std::io::ErrorKind::NotFound)))
}
