//! The intake pipeline: policy, storage, bundling and dispatch put together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDateTime;
use log::{info, warn};

use crate::archive::check_archive_size;
use crate::bundle::BundleBuilder;
use crate::config::Config;
use crate::course::{CourseCatalog, CredentialStore, FileCredentials, TesterRegistry, YamlCourses};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::index::{FileIndex, SubmissionIndex};
use crate::locks::SectionLocks;
use crate::paths::{validate_identifier, StorerPaths};
use crate::policy::{Attempt, PolicyChecker, RateLimitBasis};
use crate::record::{StorageKind, SubmissionRecord};
use crate::store::{Admission, CurrentSubmission, Payload, SubmissionStore};
use crate::timestamp::{Clock, SystemClock};

/// Collaborators the intake consults
pub struct Services {
    pub catalog: Arc<dyn CourseCatalog>,
    pub testers: Arc<dyn TesterRegistry>,
    pub credentials: Arc<dyn CredentialStore>,
    pub index: Arc<dyn SubmissionIndex>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// The uploaded zip, or the reference file for large assignments
    pub archive: PathBuf,
    pub course: String,
    pub assignment: String,
    pub account: String,
    /// Set when someone other than the account holder uploads on their behalf
    pub submitting_user: Option<String>,
    pub skip_rate_check: bool,
    /// Back-dated administrative upload, implies `skip_rate_check`
    pub upload_time: Option<NaiveDateTime>,
}

pub struct Intake {
    catalog: Arc<dyn CourseCatalog>,
    testers: Arc<dyn TesterRegistry>,
    index: Arc<dyn SubmissionIndex>,
    policy: PolicyChecker,
    store: SubmissionStore,
    locks: SectionLocks,
    bundles: BundleBuilder,
    dispatcher: Dispatcher,
}

impl Intake {
    pub fn new(config: &Config, services: Services) -> Self {
        let paths = StorerPaths::new(config.storer.root.clone());
        Self {
            policy: PolicyChecker::new(services.index.clone(), services.clock),
            store: SubmissionStore::new(paths.clone(), config.storer.username.clone(), config.storer.hostname.clone()),
            locks: SectionLocks::new(paths),
            bundles: BundleBuilder::new(services.catalog.clone(), config.storer.tmp_dir()),
            dispatcher: Dispatcher::new(services.credentials, config.storer.known_hosts.clone(), config.dispatch.clone()),
            catalog: services.catalog,
            testers: services.testers,
            index: services.index,
        }
    }

    /// Wire the intake to the yaml course files, key file and index on disk
    pub async fn from_config(config: &Config) -> Result<Self> {
        let courses = Arc::new(YamlCourses::load(&config.courses).await?);
        let credentials = FileCredentials::new(config.storer.ssh_identity.clone(), config.storer.ssh_identity_password.clone());
        let services = Services {
            catalog: courses.clone(),
            testers: courses,
            credentials: Arc::new(credentials),
            index: Arc::new(FileIndex::new(StorerPaths::new(config.storer.root.clone()))),
            clock: Arc::new(SystemClock),
        };
        Ok(Self::new(config, services))
    }

    pub fn store(&self) -> &SubmissionStore {
        &self.store
    }

    /// The submission currently designated for a course, assignment and account
    pub async fn current(&self, course: &str, assignment: &str, account: &str) -> Result<Option<CurrentSubmission>> {
        validate_identifier("course", course)?;
        validate_identifier("assignment", assignment)?;
        validate_identifier("account", account)?;
        self.store.current(course, assignment, account).await
    }

    /// Admit a new submission and, unless the assignment is submit only or
    /// large, send it to be tested.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmissionRecord> {
        let course = validate_identifier("course", &request.course)?;
        let assignment = validate_identifier("assignment", &request.assignment)?;
        let account = validate_identifier("account", &request.account)?;
        let config = self.catalog.assignment(course, assignment)?;
        let window = self.catalog.upload_window(course)?;

        let skip_rate_check = request.skip_rate_check || request.upload_time.is_some();
        let upload_time = request.upload_time.unwrap_or_else(|| self.policy.now());

        let section = self.locks.lock(course, assignment, account).await?;
        self.policy.check(&Attempt {
            course,
            assignment,
            account,
            upload_time,
            window: &window,
            config: &config,
            rate_limit: if skip_rate_check { None } else { Some(RateLimitBasis::LastUpload) },
        }).await?;

        let payload = match config.storage {
            StorageKind::Standard => {
                let archive = request.archive.clone();
                let limit = config.max_size;
                tokio::task::spawn_blocking(move || check_archive_size(&archive, limit))
                    .await
                    .map_err(|err| Error::internal("Size check panicked", err))??;
                Payload::Archive { path: request.archive.clone(), max_size: config.max_size }
            }
            StorageKind::Large => Payload::Reference(request.archive.clone()),
        };

        let admission = Admission { course, assignment, account, submitting_user: request.submitting_user.as_deref(), upload_time };
        let admitted = self.store.admit(&section, &admission, payload).await?;
        self.index.record_upload(course, assignment, account, upload_time).await?;

        if config.submit_only {
            let grade = self.store.write_placeholder_grade(&admitted.version_dir).await?;
            info!("{course}/{assignment} is submit only, wrote {}", grade.to_string_lossy());
            return Ok(admitted.record)
        }
        if config.storage == StorageKind::Large {
            return Ok(admitted.record)
        }

        let bundle = self.bundles.build(&section, &self.store, course, assignment, account).await?;
        drop(section);
        self.dispatch_bundle(&bundle, course, assignment).await?;
        Ok(admitted.record)
    }

    /// Queue an already stored large submission for evaluation, with the
    /// payload now identified by `reference`.
    pub async fn evaluate_large_submission(&self, reference: &Path, course: &str, assignment: &str, account: &str) -> Result<()> {
        validate_identifier("course", course)?;
        validate_identifier("assignment", assignment)?;
        validate_identifier("account", account)?;
        let config = self.catalog.assignment(course, assignment)?;
        if config.storage != StorageKind::Large {
            return Err(Error::WrongStorageKind { assignment: assignment.to_owned(), storage: config.storage })
        }
        let window = self.catalog.upload_window(course)?;
        let now = self.policy.now();

        let section = self.locks.lock(course, assignment, account).await?;
        let Some(current) = self.store.current(course, assignment, account).await? else {
            return Err(Error::NoCurrentSubmission { course: course.to_owned(), assignment: assignment.to_owned(), account: account.to_owned() })
        };

        // the first evaluation is never rate limited
        let queued_before = self.index.last_eval_queueing_time(course, assignment, account).await.is_some();
        self.policy.check(&Attempt {
            course,
            assignment,
            account,
            upload_time: now,
            window: &window,
            config: &config,
            rate_limit: queued_before.then_some(RateLimitBasis::LastEvalQueueing),
        }).await?;

        self.store.clear_results(&current.version_dir).await?;
        let admission = Admission {
            course,
            assignment,
            account,
            submitting_user: current.record.submitting_user.as_deref(),
            upload_time: current.record.upload_time,
        };
        self.store.admit(&section, &admission, Payload::Reference(reference.to_owned())).await?;

        let bundle = self.bundles.build(&section, &self.store, course, assignment, account).await?;
        drop(section);
        self.dispatch_bundle(&bundle, course, assignment).await?;

        let _section = self.locks.lock(course, assignment, account).await?;
        self.index.record_eval_queueing(course, assignment, account, now).await
    }

    /// Build and send a bundle for the current version, creating nothing new
    pub async fn queue_for_testing(&self, course: &str, assignment: &str, account: &str) -> Result<()> {
        validate_identifier("course", course)?;
        validate_identifier("assignment", assignment)?;
        validate_identifier("account", account)?;
        let section = self.locks.lock(course, assignment, account).await?;
        let bundle = self.bundles.build(&section, &self.store, course, assignment, account).await?;
        drop(section);
        self.dispatch_bundle(&bundle, course, assignment).await
    }

    /// Send again a bundle kept in the staging directory after a failed dispatch
    pub async fn redispatch(&self, bundle: &Path, course: &str, assignment: &str) -> Result<()> {
        validate_identifier("course", course)?;
        validate_identifier("assignment", assignment)?;
        let bundle = self.bundles.staged(bundle, course, assignment).await?;
        self.dispatch_bundle(&bundle, course, assignment).await
    }

    /// Deliver a bundle, removing it only once it is safely queued
    async fn dispatch_bundle(&self, bundle: &Path, course: &str, assignment: &str) -> Result<()> {
        let config = self.catalog.assignment(course, assignment)?;
        let target = self.testers.resolve_tester(course, &config.machine)?;
        self.dispatcher.send(bundle, &target).await?;
        if let Err(err) = tokio::fs::remove_file(bundle).await {
            warn!("Could not remove dispatched bundle {}: {err}", bundle.to_string_lossy());
        }
        Ok(())
    }
}
