//! Course, assignment, machine and tester configuration.
//!
//! The intake only sees configuration through [`CourseCatalog`],
//! [`TesterRegistry`] and [`CredentialStore`]. [`YamlCourses`] reads one yaml
//! document per course, [`FileCredentials`] reads the storer's key from disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use log::info;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use crate::error::{Error, Result, ResultExt};
use crate::record::StorageKind;

const DEFAULT_MAX_SIZE: u64 = 1 << 20;
const DEFAULT_SSH_PORT: u16 = 22;

fn default_max_size() -> u64 { DEFAULT_MAX_SIZE }
fn default_ssh_port() -> u16 { DEFAULT_SSH_PORT }

/// Period during which a course accepts uploads, both ends included
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadWindow {
    #[serde(with = "crate::timestamp::text")]
    pub start: NaiveDateTime,
    #[serde(with = "crate::timestamp::text")]
    pub stop: NaiveDateTime,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentConfig {
    /// Machine profile the assignment is tested on
    pub machine: String,
    #[serde(default, with = "crate::timestamp::text_option")]
    pub deadline: Option<NaiveDateTime>,
    /// Refuse uploads after the deadline (plus grace) instead of only marking them late
    #[serde(default)]
    pub hard_deadline: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default)]
    pub min_submit_interval: Duration,
    /// Ceiling on upload size in bytes
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    #[serde(default)]
    pub storage: StorageKind,
    /// Store uploads without ever sending them to a tester
    #[serde(default)]
    pub submit_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub tester: String,
    pub run_script: PathBuf,
    pub build_script: PathBuf,
    pub tests_archive: PathBuf,
    #[serde(default)]
    pub custom_runner: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TesterConfig {
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub login_username: String,
    pub queue_path: String,
    /// `SHA256:` fingerprint the tester's host key must match
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    /// The queue is a directory on this host
    #[serde(default)]
    pub local: bool,
}

/// Where bundles for one machine are delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TesterTarget {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub login_username: String,
    pub queue_path: String,
    pub host_key_fingerprint: Option<String>,
    pub local: bool,
}

impl TesterTarget {
    fn from_config(name: &str, config: &TesterConfig) -> Self {
        Self {
            name: name.to_owned(),
            hostname: config.hostname.clone(),
            port: config.port,
            login_username: config.login_username.clone(),
            queue_path: config.queue_path.clone(),
            host_key_fingerprint: config.host_key_fingerprint.clone(),
            local: config.local,
        }
    }

    /// Address of the queue in the form accepted by the filestore
    pub fn queue_url(&self) -> Result<String> {
        let invalid = |detail: &str| Error::InvalidConfiguration(format!("tester {}: {detail}", self.name));
        if self.local {
            let url = url::Url::from_file_path(&self.queue_path).map_err(|()| invalid("local queue path must be absolute"))?;
            return Ok(url.to_string())
        }

        let mut url = url::Url::parse("sftp://localhost/").map_err(|err| invalid(&err.to_string()))?;
        url.set_host(Some(&self.hostname)).map_err(|err| invalid(&format!("bad hostname {:?}: {err}", self.hostname)))?;
        url.set_port(Some(self.port)).map_err(|()| invalid("bad port"))?;
        url.set_username(&self.login_username).map_err(|()| invalid("bad login username"))?;
        url.set_path(&self.queue_path);
        Ok(url.to_string())
    }
}

pub trait CourseCatalog: Send + Sync {
    /// Course configuration document shipped to testers
    fn course_config_path(&self, course: &str) -> Result<PathBuf>;
    fn upload_window(&self, course: &str) -> Result<UploadWindow>;
    fn assignment(&self, course: &str, assignment: &str) -> Result<AssignmentConfig>;
    fn machine(&self, course: &str, machine: &str) -> Result<MachineConfig>;
}

pub trait TesterRegistry: Send + Sync {
    fn resolve_tester(&self, course: &str, machine: &str) -> Result<TesterTarget>;
}

/// Private key the storer authenticates to testers with
#[derive(Clone)]
pub struct StorerKey {
    pub pem: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for StorerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorerKey").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn storer_private_key(&self) -> Result<StorerKey>;
}

#[derive(Debug, Deserialize)]
struct CourseDocument {
    upload_window: UploadWindow,
    #[serde(default)]
    assignments: HashMap<String, AssignmentConfig>,
    #[serde(default)]
    machines: HashMap<String, MachineConfig>,
    #[serde(default)]
    testers: HashMap<String, TesterConfig>,
}

#[derive(Debug)]
struct Course {
    path: PathBuf,
    document: CourseDocument,
}

/// Course configuration loaded from yaml files
#[derive(Debug)]
pub struct YamlCourses {
    courses: HashMap<String, Course>,
}

impl YamlCourses {
    /// Load every course, `courses` maps course ids to their configuration file
    pub async fn load(courses: &HashMap<String, PathBuf>) -> Result<Self> {
        let mut loaded = HashMap::new();
        for (id, path) in courses {
            let body = tokio::fs::read_to_string(path).await
                .map_err(|err| Error::InvalidConfiguration(format!("could not read course {id} from {}: {err}", path.to_string_lossy())))?;
            let body = environment_template::apply_env(&body)
                .map_err(|err| Error::InvalidConfiguration(format!("course {id}: {err}")))?;
            let course = Self::parse(id, path, &body)?;
            info!("Loaded course {id} with {} assignments", course.document.assignments.len());
            loaded.insert(id.clone(), course);
        }
        Ok(Self { courses: loaded })
    }

    fn parse(id: &str, path: &Path, body: &str) -> Result<Course> {
        let mut document: CourseDocument = serde_yaml::from_str(body)
            .map_err(|err| Error::InvalidConfiguration(format!("course {id}: {err}")))?;

        let base = path.parent().unwrap_or(Path::new("."));
        for machine in document.machines.values_mut() {
            machine.run_script = base.join(&machine.run_script);
            machine.build_script = base.join(&machine.build_script);
            machine.tests_archive = base.join(&machine.tests_archive);
            if let Some(runner) = &machine.custom_runner {
                machine.custom_runner = Some(base.join(runner));
            }
        }

        if document.upload_window.start > document.upload_window.stop {
            return Err(Error::InvalidConfiguration(format!("course {id}: upload window ends before it starts")))
        }
        for (name, assignment) in &document.assignments {
            crate::paths::validate_identifier("assignment", name)?;
            if !document.machines.contains_key(&assignment.machine) {
                return Err(Error::UnknownMachine { course: id.to_owned(), machine: assignment.machine.clone() })
            }
            if assignment.hard_deadline && assignment.deadline.is_none() {
                return Err(Error::InvalidConfiguration(format!("course {id}: assignment {name} has a hard deadline but no deadline")))
            }
        }
        for machine in document.machines.values() {
            if !document.testers.contains_key(&machine.tester) {
                return Err(Error::UnknownTester { course: id.to_owned(), tester: machine.tester.clone() })
            }
        }
        for (name, tester) in &document.testers {
            if !tester.queue_path.starts_with('/') {
                return Err(Error::InvalidConfiguration(format!("course {id}: tester {name} needs an absolute queue_path")))
            }
        }

        Ok(Course { path: path.to_owned(), document })
    }

    fn course(&self, course: &str) -> Result<&Course> {
        self.courses.get(course).ok_or_else(|| Error::UnknownCourse(course.to_owned()))
    }
}

impl CourseCatalog for YamlCourses {
    fn course_config_path(&self, course: &str) -> Result<PathBuf> {
        Ok(self.course(course)?.path.clone())
    }

    fn upload_window(&self, course: &str) -> Result<UploadWindow> {
        Ok(self.course(course)?.document.upload_window)
    }

    fn assignment(&self, course: &str, assignment: &str) -> Result<AssignmentConfig> {
        self.course(course)?.document.assignments.get(assignment).cloned()
            .ok_or_else(|| Error::UnknownAssignment { course: course.to_owned(), assignment: assignment.to_owned() })
    }

    fn machine(&self, course: &str, machine: &str) -> Result<MachineConfig> {
        self.course(course)?.document.machines.get(machine).cloned()
            .ok_or_else(|| Error::UnknownMachine { course: course.to_owned(), machine: machine.to_owned() })
    }
}

impl TesterRegistry for YamlCourses {
    fn resolve_tester(&self, course: &str, machine: &str) -> Result<TesterTarget> {
        let machine_config = self.machine(course, machine)?;
        let document = &self.course(course)?.document;
        let tester = document.testers.get(&machine_config.tester)
            .ok_or_else(|| Error::UnknownTester { course: course.to_owned(), tester: machine_config.tester.clone() })?;
        Ok(TesterTarget::from_config(&machine_config.tester, tester))
    }
}

/// Reads the storer's openssh private key each time it is needed
#[derive(Debug, Clone)]
pub struct FileCredentials {
    identity: PathBuf,
    password: Option<String>,
}

impl FileCredentials {
    pub fn new(identity: PathBuf, password: Option<String>) -> Self {
        Self { identity, password }
    }
}

#[async_trait]
impl CredentialStore for FileCredentials {
    async fn storer_private_key(&self) -> Result<StorerKey> {
        let pem = tokio::fs::read_to_string(&self.identity).await
            .internal(|| format!("Could not read storer identity {}", self.identity.to_string_lossy()))?;
        Ok(StorerKey { pem, password: self.password.clone() })
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Duration;

    use crate::error::Error;
    use crate::record::StorageKind;

    use super::{CourseCatalog, TesterRegistry, YamlCourses};

    const COURSE: &str = r#"
upload_window:
  start: "2024-03-01 00:00:00"
  stop: "2024-03-31 23:59:59"
assignments:
  hw1:
    machine: linux
    min_submit_interval: 3600
  big:
    machine: remote
    deadline: "2024-03-15 23:59:59"
    hard_deadline: true
    storage: large
    max_size: 512
machines:
  linux:
    tester: local
    run_script: scripts/run.sh
    build_script: scripts/build.sh
    tests_archive: /srv/tests/hw1.zip
  remote:
    tester: farm
    run_script: run.sh
    build_script: build.sh
    tests_archive: tests.zip
    custom_runner: runner.py
testers:
  local:
    hostname: localhost
    login_username: ignored
    queue_path: /var/queue
    local: true
  farm:
    hostname: tester.example.org
    port: 2222
    login_username: "vm checker"
    queue_path: /home/vm/queue
    host_key_fingerprint: "SHA256:abc"
"#;

    async fn load(body: &str) -> Result<YamlCourses, Error> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("course.yml");
        std::fs::write(&path, body).unwrap();
        YamlCourses::load(&HashMap::from([("c1".to_owned(), path)])).await
    }

    #[tokio::test]
    async fn parse_course() {
        let courses = load(COURSE).await.unwrap();

        let hw1 = courses.assignment("c1", "hw1").unwrap();
        assert_eq!(hw1.min_submit_interval, Duration::from_secs(3600));
        assert_eq!(hw1.max_size, 1 << 20);
        assert_eq!(hw1.storage, StorageKind::Standard);
        assert!(!hw1.hard_deadline && !hw1.submit_only);

        let big = courses.assignment("c1", "big").unwrap();
        assert_eq!(big.storage, StorageKind::Large);
        assert!(big.hard_deadline);
        assert_eq!(big.max_size, 512);

        let linux = courses.machine("c1", "linux").unwrap();
        assert!(linux.run_script.ends_with("scripts/run.sh"));
        assert!(linux.run_script.is_absolute());
        assert_eq!(linux.tests_archive, Path::new("/srv/tests/hw1.zip"));

        let local = courses.resolve_tester("c1", "linux").unwrap();
        assert!(local.local);
        assert_eq!(local.queue_url().unwrap(), "file:///var/queue");

        let farm = courses.resolve_tester("c1", "remote").unwrap();
        assert_eq!(farm.port, 2222);
        assert_eq!(farm.queue_url().unwrap(), "sftp://vm%20checker@tester.example.org:2222/home/vm/queue");
        assert_eq!(farm.host_key_fingerprint.as_deref(), Some("SHA256:abc"));

        assert!(matches!(courses.assignment("c1", "hw9"), Err(Error::UnknownAssignment { .. })));
        assert!(matches!(courses.assignment("c2", "hw1"), Err(Error::UnknownCourse(_))));
        assert!(matches!(courses.resolve_tester("c1", "windows"), Err(Error::UnknownMachine { .. })));
    }

    #[tokio::test]
    async fn reject_inconsistent_courses() {
        let relative_queue = COURSE.replace("queue_path: /home/vm/queue", "queue_path: queue");
        assert!(matches!(load(&relative_queue).await, Err(Error::InvalidConfiguration(_))));

        let missing_tester = COURSE.replace("tester: farm", "tester: nowhere");
        assert!(matches!(load(&missing_tester).await, Err(Error::UnknownTester { .. })));

        let missing_machine = COURSE.replace("machine: remote", "machine: solaris");
        assert!(matches!(load(&missing_machine).await, Err(Error::UnknownMachine { .. })));

        let no_deadline = COURSE.replace("    deadline: \"2024-03-15 23:59:59\"\n", "");
        assert!(matches!(load(&no_deadline).await, Err(Error::InvalidConfiguration(_))));
    }
}
