//! Failures surfaced by the intake pipeline.
//!
//! Policy and validation errors are caused by the submitter and carry a
//! message fit to show them. Everything else is a fault of the system.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDateTime;

use crate::record::StorageKind;
use crate::timestamp::format_time;

/// Coarse classification used by front ends to pick a status or exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorKind {
    /// Submission window, deadline and rate limit rejections
    Policy,
    /// The uploaded content or request was unacceptable
    Validation,
    /// The bundle could not be delivered to the tester
    Transport,
    /// Course, machine or tester configuration is missing or inconsistent
    Configuration,
    /// Storage and other system failures
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("You can only submit homework between {} and {}.", format_time(.start), format_time(.stop))]
    OutsideSubmissionWindow { upload_time: NaiveDateTime, start: NaiveDateTime, stop: NaiveDateTime },

    #[error("You submitted too late. Deadline was {} and you submitted at {}.", format_time(.deadline), format_time(.upload_time))]
    PastHardDeadline { deadline: NaiveDateTime, upload_time: NaiveDateTime },

    #[error("You are submitting too fast. Please allow {} between submissions, the next one is accepted after {}.", describe_interval(.min_interval), format_time(.next_allowed))]
    TooSoonAfterPrevious { min_interval: Duration, previous: NaiveDateTime, next_allowed: NaiveDateTime },

    #[error("The archive is {size} bytes, the limit for this assignment is {limit} bytes.")]
    ArchiveTooLarge { size: u64, limit: u64 },

    #[error("The archive entry {entry:?} is not allowed: it {reason}.")]
    ArchiveOverrideAttempt { entry: String, reason: &'static str },

    #[error("The archive entry {entry:?} would be extracted outside of the submission.")]
    UnsafeArchiveEntry { entry: String },

    #[error("The archive could not be read: {reason}")]
    CorruptArchive { reason: String },

    #[error("Invalid {field}: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("There is no submission of {assignment} in {course} for {account}.")]
    NoCurrentSubmission { course: String, assignment: String, account: String },

    #[error("{} is not a bundle staged for {course}/{assignment}.", .bundle.to_string_lossy())]
    NotStagedBundle { bundle: PathBuf, course: String, assignment: String },

    #[error("Assignment {assignment} stores {storage} submissions, it can't be evaluated as a large submission.")]
    WrongStorageKind { assignment: String, storage: StorageKind },

    #[error("Could not deliver {} to tester {target}", .bundle.to_string_lossy())]
    DispatchFailed { target: String, bundle: PathBuf, #[source] source: anyhow::Error },

    #[error("Unknown course: {0}")]
    UnknownCourse(String),

    #[error("Unknown assignment {assignment} in course {course}")]
    UnknownAssignment { course: String, assignment: String },

    #[error("Unknown machine {machine} in course {course}")]
    UnknownMachine { course: String, machine: String },

    #[error("Unknown tester {tester} in course {course}")]
    UnknownTester { course: String, tester: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("{context}")]
    Internal { context: String, #[source] source: anyhow::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutsideSubmissionWindow { .. } |
            Error::PastHardDeadline { .. } |
            Error::TooSoonAfterPrevious { .. } => ErrorKind::Policy,

            Error::ArchiveTooLarge { .. } |
            Error::ArchiveOverrideAttempt { .. } |
            Error::UnsafeArchiveEntry { .. } |
            Error::CorruptArchive { .. } |
            Error::InvalidIdentifier { .. } |
            Error::NoCurrentSubmission { .. } |
            Error::NotStagedBundle { .. } |
            Error::WrongStorageKind { .. } => ErrorKind::Validation,

            Error::DispatchFailed { .. } => ErrorKind::Transport,

            Error::UnknownCourse(_) |
            Error::UnknownAssignment { .. } |
            Error::UnknownMachine { .. } |
            Error::UnknownTester { .. } |
            Error::InvalidConfiguration(_) => ErrorKind::Configuration,

            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Was this failure caused by what the user submitted rather than by the system
    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Policy | ErrorKind::Validation)
    }

    /// Process exit status used by the command line front end
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Policy => 2,
            ErrorKind::Validation => 3,
            ErrorKind::Transport => 4,
            ErrorKind::Configuration | ErrorKind::Internal => 1,
        }
    }

    pub(crate) fn internal(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Internal { context: context.into(), source: source.into() }
    }
}

/// Attach diagnostic context to storage and other system failures
pub(crate) trait ResultExt<T> {
    fn internal<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> ResultExt<T> for Result<T, E> {
    fn internal<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|err| Error::internal(context(), err))
    }
}

fn describe_interval(interval: &Duration) -> String {
    let total = interval.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut parts = vec![];
    if hours > 0 { parts.push(format!("{hours}h")) }
    if minutes > 0 { parts.push(format!("{minutes}m")) }
    if seconds > 0 || parts.is_empty() { parts.push(format!("{seconds}s")) }
    parts.join(" ")
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use chrono::NaiveDate;

    use super::{describe_interval, Error, ErrorKind};

    #[test]
    fn classification() {
        let time = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        let late = Error::PastHardDeadline { deadline: time, upload_time: time };
        assert_eq!(late.kind(), ErrorKind::Policy);
        assert!(late.is_user_error());
        assert_eq!(late.exit_code(), 2);
        assert!(late.to_string().contains("2024-03-01 10:00:00"));

        let unsafe_entry = Error::UnsafeArchiveEntry { entry: "../x".to_owned() };
        assert!(unsafe_entry.is_user_error());
        assert_eq!(unsafe_entry.exit_code(), 3);

        let dispatch = Error::DispatchFailed { target: "t1".into(), bundle: "/tmp/b.zip".into(), source: anyhow::anyhow!("refused") };
        assert_eq!(dispatch.kind(), ErrorKind::Transport);
        assert!(!dispatch.is_user_error());
        assert_eq!(dispatch.exit_code(), 4);

        let internal = Error::internal("disk full", std::io::Error::other("no space"));
        assert_eq!(internal.kind(), ErrorKind::Internal);
        assert!(!internal.is_user_error());
    }

    #[test]
    fn intervals() {
        assert_eq!(describe_interval(&Duration::from_secs(0)), "0s");
        assert_eq!(describe_interval(&Duration::from_secs(3600)), "1h");
        assert_eq!(describe_interval(&Duration::from_secs(5430)), "1h 30m 30s");
    }
}
