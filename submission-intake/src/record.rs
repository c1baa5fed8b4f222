//! The submission record stored alongside every submission version.
//!
//! On disk the record is a small key-value document with one
//! `[Assignment]` section:
//!
//! ```text
//! [Assignment]
//! Account = A1
//! Assignment = hw1
//! UploadTime = 2024-03-01 10:00:00
//! CourseID = c1
//! Storage = standard
//! ResultsDest = /srv/storer/repo/hw1/A1/c1_hw1_A1_2024-03-01__10.00.00_k3Jd9a/results
//! RemoteUsername = storer
//! RemoteHostname = storer.example.org
//! ```
//!
//! Keys are matched case-insensitively when reading, so documents written by
//! older tooling with lower case keys are accepted.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::timestamp::{format_time, parse_time};

const SECTION: &str = "Assignment";

/// How the payload of an assignment's submissions is kept
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StorageKind {
    /// The archive is uploaded, kept and shipped to the tester
    #[default]
    Standard,
    /// Only a reference to an externally stored payload is kept
    Large,
}

impl StorageKind {
    /// Read the storage field, where an empty value means the default
    pub fn parse_field(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Some(Self::default())
        }
        value.parse().ok()
    }
}

/// Identifies one admitted upload. Never modified once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub account: String,
    pub submitting_user: Option<String>,
    pub assignment: String,
    pub course_id: String,
    pub upload_time: NaiveDateTime,
    pub storage: StorageKind,
    /// Where the tester delivers results for this version
    pub results_dest: PathBuf,
    /// Login the tester uses to reach the storer
    pub remote_username: String,
    /// Storer host the tester reports back to
    pub remote_hostname: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordParseError {
    #[error("missing [Assignment] section")]
    MissingSection,
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },
    #[error("malformed line {0}")]
    MalformedLine(usize),
}

impl SubmissionRecord {
    /// Render the record as a key-value document
    pub fn to_document(&self) -> String {
        let mut out = format!("[{SECTION}]\n");
        let mut field = |key: &str, value: &str| {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(value);
            out.push('\n');
        };
        field("Account", &self.account);
        if let Some(user) = &self.submitting_user {
            field("SubmittingUser", user);
        }
        field("Assignment", &self.assignment);
        field("UploadTime", &format_time(&self.upload_time));
        field("CourseID", &self.course_id);
        field("Storage", &self.storage.to_string());
        field("ResultsDest", &self.results_dest.to_string_lossy());
        field("RemoteUsername", &self.remote_username);
        field("RemoteHostname", &self.remote_hostname);
        out
    }

    /// Parse a document produced by [`SubmissionRecord::to_document`]
    pub fn from_document(body: &str) -> Result<Self, RecordParseError> {
        let mut in_section = false;
        let mut seen_section = false;
        let mut fields: HashMap<String, String> = HashMap::new();

        for (number, line) in body.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue
            }
            if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                in_section = name.trim() == SECTION;
                seen_section |= in_section;
                continue
            }
            if !in_section {
                continue
            }
            let Some((key, value)) = line.split_once('=').or_else(|| line.split_once(':')) else {
                return Err(RecordParseError::MalformedLine(number + 1))
            };
            fields.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
        }

        if !seen_section {
            return Err(RecordParseError::MissingSection)
        }

        let mut take = |key: &'static str| -> Result<String, RecordParseError> {
            fields.remove(&key.to_ascii_lowercase()).ok_or(RecordParseError::MissingField(key))
        };

        let upload_time = take("UploadTime")?;
        let storage = take("Storage").unwrap_or_default();
        Ok(SubmissionRecord {
            account: take("Account")?,
            submitting_user: take("SubmittingUser").ok(),
            assignment: take("Assignment")?,
            course_id: take("CourseID")?,
            upload_time: parse_time(&upload_time).map_err(|_| RecordParseError::InvalidValue { field: "UploadTime", value: upload_time.clone() })?,
            storage: StorageKind::parse_field(&storage).ok_or(RecordParseError::InvalidValue { field: "Storage", value: storage.clone() })?,
            results_dest: PathBuf::from(take("ResultsDest")?),
            remote_username: take("RemoteUsername")?,
            remote_hostname: take("RemoteHostname")?,
        })
    }
}

#[cfg(test)]
mod test {
    use chrono::NaiveDate;

    use super::{RecordParseError, StorageKind, SubmissionRecord};

    fn sample() -> SubmissionRecord {
        SubmissionRecord {
            account: "A1".to_owned(),
            submitting_user: None,
            assignment: "hw1".to_owned(),
            course_id: "c1".to_owned(),
            upload_time: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap(),
            storage: StorageKind::Standard,
            results_dest: "/srv/repo/hw1/A1/v/results".into(),
            remote_username: "storer".to_owned(),
            remote_hostname: "storer.example.org".to_owned(),
        }
    }

    #[test]
    fn document_layout() {
        let body = sample().to_document();
        assert!(body.starts_with("[Assignment]\n"));
        assert!(body.contains("UploadTime = 2024-03-01 10:00:00\n"));
        assert!(body.contains("Storage = standard\n"));
        assert!(!body.contains("SubmittingUser"));
        assert_eq!(SubmissionRecord::from_document(&body).unwrap(), sample());

        let mut team = sample();
        team.submitting_user = Some("member".to_owned());
        team.storage = StorageKind::Large;
        assert_eq!(SubmissionRecord::from_document(&team.to_document()).unwrap(), team);
    }

    #[test]
    fn lower_case_keys() {
        let body = "[Assignment]\naccount = A1\nassignment = hw1\nuploadtime = 2024-03-01 10:00:00\n\
            courseid = c1\nstorage = \nresultsdest = /r\nremoteusername = u\nremotehostname = h\n";
        let record = SubmissionRecord::from_document(body).unwrap();
        assert_eq!(record.account, "A1");
        assert_eq!(record.storage, StorageKind::Standard);
    }

    #[test]
    fn rejects_broken_documents() {
        assert_eq!(SubmissionRecord::from_document("Account = A1\n"), Err(RecordParseError::MissingSection));
        let body = sample().to_document().replace("Account = A1\n", "");
        assert_eq!(SubmissionRecord::from_document(&body), Err(RecordParseError::MissingField("Account")));
        let body = sample().to_document().replace("2024-03-01 10:00:00", "yesterday");
        assert!(matches!(SubmissionRecord::from_document(&body), Err(RecordParseError::InvalidValue { field: "UploadTime", .. })));
        let body = sample().to_document().replace("Storage = standard", "Storage = huge");
        assert!(matches!(SubmissionRecord::from_document(&body), Err(RecordParseError::InvalidValue { field: "Storage", .. })));
    }

    #[test]
    fn storage_field() {
        assert_eq!(StorageKind::parse_field(""), Some(StorageKind::Standard));
        assert_eq!(StorageKind::parse_field("LARGE"), Some(StorageKind::Large));
        assert_eq!(StorageKind::parse_field("zip"), None);
        assert_eq!(StorageKind::Large.to_string(), "large");
    }
}
