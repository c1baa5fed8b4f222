//! The textual timestamp format shared by submission records, course
//! configuration and the submission index.
//!
//! Times are naive local wall-clock times at one second granularity.

use chrono::{Local, NaiveDateTime, Timelike};

/// Format used for every timestamp written or read by the intake
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_time(time: &NaiveDateTime) -> String {
    time.format(DATE_FORMAT).to_string()
}

pub fn parse_time(value: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value.trim(), DATE_FORMAT)
}

/// Source of the current time, so policy decisions can be replayed in tests and tooling
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// The local wall clock, truncated to whole seconds
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        let now = Local::now().naive_local();
        now.with_nanosecond(0).unwrap_or(now)
    }
}

/// serde adapter for timestamps in [`DATE_FORMAT`]
pub mod text {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_time(time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let value = String::deserialize(deserializer)?;
        super::parse_time(&value).map_err(serde::de::Error::custom)
    }
}

/// serde adapter for optional timestamps in [`DATE_FORMAT`]
pub mod text_option {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error> {
        match time {
            Some(time) => serializer.serialize_some(&super::format_time(time)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(value) => super::parse_time(&value).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::{NaiveDate, Timelike};

    use super::{format_time, parse_time, Clock, SystemClock};

    #[test]
    fn text_format() {
        let time = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        assert_eq!(format_time(&time), "2024-03-01 10:00:00");
        assert_eq!(parse_time("2024-03-01 10:00:00").unwrap(), time);
        assert_eq!(parse_time(" 2024-03-01 10:00:00\n").unwrap(), time);
        assert!(parse_time("2024.03.01 10:00:00").is_err());
        assert!(parse_time("2024-03-01").is_err());
    }

    #[test]
    fn clock_is_whole_seconds() {
        let now = SystemClock.now();
        assert_eq!(now.nanosecond(), 0);
        assert_eq!(parse_time(&format_time(&now)).unwrap(), now);
    }
}
