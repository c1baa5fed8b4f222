//! Admission policy: submission window, hard deadline and rate limit.
//!
//! Stages run in that order and the first failure wins. Only the rate limit
//! depends on history and only the rate limit can be skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta};
use log::info;

use crate::course::{AssignmentConfig, UploadWindow};
use crate::error::{Error, Result};
use crate::index::SubmissionIndex;
use crate::timestamp::Clock;

/// Slack granted past a hard deadline
pub const DEADLINE_GRACE: Duration = Duration::from_secs(60);

/// Which prior event the minimum submission interval is measured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RateLimitBasis {
    LastUpload,
    LastEvalQueueing,
}

fn add(time: NaiveDateTime, duration: Duration) -> NaiveDateTime {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| time.checked_add_signed(delta))
        .unwrap_or(NaiveDateTime::MAX)
}

pub fn check_window(upload_time: NaiveDateTime, window: &UploadWindow) -> Result<()> {
    if upload_time < window.start || upload_time > window.stop {
        return Err(Error::OutsideSubmissionWindow { upload_time, start: window.start, stop: window.stop })
    }
    Ok(())
}

pub fn check_hard_deadline(upload_time: NaiveDateTime, assignment: &str, config: &AssignmentConfig) -> Result<()> {
    if !config.hard_deadline {
        return Ok(())
    }
    let Some(deadline) = config.deadline else {
        return Err(Error::InvalidConfiguration(format!("assignment {assignment} has a hard deadline but no deadline")))
    };
    if upload_time > add(deadline, DEADLINE_GRACE) {
        return Err(Error::PastHardDeadline { deadline, upload_time })
    }
    Ok(())
}

pub fn check_rate_limit(now: NaiveDateTime, previous: Option<NaiveDateTime>, min_interval: Duration) -> Result<()> {
    let Some(previous) = previous else {
        return Ok(())
    };
    let next_allowed = add(previous, min_interval);
    if next_allowed > now {
        return Err(Error::TooSoonAfterPrevious { min_interval, previous, next_allowed })
    }
    Ok(())
}

/// One attempt to be judged
#[derive(Debug, Clone, Copy)]
pub struct Attempt<'a> {
    pub course: &'a str,
    pub assignment: &'a str,
    pub account: &'a str,
    pub upload_time: NaiveDateTime,
    pub window: &'a UploadWindow,
    pub config: &'a AssignmentConfig,
    /// `None` skips the rate limit entirely
    pub rate_limit: Option<RateLimitBasis>,
}

pub struct PolicyChecker {
    index: Arc<dyn SubmissionIndex>,
    clock: Arc<dyn Clock>,
}

impl PolicyChecker {
    pub fn new(index: Arc<dyn SubmissionIndex>, clock: Arc<dyn Clock>) -> Self {
        Self { index, clock }
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub async fn check(&self, attempt: &Attempt<'_>) -> Result<()> {
        let result = self.evaluate(attempt).await;
        if let Err(err) = &result {
            info!("Rejected {} submission of {}/{}: {err}", attempt.account, attempt.course, attempt.assignment);
        }
        result
    }

    async fn evaluate(&self, attempt: &Attempt<'_>) -> Result<()> {
        check_window(attempt.upload_time, attempt.window)?;
        check_hard_deadline(attempt.upload_time, attempt.assignment, attempt.config)?;

        let Some(basis) = attempt.rate_limit else {
            return Ok(())
        };
        let previous = match basis {
            RateLimitBasis::LastUpload => self.index.last_upload_time(attempt.course, attempt.assignment, attempt.account).await,
            RateLimitBasis::LastEvalQueueing => self.index.last_eval_queueing_time(attempt.course, attempt.assignment, attempt.account).await,
        };
        check_rate_limit(self.clock.now(), previous, attempt.config.min_submit_interval)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{NaiveDate, NaiveDateTime};

    use crate::course::{AssignmentConfig, UploadWindow};
    use crate::error::Error;
    use crate::index::{FileIndex, SubmissionIndex};
    use crate::paths::StorerPaths;
    use crate::tests::ManualClock;

    use super::{check_hard_deadline, check_rate_limit, check_window, Attempt, PolicyChecker, RateLimitBasis};

    fn at(day: u32, hour: u32, min: u32, sec: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap().and_hms_opt(hour, min, sec).unwrap()
    }

    fn march() -> UploadWindow {
        UploadWindow { start: at(1, 0, 0, 0), stop: at(31, 23, 59, 59) }
    }

    fn assignment(deadline: Option<NaiveDateTime>, hard: bool, interval: u64) -> AssignmentConfig {
        AssignmentConfig {
            machine: "vm".to_owned(),
            deadline,
            hard_deadline: hard,
            min_submit_interval: Duration::from_secs(interval),
            max_size: 1 << 20,
            storage: Default::default(),
            submit_only: false,
        }
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let window = march();
        check_window(at(1, 0, 0, 0), &window).unwrap();
        check_window(at(31, 23, 59, 59), &window).unwrap();
        match check_window(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap().and_hms_opt(23, 59, 59).unwrap(), &window) {
            Err(err @ Error::OutsideSubmissionWindow { .. }) => {
                let message = err.to_string();
                assert!(message.contains("2024-03-01 00:00:00"), "{message}");
                assert!(message.contains("2024-03-31 23:59:59"), "{message}");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn hard_deadline_grace() {
        let config = assignment(Some(at(10, 12, 0, 0)), true, 0);
        check_hard_deadline(at(10, 12, 1, 0), "hw1", &config).unwrap();
        assert!(matches!(check_hard_deadline(at(10, 12, 1, 1), "hw1", &config), Err(Error::PastHardDeadline { .. })));

        let soft = assignment(Some(at(10, 12, 0, 0)), false, 0);
        check_hard_deadline(at(20, 0, 0, 0), "hw1", &soft).unwrap();

        let broken = assignment(None, true, 0);
        assert!(matches!(check_hard_deadline(at(10, 0, 0, 0), "hw1", &broken), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn rate_limit() {
        let interval = Duration::from_secs(3600);
        check_rate_limit(at(1, 10, 30, 0), None, interval).unwrap();
        check_rate_limit(at(1, 11, 0, 0), Some(at(1, 10, 0, 0)), interval).unwrap();
        match check_rate_limit(at(1, 10, 30, 0), Some(at(1, 10, 0, 0)), interval) {
            Err(Error::TooSoonAfterPrevious { next_allowed, .. }) => assert_eq!(next_allowed, at(1, 11, 0, 0)),
            other => panic!("{other:?}"),
        }
    }

    #[tokio::test]
    async fn stages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(FileIndex::new(StorerPaths::new(dir.path().to_owned())));
        let clock = Arc::new(ManualClock::new(at(1, 10, 30, 0)));
        let checker = PolicyChecker::new(index.clone(), clock.clone());
        index.record_upload("c1", "hw1", "A1", at(1, 10, 0, 0)).await.unwrap();

        let window = march();
        let config = assignment(Some(at(1, 9, 0, 0)), true, 3600);
        let mut attempt = Attempt {
            course: "c1",
            assignment: "hw1",
            account: "A1",
            upload_time: at(1, 10, 30, 0),
            window: &window,
            config: &config,
            rate_limit: Some(RateLimitBasis::LastUpload),
        };

        // deadline is judged before history
        assert!(matches!(checker.check(&attempt).await, Err(Error::PastHardDeadline { .. })));

        let config = assignment(None, false, 3600);
        attempt.config = &config;
        assert!(matches!(checker.check(&attempt).await, Err(Error::TooSoonAfterPrevious { .. })));

        // history of the same assignment in another course doesn't count
        attempt.course = "c2";
        checker.check(&attempt).await.unwrap();
        attempt.course = "c1";

        // the other basis has no history yet
        attempt.rate_limit = Some(RateLimitBasis::LastEvalQueueing);
        checker.check(&attempt).await.unwrap();

        attempt.rate_limit = None;
        checker.check(&attempt).await.unwrap();

        attempt.rate_limit = Some(RateLimitBasis::LastUpload);
        clock.set(at(1, 11, 0, 1));
        checker.check(&attempt).await.unwrap();

        // the window is judged before everything else
        attempt.upload_time = at(1, 0, 0, 0) - chrono::TimeDelta::seconds(1);
        assert!(matches!(checker.check(&attempt).await, Err(Error::OutsideSubmissionWindow { .. })));
    }
}
