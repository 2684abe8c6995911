//! Run counters and the notification decision
//!
//! The mailer section of the details file keeps one counter for the day
//! and a ring of counters, one per period of `period_hours`. A run that
//! starts in a new period (or day) is the closing run of the previous one:
//! it is folded into the previous slot and the day totals, and only then
//! are the rolled-over counters zeroed.

use crate::config::{MailConfig, StatusCadence};
use crate::types::MailState;
use crate::utils::format_elapsed;
use chrono::{DateTime, Local, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

/// Counters for one bucket of runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodCounter {
    /// Clean runs
    pub successes: u32,
    /// Failed runs (premature exits included)
    pub failures: u32,
    /// Clean runs carrying a caution flag
    pub flags: u32,
    /// Longest gap between two run starts
    pub interval_secs: f64,
    /// Summed run time
    pub total_secs: f64,
    /// Shortest run
    pub min_secs: Option<f64>,
    /// Longest run
    pub max_secs: f64,
}

impl PeriodCounter {
    /// Runs counted in this bucket
    pub fn runs(&self) -> u32 {
        self.successes + self.failures + self.flags
    }

    fn fold(&mut self, run: &RunRecord, gap_secs: Option<f64>) {
        match (run.state, run.flagged) {
            (MailState::Success, false) => self.successes += 1,
            (MailState::Success, true) => self.flags += 1,
            (MailState::Failure | MailState::PrematureExit, _) => self.failures += 1,
        }
        let secs = run.elapsed.as_secs_f64();
        self.total_secs += secs;
        self.min_secs = Some(self.min_secs.map_or(secs, |m| m.min(secs)));
        self.max_secs = self.max_secs.max(secs);
        if let Some(gap) = gap_secs {
            self.interval_secs = self.interval_secs.max(gap);
        }
    }

    fn describe(&self) -> String {
        if self.runs() == 0 {
            return "no runs".to_string();
        }
        let secs = |s: f64| format_elapsed(Duration::from_secs_f64(s.max(0.0)));
        format!(
            "{} runs ({} ok, {} failed, {} flagged), avg {}, min {}, max {}, longest gap {}",
            self.runs(),
            self.successes,
            self.failures,
            self.flags,
            secs(self.total_secs / f64::from(self.runs())),
            secs(self.min_secs.unwrap_or_default()),
            secs(self.max_secs),
            secs(self.interval_secs),
        )
    }
}

/// The `email` section of the details file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailDetail {
    /// Calendar day of the previous run
    pub last_date: Option<NaiveDate>,
    /// Period index of the previous run
    pub last_period: Option<usize>,
    /// Outcome of the previous run
    pub last_state: MailState,
    /// Start of the previous run
    pub last_start: Option<DateTime<Local>>,
    /// Current failure streak
    pub consecutive_failures: u32,
    /// Failure e-mails sent in the current period
    pub failure_mails_this_period: u32,
    /// A failure e-mail went out during the current streak
    pub failure_sent: bool,
    /// Totals for the current day
    pub day: PeriodCounter,
    /// One counter per period of the day
    pub periods: Vec<PeriodCounter>,
}

/// What the closing run contributes to the counters
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// When the run started
    pub start: DateTime<Local>,
    /// How long it ran
    pub elapsed: Duration,
    /// Outcome class
    pub state: MailState,
    /// A caution flag was raised on a clean run
    pub flagged: bool,
}

/// Day/period boundaries crossed since the previous run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rollover {
    /// No previous run is recorded
    pub first_run: bool,
    /// The calendar day changed
    pub day: bool,
    /// The period changed (implied by a day change)
    pub period: bool,
    /// Period index of this run
    pub current_period: usize,
}

/// Kind of notification e-mail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailKind {
    /// The run failed
    Failure,
    /// The previous run exited prematurely
    PrematureExit,
    /// First clean run after a failure e-mail
    Recovered,
    /// Clean run, success messages enabled
    Success,
    /// Status summary only
    Status,
}

impl MailKind {
    /// Subject tag for this kind
    pub fn label(&self) -> &'static str {
        match self {
            MailKind::Failure => "FAILURE",
            MailKind::PrematureExit => "PREMATURE EXIT",
            MailKind::Recovered => "RECOVERED",
            MailKind::Success => "SUCCESS",
            MailKind::Status => "STATUS",
        }
    }

    /// Whether this e-mail reports a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, MailKind::Failure | MailKind::PrematureExit)
    }
}

/// Outcome of the notification decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// E-mail to send, if any
    pub kind: Option<MailKind>,
    /// A status summary is due this run
    pub status_due: bool,
    /// Why a failure e-mail was held back
    pub suppressed: Option<String>,
}

impl MailDetail {
    /// Repair a ring whose size does not match `slots` and a stale index
    pub fn normalize(&mut self, slots: usize) {
        if self.periods.len() != slots {
            self.periods = vec![PeriodCounter::default(); slots];
        }
        if self.last_period.is_some_and(|p| p >= slots) {
            self.last_period = None;
        }
    }

    /// Boundaries crossed between the previous run and `now`
    pub fn rollover(&self, now: DateTime<Local>, period_hours: u32) -> Rollover {
        let current_period = (now.hour() / period_hours.clamp(1, 24)) as usize;
        match self.last_date {
            None => Rollover {
                first_run: true,
                day: false,
                period: false,
                current_period,
            },
            Some(last) => {
                let day = now.date_naive() != last;
                Rollover {
                    first_run: false,
                    day,
                    period: day || self.last_period != Some(current_period),
                    current_period,
                }
            }
        }
    }

    /// Fold the closing run into the day totals and its period slot
    pub fn fold(&mut self, run: &RunRecord, rollover: &Rollover) {
        let slot = if rollover.period {
            self.last_period.unwrap_or(rollover.current_period)
        } else {
            rollover.current_period
        };
        let gap = self
            .last_start
            .map(|last| (run.start - last).num_milliseconds().max(0) as f64 / 1000.0);

        self.day.fold(run, gap);
        if let Some(counter) = self.periods.get_mut(slot) {
            counter.fold(run, gap);
        }

        match (run.state, run.flagged) {
            (MailState::Success, false) => self.consecutive_failures = 0,
            (MailState::Success, true) => {}
            (MailState::Failure | MailState::PrematureExit, _) => self.consecutive_failures += 1,
        }
    }

    /// Zero the counters whose day or period has ended
    pub fn roll(&mut self, rollover: &Rollover) {
        if rollover.day {
            self.day = PeriodCounter::default();
            self.periods.iter_mut().for_each(|p| *p = PeriodCounter::default());
        } else if rollover.period
            && let Some(counter) = self.periods.get_mut(rollover.current_period)
        {
            *counter = PeriodCounter::default();
        }
    }

    /// Record this run as the previous one and account for the e-mail sent
    pub fn finish(&mut self, run: &RunRecord, rollover: &Rollover, sent: Option<MailKind>) {
        if rollover.period {
            self.failure_mails_this_period = 0;
        }
        match sent {
            Some(kind) if kind.is_failure() => {
                self.failure_mails_this_period += 1;
                self.failure_sent = true;
            }
            _ => {}
        }
        if run.state == MailState::Success && !run.flagged {
            self.failure_sent = false;
        }
        self.last_date = Some(run.start.date_naive());
        self.last_period = Some(rollover.current_period);
        self.last_state = run.state;
        self.last_start = Some(run.start);
    }

    /// Counter table for the e-mail body
    pub fn summary(&self, period_hours: u32) -> String {
        let hours = period_hours.clamp(1, 24);
        let mut text = format!("Today: {}\n", self.day.describe());
        for (index, counter) in self.periods.iter().enumerate() {
            let from = index as u32 * hours;
            if from >= 24 || counter.runs() == 0 {
                continue;
            }
            let to = (from + hours).min(24);
            // writing to a String cannot fail
            let _ = writeln!(text, "  {from:02}:00-{to:02}:00  {}", counter.describe());
        }
        let _ = writeln!(text, "Consecutive failures: {}", self.consecutive_failures);
        text
    }
}

/// Decide which e-mail, if any, this run sends
///
/// `detail` is the state persisted by the previous run, before this run is
/// folded in. A due status summary overrides failure suppression.
pub fn plan_notification(
    config: &MailConfig,
    detail: &MailDetail,
    state: MailState,
    flagged: bool,
    rollover: &Rollover,
) -> Notification {
    let status_due = match config.status {
        StatusCadence::Never => false,
        StatusCadence::Day => rollover.day || rollover.first_run,
        StatusCadence::Period => rollover.period || rollover.first_run,
        StatusCadence::Every => true,
    };

    if state != MailState::Success {
        let kind = if state == MailState::PrematureExit {
            MailKind::PrematureExit
        } else {
            MailKind::Failure
        };
        let streak = detail.consecutive_failures + 1;
        let sent_this_period = if rollover.period {
            0
        } else {
            detail.failure_mails_this_period
        };
        let suppressed = if config.limit > 0 && sent_this_period >= config.limit {
            Some(format!(
                "{sent_this_period} failure e-mails already sent this period (limit {})",
                config.limit
            ))
        } else if !config.consecutive.contains(streak) {
            Some(format!("failure {streak} of the streak is outside the e-mail window"))
        } else {
            None
        };
        return match suppressed {
            Some(reason) if !status_due => Notification {
                kind: None,
                status_due,
                suppressed: Some(reason),
            },
            _ => Notification {
                kind: Some(kind),
                status_due,
                suppressed: None,
            },
        };
    }

    let kind = if detail.failure_sent && !flagged {
        Some(MailKind::Recovered)
    } else if config.success {
        Some(MailKind::Success)
    } else if status_due {
        Some(MailKind::Status)
    } else {
        None
    };
    Notification {
        kind,
        status_due,
        suppressed: None,
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsecutiveWindow;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, day, hour, minute, 0).unwrap()
    }

    fn record(start: DateTime<Local>, state: MailState) -> RunRecord {
        RunRecord {
            start,
            elapsed: Duration::from_secs(10),
            state,
            flagged: false,
        }
    }

    /// Run the whole close-time sequence against `detail`
    fn close_run(detail: &mut MailDetail, config: &MailConfig, run: &RunRecord) -> Notification {
        detail.normalize(config.period_slots());
        let rollover = detail.rollover(run.start, config.period_hours);
        let plan = plan_notification(config, detail, run.state, run.flagged, &rollover);
        detail.fold(run, &rollover);
        detail.roll(&rollover);
        detail.finish(run, &rollover, plan.kind);
        plan
    }

    #[test]
    fn first_run_is_not_a_rollover() {
        let detail = MailDetail::default();
        let rollover = detail.rollover(at(1, 9, 0), 4);
        assert!(rollover.first_run);
        assert!(!rollover.day && !rollover.period);
        assert_eq!(rollover.current_period, 2);
    }

    #[test]
    fn same_period_runs_accumulate() {
        let config = MailConfig::default();
        let mut detail = MailDetail::default();
        close_run(&mut detail, &config, &record(at(1, 9, 0), MailState::Success));
        close_run(&mut detail, &config, &record(at(1, 9, 30), MailState::Failure));

        assert_eq!(detail.day.successes, 1);
        assert_eq!(detail.day.failures, 1);
        assert_eq!(detail.periods[2].runs(), 2);
        assert_eq!(detail.periods[2].interval_secs, 1800.0);
        assert_eq!(detail.consecutive_failures, 1);
        assert_eq!(detail.last_period, Some(2));
    }

    #[test]
    fn closing_run_lands_in_previous_period() {
        let config = MailConfig::default();
        let mut detail = MailDetail::default();
        close_run(&mut detail, &config, &record(at(1, 9, 0), MailState::Success));
        close_run(&mut detail, &config, &record(at(1, 13, 0), MailState::Success));

        // 13:00 is period 3; the run closed period 2
        assert_eq!(detail.periods[2].successes, 2);
        assert_eq!(detail.periods[3].runs(), 0);
        assert_eq!(detail.day.successes, 2);
        assert_eq!(detail.last_period, Some(3));

        close_run(&mut detail, &config, &record(at(1, 14, 0), MailState::Success));
        assert_eq!(detail.periods[3].successes, 1);
    }

    #[test]
    fn day_rollover_zeroes_day_and_ring() {
        let config = MailConfig::default();
        let mut detail = MailDetail::default();
        close_run(&mut detail, &config, &record(at(1, 22, 0), MailState::Failure));
        close_run(&mut detail, &config, &record(at(2, 1, 0), MailState::Failure));

        assert_eq!(detail.day, PeriodCounter::default());
        assert!(detail.periods.iter().all(|p| p.runs() == 0));
        assert_eq!(detail.consecutive_failures, 2);
        assert_eq!(detail.last_date, Some(at(2, 1, 0).date_naive()));
    }

    #[test]
    fn wrong_sized_ring_is_rebuilt() {
        let mut detail = MailDetail {
            periods: vec![PeriodCounter::default(); 3],
            last_period: Some(9),
            ..Default::default()
        };
        detail.normalize(7);
        assert_eq!(detail.periods.len(), 7);
        assert_eq!(detail.last_period, None);
    }

    #[test]
    fn consecutive_window_suppresses_then_sends() {
        let config = MailConfig {
            consecutive: ConsecutiveWindow {
                min: 2,
                max: Some(3),
            },
            ..Default::default()
        };
        let mut detail = MailDetail::default();
        let kinds: Vec<Option<MailKind>> = (0..4)
            .map(|i| close_run(&mut detail, &config, &record(at(1, 9, i), MailState::Failure)).kind)
            .collect();
        assert_eq!(
            kinds,
            vec![None, Some(MailKind::Failure), Some(MailKind::Failure), None]
        );
        assert_eq!(detail.consecutive_failures, 4);
    }

    #[test]
    fn period_limit_caps_failure_mails() {
        let config = MailConfig {
            limit: 1,
            ..Default::default()
        };
        let mut detail = MailDetail::default();
        let first = close_run(&mut detail, &config, &record(at(1, 9, 0), MailState::Failure));
        let second = close_run(&mut detail, &config, &record(at(1, 9, 5), MailState::Failure));
        assert_eq!(first.kind, Some(MailKind::Failure));
        assert_eq!(second.kind, None);
        assert!(second.suppressed.is_some());

        // a new period resets the allowance
        let third = close_run(&mut detail, &config, &record(at(1, 13, 0), MailState::Failure));
        assert_eq!(third.kind, Some(MailKind::Failure));
    }

    #[test]
    fn status_due_overrides_suppression() {
        let config = MailConfig {
            limit: 1,
            status: StatusCadence::Every,
            ..Default::default()
        };
        let mut detail = MailDetail {
            failure_mails_this_period: 5,
            last_date: Some(at(1, 9, 0).date_naive()),
            last_period: Some(2),
            ..Default::default()
        };
        let plan = close_run(&mut detail, &config, &record(at(1, 9, 30), MailState::Failure));
        assert_eq!(plan.kind, Some(MailKind::Failure));
        assert!(plan.status_due);
    }

    #[test]
    fn success_after_failure_mail_sends_recovery_and_resets_streak() {
        let config = MailConfig::default();
        let mut detail = MailDetail::default();
        close_run(&mut detail, &config, &record(at(1, 9, 0), MailState::Failure));
        assert!(detail.failure_sent);

        let plan = close_run(&mut detail, &config, &record(at(1, 9, 10), MailState::Success));
        assert_eq!(plan.kind, Some(MailKind::Recovered));
        assert_eq!(detail.consecutive_failures, 0);
        assert!(!detail.failure_sent);

        let quiet = close_run(&mut detail, &config, &record(at(1, 9, 20), MailState::Success));
        assert_eq!(quiet.kind, None);
    }

    #[test]
    fn caution_flag_keeps_the_streak() {
        let config = MailConfig::default();
        let mut detail = MailDetail::default();
        close_run(&mut detail, &config, &record(at(1, 9, 0), MailState::Failure));
        let mut flagged = record(at(1, 9, 10), MailState::Success);
        flagged.flagged = true;
        let plan = close_run(&mut detail, &config, &flagged);

        assert_eq!(plan.kind, None);
        assert_eq!(detail.consecutive_failures, 1);
        assert_eq!(detail.day.flags, 1);
        assert_eq!(detail.day.successes, 0);
        assert!(detail.failure_sent);
    }

    #[test]
    fn premature_exit_counts_as_failure() {
        let config = MailConfig::default();
        let mut detail = MailDetail::default();
        let plan = close_run(&mut detail, &config, &record(at(1, 9, 0), MailState::PrematureExit));
        assert_eq!(plan.kind, Some(MailKind::PrematureExit));
        assert_eq!(detail.day.failures, 1);
        assert_eq!(detail.last_state, MailState::PrematureExit);
    }

    #[test]
    fn daily_status_on_first_run_of_day() {
        let config = MailConfig {
            status: StatusCadence::Day,
            ..Default::default()
        };
        let mut detail = MailDetail::default();
        close_run(&mut detail, &config, &record(at(1, 9, 0), MailState::Success));
        let same_day = close_run(&mut detail, &config, &record(at(1, 10, 0), MailState::Success));
        let next_day = close_run(&mut detail, &config, &record(at(2, 0, 5), MailState::Success));
        assert_eq!(same_day.kind, None);
        assert_eq!(next_day.kind, Some(MailKind::Status));
    }

    #[test]
    fn summary_lists_active_periods() {
        let config = MailConfig::default();
        let mut detail = MailDetail::default();
        close_run(&mut detail, &config, &record(at(1, 9, 0), MailState::Success));
        let text = detail.summary(config.period_hours);
        assert!(text.starts_with("Today: 1 runs (1 ok"));
        assert!(text.contains("08:00-12:00"));
        assert!(text.contains("Consecutive failures: 0"));
    }
}
