//! Closing sequence of a run

use super::counters::{MailDetail, MailKind, RunRecord, plan_notification};
use super::crash_lock::{RELEASE_ATTEMPTS, RELEASE_PAUSE};
use super::detail::EMAIL_SECTION;
use super::{RunLogger, Stream, lock};
use crate::mailer::MailMessage;
use crate::types::{ErrorSource, ErrorValue, MailState, RunState};
use crate::utils::{format_elapsed, with_stem_suffix};
use chrono::Local;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

/// What [`RunLogger::close`] did
#[derive(Debug, Clone)]
pub struct CloseReport {
    /// Outcome class used for counters and e-mail
    pub mail_state: MailState,
    /// Final error value
    pub error: Option<ErrorValue>,
    /// E-mail that was sent
    pub mail_sent: Option<MailKind>,
    /// Why a failure e-mail was held back
    pub mail_suppressed: Option<String>,
    /// Error log left on disk (None when it was deleted)
    pub error_log: Option<PathBuf>,
    /// Run duration
    pub elapsed: std::time::Duration,
}

struct Notified {
    state: MailState,
    sent: Option<MailKind>,
    suppressed: Option<String>,
}

impl RunLogger {
    /// Close the run; later and concurrent calls get the same report
    pub async fn close(&self) -> CloseReport {
        self.report.get_or_init(|| self.close_once()).await.clone()
    }

    async fn close_once(&self) -> CloseReport {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.session).state = RunState::Closing;

        self.close_pools().await;

        let crash_lock = lock(&self.crash_lock).take();
        if let Some(crash_lock) = crash_lock
            && let Err(e) = crash_lock.release(RELEASE_ATTEMPTS, RELEASE_PAUSE).await
        {
            tracing::warn!(error = %e, "crash lock not released");
            self.hub.log(&format!("WARNING: {e}")).ok();
        }

        let elapsed = self.elapsed();
        let notified = self.notify(elapsed).await;

        let finished = format!(
            "Finished: {} (Elapsed: {})",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            format_elapsed(elapsed)
        );
        self.hub.log(&finished).ok();
        if let Err(e) = writeln!(std::io::stdout(), "{finished}") {
            tracing::debug!(error = %e, "console unavailable");
        }

        let error = self.error();
        let outcome = match &error {
            Some(error) => format!("Failed: {error}"),
            None => "Succeeded".to_string(),
        };
        self.hub
            .archive(&format!("{outcome} (Elapsed: {})", format_elapsed(elapsed)), false)
            .ok();

        self.hub.close_error_log();
        let error_log = self.dispose_error_log(error.is_some());
        self.hub.close();
        lock(&self.session).state = RunState::Closed;

        CloseReport {
            mail_state: notified.state,
            error,
            mail_sent: notified.sent,
            mail_suppressed: notified.suppressed,
            error_log,
            elapsed,
        }
    }

    /// Close pools gracefully, or terminate them when the run failed
    async fn close_pools(&self) {
        let failed = self.error().is_some();
        let pools = lock(&self.pools).clone();
        for pool in pools {
            let result = if failed {
                pool.terminate().await
            } else {
                pool.close().await
            };
            if let Err(e) = result {
                tracing::warn!(pool = %pool.description(), error = %e, "pool did not close cleanly");
            }
        }
    }

    /// Decide, compose and send the notification; persist the counters
    async fn notify(&self, elapsed: std::time::Duration) -> Notified {
        let config = self.mailer.config();
        let mut detail: MailDetail = self.details.load_detail(EMAIL_SECTION);
        detail.normalize(config.period_slots());

        let flag = lock(&self.session).flag.clone();
        let mut state = if self.error().is_some() {
            MailState::Failure
        } else if self.premature.is_some() {
            MailState::PrematureExit
        } else {
            MailState::Success
        };
        let mut run = RunRecord {
            start: self.start,
            elapsed,
            state,
            flagged: flag.is_some() && state == MailState::Success,
        };
        let rollover = detail.rollover(self.start, config.period_hours);
        let plan = plan_notification(config, &detail, state, run.flagged, &rollover);
        if let Some(reason) = &plan.suppressed {
            self.hub.log(&format!("Failure e-mail suppressed: {reason}")).ok();
            self.mail_log(&format!("suppressed: {reason}"));
        }

        let mut sent = None;
        if let Some(kind) = plan.kind
            && self.mailer.is_active()
        {
            let mut preview = detail.clone();
            preview.fold(&run, &rollover);
            let message = self.compose(kind, &preview, flag.as_deref(), elapsed);
            match self.mailer.send_email(&message).await {
                Ok(delivery) => {
                    sent = Some(kind);
                    self.mail_log(&format!(
                        "sent {} via {} (attempt {}): {}",
                        kind.label(),
                        delivery.server,
                        delivery.attempt,
                        message.subject
                    ));
                    if !delivery.unverified.is_empty() {
                        self.hub
                            .log(&format!("Unverified recipients: {}", delivery.unverified.join(", ")))
                            .ok();
                    }
                }
                Err(e) => {
                    self.mail_log(&format!("FAILED {}: {e}", kind.label()));
                    self.set_error_value(ErrorValue {
                        source: ErrorSource::SendMail,
                        message: e.to_string(),
                    });
                    if state == MailState::Success {
                        state = MailState::Failure;
                    }
                }
            }
        }

        run.state = state;
        if state != MailState::Success {
            run.flagged = false;
        }
        detail.fold(&run, &rollover);
        detail.roll(&rollover);
        detail.finish(&run, &rollover, sent);
        if let Err(e) = self.details.save_detail(EMAIL_SECTION, &detail) {
            tracing::warn!(error = %e, "cannot save run counters");
            self.hub.log(&format!("WARNING: cannot save run counters: {e}")).ok();
        }

        Notified {
            state,
            sent,
            suppressed: plan.suppressed,
        }
    }

    fn compose(
        &self,
        kind: MailKind,
        detail: &MailDetail,
        flag: Option<&str>,
        elapsed: std::time::Duration,
    ) -> MailMessage {
        let nickname = self.nickname();
        let error = self.error();
        let mut subject = format!("{nickname}: {}", kind.label());
        if let Some(error) = &error
            && let Some(first) = error.message.lines().next()
        {
            subject.push_str(" - ");
            subject.push_str(first);
        }

        let mut body = String::new();
        // writing to a String cannot fail
        let _ = writeln!(body, "Job:      {nickname}");
        let _ = writeln!(body, "Started:  {}", self.start.format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(body, "Elapsed:  {}", format_elapsed(elapsed));
        let _ = writeln!(body, "Outcome:  {}", kind.label());
        if let Some(error) = &error {
            let _ = writeln!(body, "Error:    {error}");
        }
        if let Some(flag) = flag {
            let _ = writeln!(body, "Caution:  {flag}");
        }
        if let Some(premature) = &self.premature {
            let _ = writeln!(body, "Note:     {premature}");
        }
        if self.parallel {
            let _ = writeln!(body, "Note:     ran in parallel with another run of this job");
        }
        let _ = writeln!(body);
        body.push_str(&detail.summary(self.mailer.config().period_hours));

        if self.mailer.config().verbose {
            self.hub.flush().ok();
            if let Ok(activity) = std::fs::read_to_string(&self.paths.activity) {
                let _ = writeln!(body, "\n--- Activity log ---");
                body.push_str(&activity);
            }
        }

        let mut message = MailMessage::new(subject, body);
        if kind.is_failure() && error.is_some() {
            self.hub.flush().ok();
            message = message.attach(&self.paths.error_log);
        }
        message
    }

    /// Append a line to the monthly notification log
    fn mail_log(&self, line: &str) {
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.mail_log)
            .and_then(|mut file| {
                writeln!(file, "{} {line}", Local::now().format("%Y-%m-%d %H:%M:%S"))
            });
        if let Err(e) = result {
            tracing::warn!(path = %self.paths.mail_log.display(), error = %e, "cannot write mail log");
        }
    }

    /// Delete the Error log of a clean run, or keep it as `<name>_activity.txt`
    fn dispose_error_log(&self, failed: bool) -> Option<PathBuf> {
        let path = &self.paths.error_log;
        if failed {
            return Some(path.clone());
        }
        if self.options.keep_activity {
            let kept = with_stem_suffix(path, "_activity");
            return match std::fs::rename(path, &kept) {
                Ok(()) => Some(kept),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot keep activity copy");
                    Some(path.clone())
                }
            };
        }
        match std::fs::remove_file(path) {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot delete error log");
                Some(path.clone())
            }
        }
    }

    /// Write the failure text to the console error stream and the logs
    pub(crate) fn report_failure(&self, text: &str) {
        let mut line = text.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        if let Err(e) = self.hub.write_sink(line.as_bytes(), Stream::Stderr) {
            tracing::warn!(error = %e, "cannot write failure to run log");
        }
    }
}
