//! Entry point wrapping a job body in a logged run

use super::{CloseReport, RunLogger};
use crate::config::RunOptions;
use crate::error::{CrashLockError, Error, Result};
use crate::pool::panic_message;
use crate::types::{ErrorSource, ErrorValue, RunState};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::process::ExitCode;
use std::sync::Arc;

/// Exit code of a failed run
pub const EXIT_FAILURE: i32 = 1;

/// Exit code when a singleton job is already running
pub const EXIT_ALREADY_RUNNING: i32 = 2;

/// How a wrapped run ended
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Process exit code to return
    pub exit_code: i32,
    /// Close report (None when the run could not start)
    pub close: Option<CloseReport>,
}

impl RunReport {
    /// The exit code as a process [`ExitCode`]
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(u8::try_from(self.exit_code).unwrap_or(1))
    }
}

/// Run `body` under a [`RunLogger`] and return the process exit code
///
/// ```no_run
/// use alf_run::{RunOptions, run};
///
/// #[tokio::main]
/// async fn main() -> std::process::ExitCode {
///     let options = RunOptions::new("nightly", "/var/log/batch");
///     run(options, |logger| async move {
///         logger.log("refreshing tiles")?;
///         Ok(())
///     })
///     .await
/// }
/// ```
pub async fn run<F, Fut>(options: RunOptions, body: F) -> ExitCode
where
    F: FnOnce(Arc<RunLogger>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    execute(options, body).await.exit_code()
}

/// [`run`] returning the full report
///
/// The body's end decides the run state: `Ok` is a clean return,
/// `Err(Error::Exit)` an explicit exit (clean when the code is 0), any other
/// error, a panic or SIGTERM/SIGINT an uncaught failure, which always exits
/// with [`EXIT_FAILURE`]. The logger is closed in every case.
pub async fn execute<F, Fut>(options: RunOptions, body: F) -> RunReport
where
    F: FnOnce(Arc<RunLogger>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let nickname = options.nickname.clone();
    let logger = match RunLogger::open(options).await {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            let exit_code = match &e {
                Error::CrashLock(CrashLockError::AlreadyRunning { .. }) => EXIT_ALREADY_RUNNING,
                _ => EXIT_FAILURE,
            };
            tracing::error!(nickname = %nickname, error = %e, "run could not start");
            eprintln!("{nickname}: {e}");
            return RunReport {
                exit_code,
                close: None,
            };
        }
    };
    logger.install_tracing();

    let guarded = AssertUnwindSafe({
        let logger = logger.clone();
        async move { body(logger).await }
    })
    .catch_unwind();
    let ended = tokio::select! {
        ended = guarded => ended,
        signal = wait_for_signal() => Ok(Err(Error::Other(format!("interrupted by {signal}")))),
    };

    let mut exit_code = 0;
    match ended {
        Ok(Ok(())) => logger.record_exit(RunState::CleanReturn, None),
        Ok(Err(Error::Exit(request))) if request.code == 0 => {
            if let Some(message) = &request.message {
                logger.log(message).ok();
            }
            logger.record_exit(RunState::CleanReturn, None);
        }
        Ok(Err(Error::Exit(request))) => {
            exit_code = request.code;
            let message = request
                .message
                .unwrap_or_else(|| format!("exit code {}", request.code));
            logger.report_failure(&format!("Exit requested: {message}"));
            logger.record_exit(
                RunState::ExplicitExit,
                Some(ErrorValue {
                    source: ErrorSource::Exit(request.code),
                    message,
                }),
            );
        }
        Ok(Err(e)) => {
            exit_code = EXIT_FAILURE;
            logger.report_failure(&format!("Uncaught error: {e}\n{e:?}"));
            logger.record_exit(
                RunState::ExceptionRaised,
                Some(ErrorValue {
                    source: ErrorSource::Uncaught,
                    message: e.to_string(),
                }),
            );
        }
        Err(payload) => {
            exit_code = EXIT_FAILURE;
            let message = format!("panic: {}", panic_message(payload.as_ref()));
            logger.report_failure(&message);
            logger.record_exit(
                RunState::ExceptionRaised,
                Some(ErrorValue {
                    source: ErrorSource::Uncaught,
                    message,
                }),
            );
        }
    }

    let close = logger.close().await;
    if exit_code == 0 && close.error.is_some() && logger.options().exit_return_error {
        exit_code = EXIT_FAILURE;
    }
    RunReport {
        exit_code,
        close: Some(close),
    }
}

/// Resolve with the signal's name once SIGTERM or SIGINT arrives
///
/// Never resolves when no handler can be registered.
#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    // registration may fail in restricted environments (containers, tests)
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            "SIGINT"
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            "SIGTERM"
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers");
            std::future::pending().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "Ctrl+C",
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
            std::future::pending().await
        }
    }
}
