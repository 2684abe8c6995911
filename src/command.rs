//! Command Runner: spawn an external process and watch it
//!
//! The child's stdout and stderr are collected into one buffer. Every poll
//! cycle (250 ms) the runner checks whether the buffer grew, which resets
//! the inactivity countdown, and asks the optional timer hook what to do
//! with the countdown. A countdown that reaches zero kills the child and
//! fails with [`Error::Timeout`].

use crate::error::{Error, Result};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Delimiter marking a secret inside an argument: `--pass=##secret##`
pub const MASK_MARK: &str = "##";

/// What secrets look like in logs and on the console
pub const MASK: &str = "********";

/// Poll cadence of the runner
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Timer hook verdict for one poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerVerdict {
    /// Let the countdown run
    Tick,
    /// Restart the countdown as if output had arrived
    Reset,
    /// Freeze the countdown for this cycle
    Hold,
}

/// Result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (None when terminated by a signal)
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, split into lines
    pub lines: Vec<String>,
}

impl CommandOutput {
    /// True when the process exited with code 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Split arguments into what is shown and what is passed to the child
///
/// With `mask_password`, text between a pair of [`MASK_MARK`] is replaced by
/// [`MASK`] in the display copy and unwrapped in the real copy.
pub fn mask_args(args: &[String], mask_password: bool) -> (Vec<String>, Vec<String>) {
    if !mask_password {
        return (args.to_vec(), args.to_vec());
    }
    args.iter()
        .map(|arg| {
            let mut shown = String::new();
            let mut real = String::new();
            let mut rest = arg.as_str();
            while let Some(start) = rest.find(MASK_MARK) {
                let after = &rest[start + MASK_MARK.len()..];
                let Some(end) = after.find(MASK_MARK) else {
                    break;
                };
                shown.push_str(&rest[..start]);
                real.push_str(&rest[..start]);
                shown.push_str(MASK);
                real.push_str(&after[..end]);
                rest = &after[end + MASK_MARK.len()..];
            }
            shown.push_str(rest);
            real.push_str(rest);
            (shown, real)
        })
        .unzip()
}

/// Run `args[0]` with the remaining arguments and wait for it
///
/// `timeout` is an inactivity timeout: it restarts whenever the child
/// produces output. `timer_hook` is consulted once per poll cycle.
pub async fn call_command_line<H>(
    args: &[String],
    description: &str,
    timeout: Option<Duration>,
    mut timer_hook: H,
    mask_password: bool,
) -> Result<CommandOutput>
where
    H: FnMut() -> TimerVerdict,
{
    let (shown, real) = mask_args(args, mask_password);
    let Some((program, rest)) = real.split_first() else {
        return Err(Error::ExternalTool(format!("{description}: empty command line")));
    };
    tracing::info!(command = %shown.join(" "), "{description}");

    let mut child = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::ExternalTool(format!("{description}: failed to start {}: {e}", shown[0])))?;

    let buffer = Arc::new(Mutex::new(Vec::<u8>::new()));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(collect(stdout, buffer.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(collect(stderr, buffer.clone())));
    }

    let mut last_len = 0usize;
    let mut echoed = 0usize;
    let mut remaining = timeout;
    let mut last_tick = Instant::now();
    let mut interval = tokio::time::interval(POLL_INTERVAL);

    let status = loop {
        interval.tick().await;
        let elapsed = last_tick.elapsed();
        last_tick = Instant::now();

        if let Some(status) = child.try_wait()? {
            break status;
        }

        let len = buffer.lock().map(|b| b.len()).unwrap_or(last_len);
        let grew = len > last_len;
        last_len = len;
        echoed = echo_new_lines(&buffer, echoed);

        let verdict = timer_hook();
        if let (Some(limit), Some(left)) = (timeout, remaining.as_mut()) {
            match (grew, verdict) {
                (true, _) | (_, TimerVerdict::Reset) => *left = limit,
                (false, TimerVerdict::Hold) => {}
                (false, TimerVerdict::Tick) => *left = left.saturating_sub(elapsed),
            }
            if left.is_zero() {
                tracing::warn!(command = %shown.join(" "), "{description}: no activity, killing");
                child.kill().await.ok();
                return Err(Error::Timeout {
                    what: description.to_string(),
                    seconds: limit.as_secs(),
                });
            }
        }
    };

    for reader in readers {
        reader.await.ok();
    }
    echo_new_lines(&buffer, echoed);

    let text = buffer
        .lock()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    let lines = text.lines().map(str::to_string).collect();

    tracing::debug!(code = ?status.code(), "{description}: finished");
    Ok(CommandOutput {
        exit_code: status.code(),
        lines,
    })
}

async fn collect<R: AsyncRead + Unpin>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

/// Emit complete lines past `from` as tracing events; returns the new offset
fn echo_new_lines(buffer: &Mutex<Vec<u8>>, from: usize) -> usize {
    let Ok(buf) = buffer.lock() else {
        return from;
    };
    let Some(last_newline) = buf[from..].iter().rposition(|b| *b == b'\n') else {
        return from;
    };
    let end = from + last_newline + 1;
    for line in String::from_utf8_lossy(&buf[from..end]).lines() {
        tracing::info!(target: "alf_run::command", "{line}");
    }
    end
}
