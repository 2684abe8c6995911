//! Output sink shared by the run and its workers
//!
//! [`LogHub`] owns the three open log handles of a run. Every write through
//! the sink can echo to the console, is appended to the Activity log (with
//! an optional per-line timestamp) and is mirrored to the Error log. The
//! handles sit behind one mutex so writes from pool workers stay ordered.

use chrono::Local;
use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;

/// Console stream a sink write is echoed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

#[derive(Default)]
struct LogFiles {
    archive: Option<File>,
    activity: Option<File>,
    error: Option<File>,
    at_line_start: bool,
}

/// Shared handle to a run's Archive, Activity and Error logs
#[derive(Clone)]
pub struct LogHub {
    files: Arc<Mutex<LogFiles>>,
    echo: bool,
    timestamp_mask: Option<String>,
}

impl LogHub {
    /// Wrap already-open log handles
    pub fn new(
        archive: File,
        activity: File,
        error: File,
        echo: bool,
        timestamp_mask: Option<String>,
    ) -> Self {
        Self {
            files: Arc::new(Mutex::new(LogFiles {
                archive: Some(archive),
                activity: Some(activity),
                error: Some(error),
                at_line_start: true,
            })),
            echo,
            timestamp_mask,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogFiles> {
        // a panic while holding the lock leaves the files usable
        self.files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sink write: echo, Activity log (stamped), Error log mirror
    pub fn write_sink(&self, bytes: &[u8], stream: Stream) -> io::Result<()> {
        if self.echo {
            match stream {
                Stream::Stdout => io::stdout().write_all(bytes)?,
                Stream::Stderr => io::stderr().write_all(bytes)?,
            }
        }

        let mut files = self.lock();
        let stamped = self.stamp(bytes, &mut files.at_line_start);
        if let Some(activity) = files.activity.as_mut() {
            activity.write_all(&stamped)?;
        }
        if let Some(error) = files.error.as_mut() {
            error.write_all(bytes)?;
        }
        Ok(())
    }

    /// Insert the timestamp mask at the start of every line
    fn stamp(&self, bytes: &[u8], at_line_start: &mut bool) -> Vec<u8> {
        let Some(mask) = self.timestamp_mask.as_deref() else {
            if let Some(last) = bytes.last() {
                *at_line_start = *last == b'\n';
            }
            return bytes.to_vec();
        };
        let prefix = Local::now().format(mask).to_string();
        let mut out = Vec::with_capacity(bytes.len() + prefix.len());
        for byte in bytes {
            if *at_line_start {
                out.extend_from_slice(prefix.as_bytes());
            }
            out.push(*byte);
            *at_line_start = *byte == b'\n';
        }
        out
    }

    /// Append a dated line to the Archive log, optionally echoing it
    pub fn archive(&self, message: &str, echo: bool) -> io::Result<()> {
        let line = format!("{} {message}\n", Local::now().format("%Y-%m-%d %H:%M:%S"));
        if echo && self.echo {
            io::stdout().write_all(message.as_bytes())?;
            io::stdout().write_all(b"\n")?;
        }
        let mut files = self.lock();
        if let Some(archive) = files.archive.as_mut() {
            archive.write_all(line.as_bytes())?;
        }
        Ok(())
    }

    /// Append a line to the Activity log only
    pub fn log(&self, message: &str) -> io::Result<()> {
        let mut line = message.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let mut files = self.lock();
        let stamped = self.stamp(line.as_bytes(), &mut files.at_line_start);
        if let Some(activity) = files.activity.as_mut() {
            activity.write_all(&stamped)?;
        }
        Ok(())
    }

    /// Append worker log fragments to the Activity and Error logs
    pub fn append_merged(&self, bytes: &[u8]) -> io::Result<()> {
        let mut files = self.lock();
        if let Some(activity) = files.activity.as_mut() {
            activity.write_all(bytes)?;
        }
        if let Some(error) = files.error.as_mut() {
            error.write_all(bytes)?;
        }
        Ok(())
    }

    /// Flush every handle
    pub fn flush(&self) -> io::Result<()> {
        let files = &mut *self.lock();
        for file in [
            files.archive.as_mut(),
            files.activity.as_mut(),
            files.error.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            file.flush()?;
        }
        Ok(())
    }

    /// Flush and drop the handles; later writes are ignored
    ///
    /// Returns false when the handles were already closed.
    pub fn close(&self) -> bool {
        let mut files = self.lock();
        let was_open = files.activity.is_some() || files.error.is_some() || files.archive.is_some();
        for file in [
            files.archive.take(),
            files.activity.take(),
            files.error.take(),
        ]
        .into_iter()
        .flatten()
        {
            if let Err(e) = file.sync_all() {
                tracing::warn!(error = %e, "failed to sync run log");
            }
        }
        was_open
    }

    /// Close only the Error log (before deleting or renaming it)
    pub fn close_error_log(&self) {
        let mut files = self.lock();
        if let Some(file) = files.error.take() {
            file.sync_all().ok();
        }
    }

    /// A writer for `stream` that goes through the sink
    pub fn writer(&self, stream: Stream) -> RunWriter {
        RunWriter {
            hub: self.clone(),
            stream,
        }
    }
}

/// `io::Write` front of the sink, one per console stream
#[derive(Clone)]
pub struct RunWriter {
    hub: LogHub,
    stream: Stream,
}

impl Write for RunWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hub.write_sink(buf, self.stream)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stream {
            Stream::Stdout => io::stdout().flush()?,
            Stream::Stderr => io::stderr().flush()?,
        }
        self.hub.flush()
    }
}

impl<'a> MakeWriter<'a> for LogHub {
    type Writer = RunWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer(Stream::Stdout)
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        if *meta.level() <= tracing::Level::WARN {
            self.writer(Stream::Stderr)
        } else {
            self.writer(Stream::Stdout)
        }
    }
}
