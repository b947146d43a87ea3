use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

#[derive(Debug)]
enum SinkTarget {
    Stderr,
    Stdout,
    File(File),
    Closed,
}

/// Destination of the daemon log stream.
///
/// A cheap cloneable handle: one clone is installed as the logger output at
/// startup, the controller keeps another one to redirect the stream once the
/// log file is known, to hand it to the classifier for rule listings and to
/// flush and close it on shutdown.
#[derive(Debug, Clone)]
pub struct LogSink {
    inner: Arc<Mutex<SinkTarget>>,
}

impl LogSink {
    /// Sink writing to standard error, used until the configured destination
    /// has been opened.
    pub fn stderr() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SinkTarget::Stderr)),
        }
    }

    fn target(&self) -> MutexGuard<'_, SinkTarget> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Redirects the stream to `path`, opened in append mode.
    pub fn open_file(&self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.target() = SinkTarget::File(file);
        Ok(())
    }

    pub fn use_stdout(&self) {
        *self.target() = SinkTarget::Stdout;
    }

    pub fn is_stdout(&self) -> bool {
        matches!(*self.target(), SinkTarget::Stdout)
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.target(), SinkTarget::Closed)
    }

    /// Flushes and releases the destination. Later writes are discarded.
    ///
    /// The destination is released even when the final flush fails.
    pub fn close(&self) -> io::Result<()> {
        let mut target = self.target();
        let flushed = flush_target(&mut target);
        *target = SinkTarget::Closed;
        flushed
    }
}

fn flush_target(target: &mut SinkTarget) -> io::Result<()> {
    match target {
        SinkTarget::Stderr => io::stderr().flush(),
        SinkTarget::Stdout => io::stdout().flush(),
        SinkTarget::File(file) => file.flush(),
        SinkTarget::Closed => Ok(()),
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.target() {
            SinkTarget::Stderr => io::stderr().write(buf),
            SinkTarget::Stdout => io::stdout().write(buf),
            SinkTarget::File(file) => file.write(buf),
            SinkTarget::Closed => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        flush_target(&mut self.target())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use cgroup_rules::test_utils::TempDir;

    use super::*;

    #[test]
    fn file_sink_appends() {
        let dir = TempDir::new("log-sink").unwrap();
        let path = dir.write("cgrulesd.log", "previous run\n").unwrap();

        let mut sink = LogSink::stderr();
        sink.open_file(&path).unwrap();
        writeln!(sink, "Proceeding with PID 42").unwrap();
        sink.flush().unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "previous run\nProceeding with PID 42\n"
        );
    }

    #[test]
    fn clones_share_destination() {
        let dir = TempDir::new("log-sink").unwrap();
        let path = dir.join("cgrulesd.log");

        let sink = LogSink::stderr();
        let mut logger_side = sink.clone();
        sink.open_file(&path).unwrap();
        write!(logger_side, "redirected").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "redirected");
    }

    #[test]
    fn closed_sink_discards() {
        let dir = TempDir::new("log-sink").unwrap();
        let path = dir.join("cgrulesd.log");

        let mut sink = LogSink::stderr();
        sink.open_file(&path).unwrap();
        sink.close().unwrap();
        assert!(sink.is_closed());
        assert_eq!(sink.write(b"late line").unwrap(), 9);
        sink.close().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn missing_directory() {
        let sink = LogSink::stderr();
        assert!(sink.open_file(Path::new("/nonexistent/dir/cgrulesd.log")).is_err());
        assert!(!sink.is_stdout());
        sink.use_stdout();
        assert!(sink.is_stdout());
    }

    #[test]
    fn close_flushes_pending_output() {
        let dir = TempDir::new("log-sink").unwrap();
        let path = dir.join("cgrulesd.log");

        let mut sink = LogSink::stderr();
        sink.open_file(&path).unwrap();
        write!(sink, "Stopped CGroup Rules Engine Daemon").unwrap();
        assert!(sink.close().is_ok());

        assert!(sink.is_closed());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "Stopped CGroup Rules Engine Daemon"
        );
    }
}
