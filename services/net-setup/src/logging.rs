//! Logging initialization.
//!
//! net-setup runs once per guest start, so the log file is rewritten on every
//! run and capped at [`MAX_LOG_BYTES`]. Events also go to stderr for whoever
//! launched the container. A single `EnvFilter` on the registry gates both
//! outputs.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maximum log file size (1 MB).
pub const MAX_LOG_BYTES: usize = 1024 * 1024;

/// Filter used when `RUST_LOG` is unset or unparsable.
const DEFAULT_DIRECTIVES: &str = "info";

struct CappedFile {
    file: File,
    bytes_written: usize,
    max_bytes: usize,
}

/// Handle to a log file that drops output past a byte budget.
///
/// Cloning shares the file and the budget.
#[derive(Clone)]
pub struct CappedLog(Arc<Mutex<CappedFile>>);

impl CappedLog {
    /// Create (or truncate) `path`, creating parent directories.
    pub fn create(path: &Path, max_bytes: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self(Arc::new(Mutex::new(CappedFile {
            file,
            bytes_written: 0,
            max_bytes,
        }))))
    }

    fn lock(&self) -> MutexGuard<'_, CappedFile> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Write for CappedLog {
    /// Always reports the full buffer as written so the formatter never
    /// retries once the budget is spent.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        let remaining = inner.max_bytes.saturating_sub(inner.bytes_written);
        if remaining > 0 {
            let to_write = buf.len().min(remaining);
            inner.file.write_all(&buf[..to_write])?;
            inner.bytes_written += to_write;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().file.flush()
    }
}

impl<'a> MakeWriter<'a> for CappedLog {
    type Writer = CappedLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Filter from `RUST_LOG`-style directives, falling back to `info`.
pub fn env_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// JSON to `log`, compact to `stderr`, both behind `filter`.
pub fn subscriber<W>(
    log: CappedLog,
    stderr: W,
    filter: EnvFilter,
) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_writer(log))
        .with(tracing_subscriber::fmt::layer().compact().with_writer(stderr))
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// filter for both the file and stderr.
pub fn init(log_path: &Path) -> anyhow::Result<()> {
    let log = CappedLog::create(log_path, MAX_LOG_BYTES)?;
    let filter = env_filter(std::env::var("RUST_LOG").ok().as_deref());

    subscriber(log, io::stderr, filter).try_init()?;
    Ok(())
}
