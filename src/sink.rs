//! Trace sinks: the append-only byte channels the tracer streams into.
//!
//! A sink is installed once per process, before (or lazily at) tracer
//! setup, and closed once at finalize. Appends on the tracer side cannot
//! fail — the tracer runs inside the allocator — so sink I/O errors are
//! logged and the bytes dropped; the trace then truncates cleanly at the
//! last successful append.

use std::{
  env, error, fmt,
  fs::{File, OpenOptions},
  io::{self, BufWriter, Write},
  path::Path,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, OnceLock,
  },
};

use memmap2::MmapMut;

/// Path consulted when no sink was installed explicitly before tracer setup.
pub const TRACE_OUT_ENV: &str = "MALLOC_TRACE_OUT";

/// Downstream byte channel for the trace stream.
pub trait TraceSink: Send + Sync {
  /// Append raw trace bytes. May block on a slow consumer; must not fail.
  fn append_data(&self, bytes: &[u8]);

  /// Whether the sink is ready to accept dump output. The dump coordinator
  /// skips its pass while this is false.
  fn is_fully_setup(&self) -> bool {
    true
  }

  /// Flush and close the sink. Called exactly once, at process finalize.
  fn finalize(&self);
}

/// Returned when installing a sink after one is already in place.
#[derive(Debug)]
pub struct SetSinkError {
  _sealed: (),
}

impl fmt::Display for SetSinkError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad("a trace sink has already been installed")
  }
}

impl error::Error for SetSinkError {}

static GLOBAL_SINK: OnceLock<Arc<dyn TraceSink>> = OnceLock::new();

/// Install the process-wide trace sink.
///
/// # Errors
///
/// Returns [`SetSinkError`] if a sink was already installed (or already
/// defaulted because tracing started first).
pub fn set_trace_sink(sink: Arc<dyn TraceSink>) -> Result<(), SetSinkError> {
  GLOBAL_SINK.set(sink).map_err(|_| SetSinkError { _sealed: () })
}

/// The installed sink, defaulting on first use to a file sink at
/// [`TRACE_OUT_ENV`] or, failing that, an in-memory sink.
pub(crate) fn global() -> &'static Arc<dyn TraceSink> {
  GLOBAL_SINK.get_or_init(|| match env::var_os(TRACE_OUT_ENV) {
    Some(path) => match FileSink::create(&path) {
      Ok(sink) => {
        log::info!("malloc-tracer: streaming trace to {}", Path::new(&path).display());
        Arc::new(sink)
      }
      Err(err) => {
        log::warn!(
          "malloc-tracer: cannot open {} ({err}), tracing to memory",
          Path::new(&path).display()
        );
        Arc::new(MemorySink::new())
      }
    },
    None => Arc::new(MemorySink::new()),
  })
}

/// Growable in-memory sink, used by tests and as the last-resort default.
#[derive(Debug, Default)]
pub struct MemorySink {
  bytes: Mutex<Vec<u8>>,
  finalized: AtomicBool,
  setup_pending: AtomicBool,
}

impl MemorySink {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// A sink that reports `is_fully_setup() == false` until
  /// [`MemorySink::mark_fully_setup`] is called.
  #[must_use]
  pub fn with_setup_pending() -> Self {
    Self {
      setup_pending: AtomicBool::new(true),
      ..Self::default()
    }
  }

  pub fn mark_fully_setup(&self) {
    self.setup_pending.store(false, Ordering::Release);
  }

  /// Snapshot of everything appended so far.
  #[must_use]
  pub fn bytes(&self) -> Vec<u8> {
    self.lock_bytes().clone()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.lock_bytes().len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.lock_bytes().is_empty()
  }

  #[must_use]
  pub fn is_finalized(&self) -> bool {
    self.finalized.load(Ordering::Acquire)
  }

  fn lock_bytes(&self) -> MutexGuard<'_, Vec<u8>> {
    match self.bytes.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }
}

impl TraceSink for MemorySink {
  fn append_data(&self, bytes: &[u8]) {
    self.lock_bytes().extend_from_slice(bytes);
  }

  fn is_fully_setup(&self) -> bool {
    !self.setup_pending.load(Ordering::Acquire)
  }

  fn finalize(&self) {
    self.finalized.store(true, Ordering::Release);
  }
}

/// Buffered file sink.
pub struct FileSink {
  writer: Mutex<BufWriter<File>>,
}

impl FileSink {
  /// # Errors
  ///
  /// Returns an error if the file cannot be created or truncated.
  pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .truncate(true)
      .open(path)?;

    Ok(Self {
      writer: Mutex::new(BufWriter::new(file)),
    })
  }

  fn lock_writer(&self) -> MutexGuard<'_, BufWriter<File>> {
    match self.writer.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }
}

impl TraceSink for FileSink {
  fn append_data(&self, bytes: &[u8]) {
    if let Err(err) = self.lock_writer().write_all(bytes) {
      log::warn!("malloc-tracer: trace write failed, dropping {} bytes: {err}", bytes.len());
    }
  }

  fn finalize(&self) {
    let mut writer = self.lock_writer();

    if let Err(err) = writer.flush() {
      log::warn!("malloc-tracer: trace flush at finalize failed: {err}");
    }
  }
}

struct MmapSinkInner {
  mmap: MmapMut,
  position: usize,
}

/// Sink writing through a fixed-capacity memory-mapped file.
///
/// Appends are plain memcpys with no syscalls, which keeps the dumper's
/// worst-case stall small. Bytes beyond the reserved capacity are dropped;
/// finalize trims the file to the bytes actually written.
pub struct MmapSink {
  file: File,
  inner: Mutex<MmapSinkInner>,
}

impl MmapSink {
  /// # Errors
  ///
  /// Returns an error if the backing file cannot be created, resized, or
  /// mapped into memory.
  pub fn create(path: impl AsRef<Path>, capacity: usize) -> io::Result<Self> {
    let capacity = capacity.max(1);

    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .read(true)
      .truncate(true)
      .open(path)?;

    let capacity_u64 =
      u64::try_from(capacity).map_err(|_| io::Error::other("capacity exceeds u64"))?;

    file.set_len(capacity_u64)?;

    // SAFETY: the file handle remains open for the lifetime of the mapping.
    let mmap = unsafe { MmapMut::map_mut(&file)? };

    Ok(Self {
      file,
      inner: Mutex::new(MmapSinkInner { mmap, position: 0 }),
    })
  }

  fn lock_inner(&self) -> MutexGuard<'_, MmapSinkInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }
}

impl TraceSink for MmapSink {
  fn append_data(&self, bytes: &[u8]) {
    let mut inner = self.lock_inner();
    let position = inner.position;

    let Some(end) = position.checked_add(bytes.len()) else {
      return;
    };

    if end > inner.mmap.len() {
      log::warn!(
        "malloc-tracer: mmap sink capacity exceeded, dropping {} bytes",
        bytes.len()
      );
      return;
    }

    inner.mmap[position..end].copy_from_slice(bytes);
    inner.position = end;
  }

  fn finalize(&self) {
    let inner = self.lock_inner();

    if let Err(err) = inner.mmap.flush() {
      log::warn!("malloc-tracer: mmap sink flush failed: {err}");
    }

    if let Err(err) = self.file.set_len(inner.position as u64) {
      log::warn!("malloc-tracer: mmap sink truncate failed: {err}");
    }
  }
}
