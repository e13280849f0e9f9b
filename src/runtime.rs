//! Global tracer runtime: the spinlock-guarded state shared by every
//! thread, the TLS fast path into the per-thread tracer, and the lifecycle
//! glue — bootstrap of the first tracer from inside the traced allocator,
//! deferred per-thread teardown, and process finalize.
//!
//! The teardown protocol mirrors the constraint it exists for: a dying
//! thread's other TLS destructors may still allocate and must still be
//! traced. The tracer's destructor therefore re-registers itself on its
//! first three invocations and only tears down on the fourth.

use std::{
  cell::{Cell, UnsafeCell},
  ptr,
  sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Once,
  },
};

use crate::{
  config::TracerConfig,
  dumper,
  encoding::{self, MAX_VARINT_BYTES, TS_MASK},
  os,
  registry::{Registry, TracerCell},
  sink::{self, FileSink},
  slab::TracerSlab,
  spin::{SpinGuard, SpinLock},
  stats::TracerStats,
  tracer::{ThreadTracer, TRACER_CELL_BYTES},
};

/// Destructor invocations absorbed before a tracer is actually torn down.
const DESTROY_PASSES: u32 = 3;

/// Source of all allocation tokens, bumped one block at a time.
pub(crate) static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Nanosecond origin; every emitted timestamp is relative to this.
static BASE_TS: AtomicU64 = AtomicU64::new(0);

/// Everything guarded by the single global spinlock.
pub(crate) struct RuntimeInner {
  pub registry: Registry,
  pub thread_id_counter: u64,
  pub thread_dump_written: u64,
  pub no_more_writes: bool,
  pub slab: TracerSlab,
}

static RUNTIME: SpinLock<RuntimeInner> = SpinLock::new(RuntimeInner {
  registry: Registry::new(),
  thread_id_counter: 0,
  thread_dump_written: 0,
  no_more_writes: false,
  slab: TracerSlab::new(),
});

pub(crate) fn lock() -> SpinGuard<'static, RuntimeInner> {
  RUNTIME.lock()
}

/// Append to the sink unless finalize already closed it to producers.
/// Requires the global spinlock — the lock is the release/acquire edge that
/// makes `no_more_writes` reliably visible.
pub(crate) fn append_locked(inner: &mut RuntimeInner, bytes: &[u8]) {
  if inner.no_more_writes {
    return;
  }

  sink::global().append_data(bytes);
}

/// Nanoseconds since the tracer came up.
pub(crate) fn relative_nanos() -> u64 {
  os::monotonic_nanos().wrapping_sub(BASE_TS.load(Ordering::Relaxed))
}

#[repr(align(4096))]
struct BootstrapArea(UnsafeCell<[u8; TRACER_CELL_BYTES]>);

// SAFETY: the area is written exactly once, inside a `Once`, before any
// other thread can obtain the pointer.
unsafe impl Sync for BootstrapArea {}

/// Static scratch for the first tracer, which must exist before the slab
/// (or anything else heap-like) is usable.
static BOOTSTRAP_AREA: BootstrapArea = BootstrapArea(UnsafeCell::new([0; TRACER_CELL_BYTES]));

fn bootstrap_tracer() -> *mut ThreadTracer {
  BOOTSTRAP_AREA.0.get().cast()
}

static FIRST_TRACER_SETUP: Once = Once::new();
static TLS_SETUP: Once = Once::new();

/// Holds the `pthread_key_t` driving the deferred destructor. Written once
/// during TLS setup.
static INSTANCE_KEY: AtomicUsize = AtomicUsize::new(0);

fn instance_key() -> libc::pthread_key_t {
  INSTANCE_KEY.load(Ordering::Acquire) as libc::pthread_key_t
}

thread_local! {
  /// Fast-path pointer to this thread's tracer.
  static TRACER_SLOT: Cell<*mut ThreadTracer> = const { Cell::new(ptr::null_mut()) };

  /// Set once this thread's tracer has been destroyed; later re-entries get
  /// an anonymous (id 0, unregistered) tracer.
  static HAD_TRACER: Cell<bool> = const { Cell::new(false) };

  /// True while this thread runs TLS setup; nested tracer calls are
  /// redirected to the bootstrap tracer instead of re-entering setup.
  static IN_SETUP: Cell<bool> = const { Cell::new(false) };

  /// This thread's registry node. Lives in the TLS block (not in the
  /// tracer) so it stays addressable through all destructor passes.
  static REGISTRY_CELL: UnsafeCell<TracerCell> = const { UnsafeCell::new(TracerCell::empty()) };
}

/// Run `f` against this thread's tracer, creating it on first use.
///
/// The fast path is one TLS read. `f` must not call back into the tracer;
/// the tracer hands out exclusive access for the duration of the call.
#[inline]
pub fn with_instance<R>(f: impl FnOnce(&mut ThreadTracer) -> R) -> R {
  let tracer = TRACER_SLOT.with(|slot| {
    let tracer = slot.get();

    if tracer.is_null() {
      get_instance_slow()
    } else {
      tracer
    }
  });

  // SAFETY: the tracer is owned by this thread (or is the bootstrap tracer
  // during this thread's own setup); nothing else mutates it outside the
  // spinlock'd cursor fields.
  f(unsafe { &mut *tracer })
}

fn setup_first_tracer() {
  BASE_TS.store(os::monotonic_nanos() & TS_MASK, Ordering::Relaxed);

  // SAFETY: one-shot in-place construction into the static scratch area.
  unsafe {
    ptr::write(bootstrap_tracer(), ThreadTracer::new(1));
  }
}

fn do_setup_tls() {
  IN_SETUP.with(|flag| flag.set(true));

  // Building the sink may itself allocate; those allocations land on the
  // bootstrap tracer thanks to `in_setup`.
  let sink = sink::global();
  sink.append_data(&encoding::MAGIC.to_le_bytes());

  let mut key: libc::pthread_key_t = 0;

  // SAFETY: plain pthread_key_create with a static callback.
  let rv = unsafe { libc::pthread_key_create(&mut key, Some(tracer_destructor)) };

  if rv != 0 {
    log::error!("malloc-tracer: pthread_key_create failed ({rv})");
    std::process::abort();
  }

  INSTANCE_KEY.store(key as usize, Ordering::Release);

  IN_SETUP.with(|flag| flag.set(false));
}

#[cold]
fn get_instance_slow() -> *mut ThreadTracer {
  FIRST_TRACER_SETUP.call_once(setup_first_tracer);

  if IN_SETUP.with(Cell::get) {
    return bootstrap_tracer();
  }

  TLS_SETUP.call_once(do_setup_tls);

  let had_tracer = HAD_TRACER.with(Cell::get);
  let cell: *mut TracerCell = REGISTRY_CELL.with(UnsafeCell::get);

  let tracer;
  {
    let mut inner = lock();

    let thread_id = if had_tracer {
      0
    } else {
      inner.thread_id_counter += 1;
      inner.thread_id_counter
    };

    if thread_id == 1 {
      tracer = bootstrap_tracer();
    } else {
      tracer = inner.slab.alloc().cast::<ThreadTracer>();

      // SAFETY: the slab hands out exclusive, page-aligned, tracer-sized
      // cells.
      unsafe {
        ptr::write(tracer, ThreadTracer::new(thread_id));
      }
    }

    if !had_tracer {
      // SAFETY: the cell lives in this thread's TLS block and is unlinked;
      // we hold the lock.
      unsafe {
        (*cell).ptr = tracer;
        inner.registry.link(cell);
      }
    }
  }

  TRACER_SLOT.with(|slot| slot.set(tracer));

  if !had_tracer {
    // SAFETY: key was created during TLS setup; the value is this thread's
    // registry cell, handed back to us by the destructor at exit.
    unsafe {
      libc::pthread_setspecific(instance_key(), cell.cast());
    }
  }

  tracer
}

/// TLS destructor: re-registers itself for the first [`DESTROY_PASSES`]
/// invocations so that other TLS destructors running later on this thread
/// still get traced; the final invocation unlinks, flushes, emits the death
/// record, and returns the cell to the slab.
unsafe extern "C" fn tracer_destructor(arg: *mut libc::c_void) {
  let cell: *mut TracerCell = arg.cast();

  // SAFETY: `arg` is the registry cell we stored via pthread_setspecific;
  // the TLS block holding it outlives all destructor passes.
  let tracer = unsafe { (*cell).ptr };

  if tracer.is_null() {
    return;
  }

  // SAFETY: this thread owns its tracer until the final pass below.
  if unsafe { (*tracer).bump_destroy_count() } < DESTROY_PASSES {
    unsafe {
      libc::pthread_setspecific(instance_key(), arg);
    }
    return;
  }

  {
    let mut inner = lock();
    // SAFETY: lock held; the cell is ours.
    unsafe {
      inner.registry.unlink(cell);
    }
  }

  HAD_TRACER.with(|flag| flag.set(true));
  TRACER_SLOT.with(|slot| slot.set(ptr::null_mut()));

  // SAFETY: exclusive access; the tracer is no longer reachable from the
  // registry or this thread's TLS slot.
  unsafe {
    (*cell).ptr = ptr::null_mut();
    (*tracer).emit_death_and_flush();
    ptr::write_bytes(tracer.cast::<u8>(), 0xfe, TRACER_CELL_BYTES);
  }

  if tracer == bootstrap_tracer() {
    return;
  }

  let mut inner = lock();
  // SAFETY: the cell came from this slab and nothing references it anymore.
  unsafe {
    inner.slab.dealloc(tracer.cast());
  }
}

/// Drop this thread's tracer from the dump coordinator's view. Its events
/// still reach the sink through overflow and death flushes; the coordinator
/// itself uses this to keep its own activity out of the passes it runs.
pub fn exclude_current_thread_from_dumping() {
  with_instance(|_| {});

  let cell: *mut TracerCell = REGISTRY_CELL.with(UnsafeCell::get);

  // SAFETY: only this thread links or unlinks its own cell, so the
  // unlocked linked-check cannot race.
  unsafe {
    if !(*cell).is_linked() {
      return;
    }

    let mut inner = lock();
    inner.registry.unlink(cell);
  }
}

static INIT: Once = Once::new();

/// Bring the tracer up: install the configured sink, force this thread's
/// tracer into existence, arrange process-exit finalization, and spawn the
/// dump coordinator.
pub fn init(config: TracerConfig) {
  INIT.call_once(|| {
    if let Some(path) = &config.trace_path {
      match FileSink::create(path) {
        Ok(file_sink) => {
          if sink::set_trace_sink(Arc::new(file_sink)).is_err() {
            log::warn!("malloc-tracer: sink already installed, ignoring trace_path");
          }
        }
        Err(err) => {
          log::warn!("malloc-tracer: cannot open {} ({err})", path.display());
        }
      }
    }

    with_instance(|_| {});

    // SAFETY: registering a static no-unwind callback.
    unsafe {
      libc::atexit(finalize_at_exit);
    }

    if config.spawn_dumper {
      dumper::spawn(config.dumper_period);
    }
  });
}

extern "C" fn finalize_at_exit() {
  finalize_tracing();
}

/// Stop accepting producer bytes, write the END marker, and close the sink.
///
/// Idempotent; runs automatically at process exit once [`init`] has been
/// called. Flushing may itself allocate downstream (a compressing sink,
/// say), so the END marker and sink finalize happen outside the lock.
pub fn finalize_tracing() {
  {
    let mut inner = lock();

    if inner.no_more_writes {
      return;
    }

    inner.no_more_writes = true;
  }

  let mut scratch = [0u8; MAX_VARINT_BYTES];
  let len = encoding::encode_unsigned(&mut scratch, encoding::encode_end());

  let sink = sink::global();
  sink.append_data(&scratch[..len]);
  sink.finalize();
}

/// Snapshot of the diagnostic counters.
#[must_use]
pub fn tracer_stats() -> TracerStats {
  let inner = lock();

  TracerStats {
    token_counter: TOKEN_COUNTER.load(Ordering::Relaxed),
    thread_id_counter: inner.thread_id_counter,
    thread_dump_written: inner.thread_dump_written,
  }
}

/// Write the diagnostic counters in decimal into `out`; returns the number
/// of bytes written. Safe to call from crash handlers.
pub fn sprint_stats(out: &mut [u8]) -> usize {
  tracer_stats().sprint(out)
}
