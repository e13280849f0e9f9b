//! Low-overhead per-thread malloc event tracer.
//!
//! Every thread that touches the traced allocator gets a page-sized
//! [`ThreadTracer`] holding an inline event buffer and a block of
//! process-unique allocation tokens. The hot path — recording a malloc or
//! free — is a handful of relaxed stores into thread-owned memory; the only
//! global synchronization is one atomic fetch-add per [`TOKEN_BLOCK`]
//! allocations and one spinlock acquisition per buffer's worth of trace.
//!
//! A background coordinator periodically snapshots every live buffer
//! without stopping the producers and streams the new bytes, framed into
//! per-thread chunks, to a [`TraceSink`]. The resulting byte log is a
//! compact varint stream (see [`encoding`]) from which a post-mortem
//! analyzer can reconstruct the allocator's behavior thread by thread.
//!
//! ```no_run
//! use malloc_tracer::{init, with_instance, TracerConfig};
//!
//! init(TracerConfig::default().with_trace_path("/tmp/malloc.trace"));
//!
//! let token = with_instance(|tracer| tracer.trace_malloc(4096));
//! with_instance(|tracer| tracer.trace_free(token));
//! ```

mod config;
mod dumper;
pub mod encoding;
mod os;
mod registry;
mod runtime;
mod sink;
mod slab;
mod spin;
mod stats;
mod tracer;

pub use {
  config::TracerConfig,
  dumper::dump_everything,
  runtime::{
    exclude_current_thread_from_dumping, finalize_tracing, init, sprint_stats, tracer_stats,
    with_instance,
  },
  sink::{
    set_trace_sink, FileSink, MemorySink, MmapSink, SetSinkError, TraceSink, TRACE_OUT_ENV,
  },
  stats::TracerStats,
  tracer::{ThreadTracer, TOKEN_BLOCK, TRACER_CELL_BYTES},
};
