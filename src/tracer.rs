//! Per-thread tracer: one page holding the thread's event buffer and token
//! state.
//!
//! The owning thread appends encoded events with no locks and no
//! allocations; the only synchronized paths are token-block refresh (one
//! atomic fetch-add per [`TOKEN_BLOCK`] allocations) and buffer flush (one
//! spinlock acquisition per buffer's worth of trace). The dump coordinator
//! reads the write cursor with a relaxed load — a benign race; bytes it
//! misses are picked up by the next pass.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
  encoding::{self, MAX_VARINT_BYTES},
  os,
  runtime::{self, RuntimeInner},
};

/// Size of one tracer cell. The whole struct, buffer included, occupies
/// exactly one page so cells pack densely in the slab.
pub const TRACER_CELL_BYTES: usize = 4096;

/// Tokens claimed per atomic bump of the global token counter.
pub const TOKEN_BLOCK: u64 = 1024;

const HEADER_BYTES: usize = 72;

const BUF_BYTES: usize = TRACER_CELL_BYTES - HEADER_BYTES;

/// Highest cursor at which one more varint is guaranteed to fit, so the hot
/// path checks the cursor once per word instead of once per byte.
const BUF_APPEND_LIMIT: usize = BUF_BYTES - MAX_VARINT_BYTES;

/// Per-thread event buffer and token state.
///
/// Field ownership is split: everything except the two flush cursors is
/// owned by the thread named by `thread_id`; `saved_pos` and `snapshot_pos`
/// belong to the dump coordinator and are only touched under the global
/// spinlock.
#[repr(C, align(4096))]
pub struct ThreadTracer {
  thread_id: u64,
  /// Write cursor into `buf_storage`. Owned by the producer; published with
  /// relaxed stores so the dumper's snapshot load cannot tear.
  buf_pos: AtomicUsize,
  /// Everything below this offset has been emitted to the sink.
  saved_pos: usize,
  /// Cursor captured by the dumper at the start of the current pass.
  snapshot_pos: usize,
  token_base: u64,
  counter: u64,
  prev_size: u64,
  prev_token: u64,
  last_cpu: u32,
  destroy_count: u32,
  buf_storage: [u8; BUF_BYTES],
}

const _: () = assert!(std::mem::size_of::<ThreadTracer>() == TRACER_CELL_BYTES);
const _: () = assert!(std::mem::align_of::<ThreadTracer>() == TRACER_CELL_BYTES);

impl ThreadTracer {
  /// Fresh tracer for `thread_id`. Claims its first token block, which also
  /// seeds the buffer with the initial token-refresh record.
  pub(crate) fn new(thread_id: u64) -> Self {
    let mut tracer = Self {
      thread_id,
      buf_pos: AtomicUsize::new(0),
      saved_pos: 0,
      snapshot_pos: 0,
      token_base: 0,
      counter: 0,
      prev_size: 0,
      prev_token: 0,
      last_cpu: 0,
      destroy_count: 0,
      buf_storage: [0; BUF_BYTES],
    };

    tracer.refresh_token();
    tracer
  }

  #[must_use]
  pub fn thread_id(&self) -> u64 {
    self.thread_id
  }

  /// Record an allocation of `size` bytes and return the token identifying
  /// it. Downstream analysis joins the matching free by this token.
  pub fn trace_malloc(&mut self, size: usize) -> u64 {
    let token = self.next_token();
    let word = encoding::encode_malloc(size as u64, &mut self.prev_size);
    self.append_words(&[word]);
    token
  }

  /// Record the free of the allocation identified by `token`.
  pub fn trace_free(&mut self, token: u64) {
    let word = encoding::encode_free(token, &mut self.prev_token);
    self.append_words(&[word]);
  }

  /// Record a reallocation: frees `old_token`, records the new size, and
  /// returns the replacement token.
  pub fn trace_realloc(&mut self, old_token: u64, new_size: usize) -> u64 {
    let token = self.next_token();
    let (first, second) = encoding::encode_realloc(
      new_size as u64,
      old_token,
      &mut self.prev_size,
      &mut self.prev_token,
    );
    self.append_words(&[first, second]);
    token
  }

  /// Hand out the next token, refreshing the thread's block when it runs
  /// dry. Tokens are unique process-wide and strictly increasing per thread.
  pub fn next_token(&mut self) -> u64 {
    if self.counter == 0 {
      self.refresh_token();
    }

    let token = self.token_base + (TOKEN_BLOCK - self.counter);
    self.counter -= 1;
    token
  }

  /// Claim the next [`TOKEN_BLOCK`] tokens and record the new base.
  fn refresh_token(&mut self) {
    let base = runtime::TOKEN_COUNTER.fetch_add(TOKEN_BLOCK, Ordering::Relaxed);

    self.token_base = base;
    self.counter = TOKEN_BLOCK;

    let ts_and_cpu = self.update_ts_and_cpu();
    let (first, second) = encoding::encode_token(base, ts_and_cpu);
    self.append_words(&[first, second]);
  }

  /// Append encoded event words to the thread buffer. Sole hot-path
  /// entrypoint: lock-free except when a word lands on a full buffer.
  pub fn append_words(&mut self, words: &[u64]) {
    for &word in words {
      let mut pos = self.buf_pos.load(Ordering::Relaxed);

      if pos > BUF_APPEND_LIMIT {
        self.refresh_buffer();
        pos = 0;
      }

      let written =
        encoding::encode_unsigned(&mut self.buf_storage[pos..pos + MAX_VARINT_BYTES], word);
      self.buf_pos.store(pos + written, Ordering::Relaxed);
    }
  }

  /// Flush everything not yet emitted and rewind the buffer to the start.
  pub fn refresh_buffer(&mut self) {
    let mut inner = runtime::lock();

    let pos = self.buf_pos.load(Ordering::Relaxed);

    if pos != self.saved_pos {
      let size = pos - self.saved_pos;
      let ts_and_cpu = self.update_ts_and_cpu();
      self.emit_chunk_locked(&mut inner, size, ts_and_cpu);
    }

    self.buf_pos.store(0, Ordering::Relaxed);
    self.saved_pos = 0;
  }

  /// Emit the bytes between the saved cursor and the dumper's snapshot.
  /// Called by the dump coordinator, on its thread, with the lock held.
  pub(crate) fn dump_from_coordinator(&mut self, inner: &mut RuntimeInner) {
    let size = self.snapshot_pos - self.saved_pos;

    if size == 0 {
      return;
    }

    // The producer may be running right now; bundle with the CPU it last
    // reported rather than querying our own.
    let ts_and_cpu = encoding::bundle_ts_and_cpu(runtime::relative_nanos(), self.last_cpu);
    self.emit_chunk_locked(inner, size, ts_and_cpu);

    self.saved_pos = self.snapshot_pos;
    inner.thread_dump_written += size as u64;
  }

  pub(crate) fn capture_snapshot(&mut self) {
    self.snapshot_pos = self.buf_pos.load(Ordering::Relaxed);
  }

  #[must_use]
  pub(crate) fn snapshot_matches_saved(&self) -> bool {
    self.snapshot_pos == self.saved_pos
  }

  /// Chunk header followed by the raw producer bytes, starting at the saved
  /// cursor. Requires the global spinlock.
  fn emit_chunk_locked(&mut self, inner: &mut RuntimeInner, size: usize, ts_and_cpu: u64) {
    let (first, second, third) = encoding::encode_buffer(self.thread_id, ts_and_cpu, size as u64);

    let mut meta = [0u8; 3 * MAX_VARINT_BYTES];
    let mut len = encoding::encode_unsigned(&mut meta, first);
    len += encoding::encode_unsigned(&mut meta[len..], second);
    len += encoding::encode_unsigned(&mut meta[len..], third);

    runtime::append_locked(inner, &meta[..len]);
    runtime::append_locked(inner, &self.buf_storage[self.saved_pos..self.saved_pos + size]);
  }

  /// Final flush: drain the buffer, then emit this thread's death record.
  pub(crate) fn emit_death_and_flush(&mut self) {
    self.refresh_buffer();

    let ts_and_cpu = self.update_ts_and_cpu();
    let (first, second) = encoding::encode_death(self.thread_id, ts_and_cpu);

    let mut scratch = [0u8; 2 * MAX_VARINT_BYTES];
    let mut len = encoding::encode_unsigned(&mut scratch, first);
    len += encoding::encode_unsigned(&mut scratch[len..], second);

    let mut inner = runtime::lock();
    runtime::append_locked(&mut inner, &scratch[..len]);
  }

  pub(crate) fn bump_destroy_count(&mut self) -> u32 {
    let count = self.destroy_count;
    self.destroy_count += 1;
    count
  }

  fn update_ts_and_cpu(&mut self) -> u64 {
    let ts = runtime::relative_nanos();
    self.last_cpu = os::current_cpu();
    encoding::bundle_ts_and_cpu(ts, self.last_cpu)
  }

  /// Bytes appended by this thread but not yet emitted to the sink. Only
  /// meaningful on the owning thread; a dump pass may drain them at any
  /// moment.
  #[must_use]
  pub fn pending_bytes(&self) -> &[u8] {
    &self.buf_storage[self.saved_pos..self.buf_pos.load(Ordering::Relaxed)]
  }
}
