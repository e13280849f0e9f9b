//! The dump coordinator: a background thread that periodically snapshots
//! every live tracer's write cursor and streams the new bytes to the sink,
//! without ever stopping the producers.
//!
//! A pass is: snapshot all cursors under the lock (relaxed loads — the
//! benign race), force a process-wide memory barrier so every store below
//! the snapshots is visible here, flush each tracer's delta, and close the
//! pass with a sync-barrier record the consumer can use to delimit rounds.

use std::{sync::Once, thread, time::Duration};

use crate::{
  encoding::{self, MAX_VARINT_BYTES},
  os, runtime, sink,
};

/// Run one dump pass over all registered tracers.
///
/// Normally driven by the background thread, but callable directly — a
/// host that wants dump points at its own cadence (or a test that wants a
/// deterministic pass) can invoke it at any time from any thread.
pub fn dump_everything() {
  if !sink::global().is_fully_setup() {
    return;
  }

  let mut inner = runtime::lock();

  let mut cursor = inner.registry.head();

  while !cursor.is_null() {
    // SAFETY: lock held, so the registry cannot change under the walk and
    // the dumper-owned cursor fields are ours to write.
    unsafe {
      (*(*cursor).ptr).capture_snapshot();
      cursor = (*cursor).next();
    }
  }

  // Everything producers wrote below their snapshotted cursors is visible
  // after this.
  os::process_wide_barrier();

  let mut cursor = inner.registry.head();

  while !cursor.is_null() {
    // SAFETY: lock held; cells and tracers stay alive while linked.
    unsafe {
      let tracer = (*cursor).ptr;

      if !(*tracer).snapshot_matches_saved() {
        (*tracer).dump_from_coordinator(&mut inner);
      }

      cursor = (*cursor).next();
    }
  }

  let ts_and_cpu = encoding::bundle_ts_and_cpu(runtime::relative_nanos(), os::current_cpu());
  let (first, second) = encoding::encode_sync_barrier(ts_and_cpu);

  let mut scratch = [0u8; 2 * MAX_VARINT_BYTES];
  let mut len = encoding::encode_unsigned(&mut scratch, first);
  len += encoding::encode_unsigned(&mut scratch[len..], second);

  runtime::append_locked(&mut inner, &scratch[..len]);
}

/// Spawn the coordinator thread. Idempotent.
pub(crate) fn spawn(period: Duration) {
  static SPAWNED: Once = Once::new();

  SPAWNED.call_once(|| {
    let spawned = thread::Builder::new()
      .name("malloc-tracer-dump".into())
      .spawn(move || run(period));

    if let Err(err) = spawned {
      log::error!("malloc-tracer: failed to spawn dump coordinator: {err}");
    }
  });
}

fn run(period: Duration) -> ! {
  // Keep the coordinator's own tracing out of the passes it runs.
  runtime::exclude_current_thread_from_dumping();

  loop {
    thread::sleep(period);
    dump_everything();
  }
}
