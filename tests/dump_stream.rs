//! Dump protocol properties: chunk framing across passes, sync barriers,
//! chunk accounting, and the finalize gate. One test function — the
//! choreography below owns the process-global runtime end to end.

mod common;

use std::{
  sync::{mpsc, Arc},
  thread,
};

use common::{ProducerEvent, Record};
use malloc_tracer::{
  dump_everything, finalize_tracing, set_trace_sink, tracer_stats, with_instance, MemorySink,
  TracerConfig,
};

fn sync_barrier_count(records: &[Record]) -> usize {
  records
    .iter()
    .filter(|record| matches!(record, Record::SyncBarrier { .. }))
    .count()
}

#[test]
fn dump_passes_frame_concurrent_writers() {
  let sink = Arc::new(MemorySink::new());
  set_trace_sink(Arc::clone(&sink) as Arc<dyn malloc_tracer::TraceSink>).expect("first sink install");

  // No background dumper: every pass in this test is explicit.
  malloc_tracer::init(TracerConfig::default().without_dumper());

  let (to_worker, from_main) = mpsc::channel::<()>();
  let (to_main, from_worker) = mpsc::channel::<u64>();

  let worker = thread::spawn(move || {
    let thread_id = with_instance(|tracer| tracer.thread_id());

    let tokens: Vec<u64> = (0..10)
      .map(|extra| with_instance(|tracer| tracer.trace_malloc(64 + extra)))
      .collect();

    to_main.send(thread_id).expect("main alive");
    from_main.recv().expect("first dump done");

    for token in &tokens[..5] {
      with_instance(|tracer| tracer.trace_free(*token));
    }

    to_main.send(thread_id).expect("main alive");
    from_main.recv().expect("second dump done");
  });

  let worker_id = from_worker.recv().expect("worker alive");
  assert!(worker_id > 1, "main thread owns id 1");

  dump_everything();

  let records = common::parse_trace(&sink.bytes());
  assert_eq!(sync_barrier_count(&records), 1);
  assert!(
    matches!(records.last(), Some(Record::SyncBarrier { .. })),
    "a pass ends with its sync barrier"
  );

  let first_pass = common::thread_stream(&records, worker_id);
  let events = common::parse_producer_stream(&first_pass);
  assert!(matches!(events[0], ProducerEvent::TokenRefresh { .. }));
  assert_eq!(events.len(), 11, "token refresh plus ten mallocs");

  let sizes: Vec<i64> = events[1..]
    .iter()
    .scan(0i64, |size, event| match event {
      ProducerEvent::Malloc { size_delta } => {
        *size += size_delta;
        Some(*size)
      }
      other => panic!("expected malloc, got {other:?}"),
    })
    .collect();
  assert_eq!(sizes, (64..74).collect::<Vec<i64>>());

  // Bytes written after the first pass's snapshot surface in the next pass.
  to_worker.send(()).expect("worker alive");
  from_worker.recv().expect("worker alive");

  dump_everything();

  let records = common::parse_trace(&sink.bytes());
  assert_eq!(sync_barrier_count(&records), 2);

  let full_stream = common::thread_stream(&records, worker_id);
  let second_pass = common::parse_producer_stream(&full_stream[first_pass.len()..]);
  assert_eq!(second_pass.len(), 5);
  assert!(second_pass
    .iter()
    .all(|event| matches!(event, ProducerEvent::Free { .. })));

  // Concatenated chunks replay the worker's writes in program order.
  let replay = common::parse_producer_stream(&full_stream);
  assert_eq!(replay.len(), 16);
  assert!(matches!(replay[0], ProducerEvent::TokenRefresh { .. }));
  assert!(replay[1..11]
    .iter()
    .all(|event| matches!(event, ProducerEvent::Malloc { .. })));

  // Dumper accounting: counter equals the sum of dumped chunk sizes.
  let dumped: u64 = records
    .iter()
    .filter_map(|record| match record {
      Record::Chunk { bytes, .. } => Some(bytes.len() as u64),
      _ => None,
    })
    .sum();
  assert_eq!(tracer_stats().thread_dump_written, dumped);

  to_worker.send(()).expect("worker alive");
  worker.join().expect("worker panicked");

  // The worker's teardown flushed its remaining bytes and emitted a death
  // record outside any dump pass.
  let records = common::parse_trace(&sink.bytes());
  assert!(records
    .iter()
    .any(|record| matches!(record, Record::Death { thread_id, .. } if *thread_id == worker_id)));

  // An excluded thread's bytes never ride a dump pass; they surface only
  // through its own teardown flush.
  let (to_excluded, from_main) = mpsc::channel::<()>();
  let (to_main, from_excluded) = mpsc::channel::<u64>();

  let excluded = thread::spawn(move || {
    malloc_tracer::exclude_current_thread_from_dumping();

    with_instance(|tracer| {
      tracer.trace_malloc(512);
    });

    to_main
      .send(with_instance(|tracer| tracer.thread_id()))
      .expect("main alive");
    from_main.recv().expect("dump done");
  });

  let excluded_id = from_excluded.recv().expect("excluded thread alive");
  dump_everything();

  let records = common::parse_trace(&sink.bytes());
  assert!(
    common::thread_stream(&records, excluded_id).is_empty(),
    "dump passes must skip excluded tracers"
  );

  to_excluded.send(()).expect("excluded thread alive");
  excluded.join().expect("excluded thread panicked");

  let records = common::parse_trace(&sink.bytes());
  let events = common::parse_producer_stream(&common::thread_stream(&records, excluded_id));
  assert!(events
    .iter()
    .any(|event| matches!(event, ProducerEvent::Malloc { .. })));
  assert!(records
    .iter()
    .any(|record| matches!(record, Record::Death { thread_id, .. } if *thread_id == excluded_id)));

  // Finalize closes the stream; later producers and passes change nothing.
  finalize_tracing();
  assert!(sink.is_finalized());

  let final_len = sink.len();
  let records = common::parse_trace(&sink.bytes());
  assert!(matches!(records.last(), Some(Record::End)));

  let late_writer = thread::spawn(|| {
    for _ in 0..50 {
      with_instance(|tracer| {
        tracer.trace_malloc(32);
      });
    }
    with_instance(|tracer| tracer.refresh_buffer());
  });
  late_writer.join().expect("late writer panicked");

  with_instance(|tracer| {
    tracer.trace_malloc(16);
    tracer.refresh_buffer();
  });
  dump_everything();
  finalize_tracing();

  assert_eq!(sink.len(), final_len, "no bytes reach the sink after finalize");
}
