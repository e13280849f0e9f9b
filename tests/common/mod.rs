//! Shared helpers: a strict parser for the on-wire trace stream.

use malloc_tracer::encoding::{self, EventTag, MAGIC};

/// Top-level record of the trace stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
  Chunk {
    thread_id: u64,
    ts_and_cpu: u64,
    bytes: Vec<u8>,
  },
  SyncBarrier {
    ts_and_cpu: u64,
  },
  Death {
    thread_id: u64,
    ts_and_cpu: u64,
  },
  End,
}

/// Event of a per-thread producer stream, framed inside buffer chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerEvent {
  TokenRefresh { base: u64 },
  Malloc { size_delta: i64 },
  Free { token_delta: i64 },
  Realloc { size_delta: i64, token_delta: i64 },
}

fn take_word(bytes: &[u8], pos: &mut usize) -> u64 {
  let (word, consumed) = encoding::decode_unsigned(&bytes[*pos..]).expect("truncated varint");
  *pos += consumed;
  word
}

/// Parse a complete trace stream, magic header included. Panics on any
/// malformed or unexpected input; tests want loud failures.
pub fn parse_trace(bytes: &[u8]) -> Vec<Record> {
  assert!(bytes.len() >= 4, "trace shorter than the magic header");
  assert_eq!(
    u32::from_le_bytes(bytes[..4].try_into().unwrap()),
    MAGIC,
    "bad magic header"
  );

  let mut pos = 4;
  let mut records = Vec::new();

  while pos < bytes.len() {
    let first = take_word(bytes, &mut pos);

    match EventTag::from_word(first) {
      EventTag::BufferChunk => {
        let thread_id = encoding::word_payload(first);
        let ts_and_cpu = take_word(bytes, &mut pos);
        let size = take_word(bytes, &mut pos) as usize;

        assert!(pos + size <= bytes.len(), "chunk overruns the stream");
        let chunk = bytes[pos..pos + size].to_vec();
        pos += size;

        records.push(Record::Chunk {
          thread_id,
          ts_and_cpu,
          bytes: chunk,
        });
      }
      EventTag::SyncBarrier => {
        let ts_and_cpu = take_word(bytes, &mut pos);
        records.push(Record::SyncBarrier { ts_and_cpu });
      }
      EventTag::Death => {
        let thread_id = encoding::word_payload(first);
        let ts_and_cpu = take_word(bytes, &mut pos);
        records.push(Record::Death {
          thread_id,
          ts_and_cpu,
        });
      }
      EventTag::End => {
        records.push(Record::End);
        assert_eq!(pos, bytes.len(), "bytes after the end marker");
      }
      other => panic!("unexpected top-level record {other:?}"),
    }
  }

  records
}

/// Parse the producer bytes of one thread's chunks.
pub fn parse_producer_stream(bytes: &[u8]) -> Vec<ProducerEvent> {
  let mut pos = 0;
  let mut events = Vec::new();

  while pos < bytes.len() {
    let first = take_word(bytes, &mut pos);

    match EventTag::from_word(first) {
      EventTag::Malloc => events.push(ProducerEvent::Malloc {
        size_delta: encoding::decode_size_delta(first),
      }),
      EventTag::Free => events.push(ProducerEvent::Free {
        token_delta: encoding::decode_token_delta(first),
      }),
      EventTag::Realloc => {
        let second = take_word(bytes, &mut pos);
        events.push(ProducerEvent::Realloc {
          size_delta: encoding::decode_size_delta(first),
          token_delta: encoding::decode_realloc_token_delta(second),
        });
      }
      EventTag::TokenRefresh => {
        let _ts_and_cpu = take_word(bytes, &mut pos);
        events.push(ProducerEvent::TokenRefresh {
          base: encoding::word_payload(first),
        });
      }
      other => panic!("unexpected producer event {other:?}"),
    }
  }

  events
}

/// Concatenation of all chunk bytes attributed to `thread_id`, in sink
/// order — the consumer's view of that thread's program-order stream.
pub fn thread_stream(records: &[Record], thread_id: u64) -> Vec<u8> {
  let mut stream = Vec::new();

  for record in records {
    if let Record::Chunk {
      thread_id: id,
      bytes,
      ..
    } = record
    {
      if *id == thread_id {
        stream.extend_from_slice(bytes);
      }
    }
  }

  stream
}
