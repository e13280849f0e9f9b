use std::fmt::{self, Write as _};

use serde::Serialize;

/// Point-in-time snapshot of the tracer's diagnostic counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TracerStats {
  /// Total tokens claimed process-wide (a multiple of the token block size).
  pub token_counter: u64,
  /// Number of thread ids handed out so far.
  pub thread_id_counter: u64,
  /// Bytes of producer buffers flushed by the dump coordinator.
  pub thread_dump_written: u64,
}

impl TracerStats {
  /// Write the counters in decimal into `out`, truncating if it is too
  /// small. Returns the number of bytes written. Allocation-free, so it is
  /// safe to call from crash handlers.
  pub fn sprint(&self, out: &mut [u8]) -> usize {
    let mut writer = SliceWriter { out, written: 0 };

    // A full buffer just truncates the report.
    let _ = write!(
      writer,
      "token_counter = {}\nthread_id_counter = {}\nthread_dump_written = {}\n",
      self.token_counter, self.thread_id_counter, self.thread_dump_written,
    );

    writer.written
  }

  /// Serialize the counters as JSON.
  ///
  /// # Errors
  ///
  /// Returns an error if the underlying writer fails.
  pub fn export_json<W: std::io::Write>(&self, writer: W) -> Result<(), serde_json::Error> {
    serde_json::to_writer(writer, self)
  }
}

struct SliceWriter<'a> {
  out: &'a mut [u8],
  written: usize,
}

impl fmt::Write for SliceWriter<'_> {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    let remaining = self.out.len() - self.written;
    let take = s.len().min(remaining);

    self.out[self.written..self.written + take].copy_from_slice(&s.as_bytes()[..take]);
    self.written += take;

    if take < s.len() {
      Err(fmt::Error)
    } else {
      Ok(())
    }
  }
}
