use std::{path::PathBuf, time::Duration};

/// Controls how the tracer runtime is brought up.
///
/// Only scheduling and wiring live here; the trace format knobs (token
/// block size, tracer page size) are compile-time constants.
#[derive(Debug, Clone)]
pub struct TracerConfig {
  /// How long the dump coordinator sleeps between passes.
  pub dumper_period: Duration,
  /// Whether `init` spawns the background dump coordinator.
  pub spawn_dumper: bool,
  /// Trace output path; `None` consults [`crate::sink::TRACE_OUT_ENV`].
  pub trace_path: Option<PathBuf>,
}

impl Default for TracerConfig {
  fn default() -> Self {
    Self {
      dumper_period: Duration::from_micros(3000),
      spawn_dumper: true,
      trace_path: None,
    }
  }
}

impl TracerConfig {
  /// Builder-style helper to adjust the dump interval.
  #[must_use]
  pub fn with_dumper_period(mut self, period: Duration) -> Self {
    self.dumper_period = period;
    self
  }

  /// Run without the background dumper; buffers flush only on overflow and
  /// at thread death.
  #[must_use]
  pub fn without_dumper(mut self) -> Self {
    self.spawn_dumper = false;
    self
  }

  /// Stream the trace to `path` instead of consulting the environment.
  #[must_use]
  pub fn with_trace_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.trace_path = Some(path.into());
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_matches_documented_tunables() {
    let config = TracerConfig::default();
    assert_eq!(config.dumper_period, Duration::from_micros(3000));
    assert!(config.spawn_dumper);
    assert!(config.trace_path.is_none());
  }

  #[test]
  fn builder_helpers_compose() {
    let config = TracerConfig::default()
      .with_dumper_period(Duration::from_millis(10))
      .without_dumper()
      .with_trace_path("/tmp/trace.bin");

    assert_eq!(config.dumper_period, Duration::from_millis(10));
    assert!(!config.spawn_dumper);
    assert_eq!(config.trace_path.as_deref(), Some(std::path::Path::new("/tmp/trace.bin")));
  }
}
