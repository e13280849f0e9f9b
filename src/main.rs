//! Random alloc/free exerciser for the tracer.
//!
//! Drives the tracing hooks the way a traced allocator would: each worker
//! thread keeps a table of slots and randomly either frees an occupied slot
//! or fills an empty one with a fresh allocation, until its iteration
//! budget runs out.

use std::{env, process, thread, time::Duration};

use malloc_tracer::{finalize_tracing, init, sprint_stats, with_instance, TracerConfig};

struct Options {
  slots: usize,
  min_size: usize,
  max_size: usize,
  iters: u64,
  threads: usize,
  trace_path: Option<String>,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      slots: 16384,
      min_size: 1024,
      max_size: 1024 * 1024,
      iters: 1_000_000,
      threads: 4,
      trace_path: None,
    }
  }
}

fn usage(program: &str) -> ! {
  eprintln!(
    "Usage: {program} [-n <slots>] [-f <smallest alloc>] [-t <largest alloc>] \
     [-i <iterations>] [-j <threads>] [-o <trace file>]"
  );
  process::exit(1);
}

fn parse_options() -> Options {
  let mut options = Options::default();
  let mut args = env::args();
  let program = args.next().unwrap_or_else(|| "random-mallocer".into());

  while let Some(flag) = args.next() {
    let Some(value) = args.next() else {
      usage(&program);
    };

    let parsed = value.parse::<u64>();

    match (flag.as_str(), parsed) {
      ("-n", Ok(n)) => options.slots = n as usize,
      ("-f", Ok(n)) => options.min_size = n as usize,
      ("-t", Ok(n)) => options.max_size = n as usize,
      ("-i", Ok(n)) => options.iters = n,
      ("-j", Ok(n)) => options.threads = n.max(1) as usize,
      ("-o", _) => options.trace_path = Some(value),
      _ => usage(&program),
    }
  }

  if options.max_size <= options.min_size || options.slots == 0 {
    usage(&program);
  }

  options
}

fn xorshift(state: &mut u64) -> u64 {
  let mut x = *state;
  x ^= x << 13;
  x ^= x >> 7;
  x ^= x << 17;
  *state = x;
  x
}

fn run_worker(options: &Options, seed: u64) {
  let mut slots: Vec<Option<u64>> = vec![None; options.slots];
  let mut rng = seed | 1;
  let span = (options.max_size - options.min_size) as u64;

  for _ in 0..options.iters {
    let idx = (xorshift(&mut rng) % options.slots as u64) as usize;

    if let Some(token) = slots[idx].take() {
      with_instance(|tracer| tracer.trace_free(token));
      continue;
    }

    let size = options.min_size + (xorshift(&mut rng) % span) as usize;
    slots[idx] = Some(with_instance(|tracer| tracer.trace_malloc(size)));
  }

  for token in slots.into_iter().flatten() {
    with_instance(|tracer| tracer.trace_free(token));
  }
}

fn main() {
  let options = parse_options();

  let mut config = TracerConfig::default().with_dumper_period(Duration::from_micros(3000));
  if let Some(path) = &options.trace_path {
    config = config.with_trace_path(path);
  }
  init(config);

  thread::scope(|scope| {
    for worker in 0..options.threads {
      let options = &options;
      let seed = 0x9e3779b97f4a7c15u64.wrapping_mul(worker as u64 + 1);
      scope.spawn(move || run_worker(options, seed));
    }
  });

  finalize_tracing();

  let mut report = [0u8; 256];
  let len = sprint_stats(&mut report);
  print!("{}", String::from_utf8_lossy(&report[..len]));
}
