//! Thin OS layer: monotonic clock, current-CPU query, anonymous page
//! mappings for the slab, and the process-wide memory barrier used by the
//! dump protocol.

use std::ptr;

#[cfg(target_os = "linux")]
use std::sync::atomic::{AtomicU8, Ordering};

/// Raw monotonic nanoseconds. Callers subtract the tracer's base timestamp
/// before encoding.
#[must_use]
pub fn monotonic_nanos() -> u64 {
  let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };

  // SAFETY: `ts` is a valid out-pointer; CLOCK_MONOTONIC cannot fail.
  unsafe {
    libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
  }

  ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Id of the CPU this thread is currently running on.
#[cfg(target_os = "linux")]
#[must_use]
pub fn current_cpu() -> u32 {
  // SAFETY: no preconditions; a negative return means the kernel predates
  // getcpu, in which case core 0 is as good an answer as any.
  let cpu = unsafe { libc::sched_getcpu() };
  cpu.max(0) as u32
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn current_cpu() -> u32 {
  0
}

/// Map `len` bytes of zeroed anonymous memory, page-aligned. Returns null on
/// failure.
pub fn map_pages(len: usize) -> *mut u8 {
  // SAFETY: anonymous private mapping with no address hint.
  let ptr = unsafe {
    libc::mmap(
      ptr::null_mut(),
      len,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    ptr::null_mut()
  } else {
    ptr.cast()
  }
}

/// Unmap a region previously returned by [`map_pages`].
///
/// # Safety
///
/// `ptr`/`len` must denote exactly one live mapping from [`map_pages`] and
/// nothing may reference it afterwards.
pub unsafe fn unmap_pages(ptr: *mut u8, len: usize) {
  unsafe {
    libc::munmap(ptr.cast(), len);
  }
}

#[cfg(target_os = "linux")]
const MEMBARRIER_UNPROBED: u8 = 0;
#[cfg(target_os = "linux")]
const MEMBARRIER_READY: u8 = 1;
#[cfg(target_os = "linux")]
const MEMBARRIER_UNAVAILABLE: u8 = 2;

#[cfg(target_os = "linux")]
static MEMBARRIER_STATE: AtomicU8 = AtomicU8::new(MEMBARRIER_UNPROBED);

/// Force a full memory barrier on every CPU currently running this process.
///
/// After this returns, all stores completed by any thread before the call
/// are visible to the calling thread. Preferred mechanism is the expedited
/// private membarrier; kernels without it get the classic fallback of
/// touching a page and immediately discarding it, which drives a TLB
/// shootdown IPI (and hence a barrier) to every core running our mm.
#[cfg(target_os = "linux")]
pub fn process_wide_barrier() {
  match MEMBARRIER_STATE.load(Ordering::Relaxed) {
    MEMBARRIER_READY => {
      // SAFETY: plain syscall, registered below.
      let rv = unsafe {
        libc::syscall(libc::SYS_membarrier, libc::MEMBARRIER_CMD_PRIVATE_EXPEDITED, 0)
      };
      if rv == 0 {
        return;
      }
      MEMBARRIER_STATE.store(MEMBARRIER_UNAVAILABLE, Ordering::Relaxed);
      madvise_barrier();
    }
    MEMBARRIER_UNAVAILABLE => madvise_barrier(),
    _ => {
      // SAFETY: registration syscall; failure just means we fall back.
      let rv = unsafe {
        libc::syscall(
          libc::SYS_membarrier,
          libc::MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED,
          0,
        )
      };

      if rv == 0 {
        MEMBARRIER_STATE.store(MEMBARRIER_READY, Ordering::Relaxed);
        process_wide_barrier();
      } else {
        MEMBARRIER_STATE.store(MEMBARRIER_UNAVAILABLE, Ordering::Relaxed);
        madvise_barrier();
      }
    }
  }
}

#[cfg(not(target_os = "linux"))]
pub fn process_wide_barrier() {
  // Weaker than the Linux variants: orders this thread against others that
  // also fence, which the relaxed snapshot loads tolerate (missed bytes are
  // picked up by the next dump pass).
  std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

#[cfg(target_os = "linux")]
fn madvise_barrier() {
  use std::cell::UnsafeCell;

  #[repr(align(4096))]
  struct BarrierPage(UnsafeCell<[u8; 4096]>);

  // SAFETY: the page is only ever touched volatilely, any torn value is fine.
  unsafe impl Sync for BarrierPage {}

  static PAGE: BarrierPage = BarrierPage(UnsafeCell::new([0; 4096]));

  // SAFETY: volatile read-modify-write keeps the page resident so the
  // madvise below has a mapping to shoot down.
  unsafe {
    let page: *mut u8 = PAGE.0.get().cast();
    let byte = ptr::read_volatile(page);
    ptr::write_volatile(page, byte);
    libc::madvise(page.cast(), 4096, libc::MADV_DONTNEED);
  }
}
