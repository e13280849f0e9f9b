//! Slab allocator for tracer cells.
//!
//! `ThreadTracer` instances must not come from the allocator being traced,
//! so they are carved out of dedicated anonymous mappings instead. Cells are
//! one page each and page-aligned; freed cells go on an intrusive free list
//! threaded through the cells themselves. All calls are made with the global
//! spinlock held, so there is no internal synchronization. Memory is never
//! returned to the OS.

use std::ptr;

use crate::tracer::TRACER_CELL_BYTES;

/// Cells fetched from the OS per region grow-step.
const CELLS_PER_REGION: usize = 64;

const REGION_BYTES: usize = CELLS_PER_REGION * TRACER_CELL_BYTES;

struct FreeCell {
  next: *mut FreeCell,
}

/// Fixed-size cell allocator backed by `mmap`.
pub struct TracerSlab {
  free_head: *mut FreeCell,
  region: *mut u8,
  region_used: usize,
}

// SAFETY: every access is serialized by the global spinlock.
unsafe impl Send for TracerSlab {}

impl TracerSlab {
  #[must_use]
  pub const fn new() -> Self {
    Self {
      free_head: ptr::null_mut(),
      region: ptr::null_mut(),
      region_used: REGION_BYTES,
    }
  }

  /// Hand out one page-aligned cell of [`TRACER_CELL_BYTES`] bytes.
  ///
  /// The contents are unspecified: fresh cells are zeroed by the kernel,
  /// recycled cells still hold the `0xfe` fill of their previous occupant.
  /// Aborts the process if the OS refuses to grow the slab; the tracer
  /// cannot honor its contract without it.
  pub fn alloc(&mut self) -> *mut u8 {
    if !self.free_head.is_null() {
      let cell = self.free_head;
      // SAFETY: cells on the free list are live slab cells we own.
      self.free_head = unsafe { (*cell).next };
      return cell.cast();
    }

    if self.region_used == REGION_BYTES {
      let region = crate::os::map_pages(REGION_BYTES);

      if region.is_null() {
        log::error!("malloc-tracer: tracer slab mmap of {REGION_BYTES} bytes failed");
        std::process::abort();
      }

      self.region = region;
      self.region_used = 0;
    }

    // SAFETY: region_used < REGION_BYTES, so the cell is inside the mapping.
    let cell = unsafe { self.region.add(self.region_used) };
    self.region_used += TRACER_CELL_BYTES;
    cell
  }

  /// Return a cell to the free list.
  ///
  /// # Safety
  ///
  /// `cell` must have come from [`TracerSlab::alloc`] on this slab and must
  /// not be referenced again until re-allocated.
  pub unsafe fn dealloc(&mut self, cell: *mut u8) {
    let cell: *mut FreeCell = cell.cast();
    unsafe {
      (*cell).next = self.free_head;
    }
    self.free_head = cell;
  }
}
