//! Global allocator wrapper that optionally meters live allocation counts,
//! following the same `#[global_allocator]` swap pattern as `block-watcher`'s
//! `allocator` module: a plain `std::alloc::System` by default, `mimalloc`
//! behind the `mimalloc` feature.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

pub struct StdAlloc;

// SAFETY: delegates directly to `System`, which is itself a valid
// `GlobalAlloc`.
unsafe impl GlobalAlloc for StdAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
    }
}

#[cfg(feature = "mimalloc")]
pub type MiMalloc = mimalloc::MiMalloc;

/// Wraps an allocator `A`, optionally counting live allocated bytes once
/// [`Allocator::start_metering`] is called. Metering is off by default so
/// the counter overhead is paid only when asked for.
pub struct Allocator<A> {
    inner: A,
    metering: AtomicBool,
    live_bytes: AtomicUsize,
}

impl<A> Allocator<A> {
    #[must_use]
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            metering: AtomicBool::new(false),
            live_bytes: AtomicUsize::new(0),
        }
    }

    pub fn start_metering(&self) {
        self.metering.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }
}

#[must_use]
pub const fn new_std() -> Allocator<StdAlloc> {
    Allocator::new(StdAlloc)
}

#[cfg(feature = "mimalloc")]
#[must_use]
pub const fn new_mimalloc() -> Allocator<MiMalloc> {
    Allocator::new(mimalloc::MiMalloc)
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if self.metering.load(Ordering::Relaxed) {
            self.live_bytes.fetch_add(layout.size(), Ordering::Relaxed);
        }
        self.inner.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if self.metering.load(Ordering::Relaxed) {
            self.live_bytes.fetch_sub(layout.size(), Ordering::Relaxed);
        }
        self.inner.dealloc(ptr, layout);
    }
}
