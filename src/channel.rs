// Copyright 2024-2026 David Allison
// All Rights Reserved
// See LICENSE file for licensing information.

use crate::bitset::AtomicBitSet64;
use crate::error::{FastIpcError, Result};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of sample slots per channel. One occupancy bit per slot, so this
/// equals the bit width of the occupancy word.
pub const NUM_SLOTS: usize = AtomicBitSet64::BITS;

// ── ChannelSample ───────────────────────────────────────────────────────────

/// Header of one sample slot. The payload bytes follow the header inline,
/// `max_payload_size` of them, so a full slot occupies
/// `size_of::<ChannelSample>() + max_payload_size` bytes.
///
/// `ref_count` counts active holders: readers between acquire and release,
/// a writer between prepare and submit, plus the implicit hold carried by
/// the slot currently designated latest. The remaining fields are written
/// only by the writer that owns the slot.
#[repr(C)]
pub struct ChannelSample {
    pub ref_count: AtomicU64,
    pub sequence_id: u64,
    pub size: u64,
    pub timestamp: u64,
}

const _: () = assert!(std::mem::size_of::<ChannelSample>() == 32);

// ── ChannelPage ─────────────────────────────────────────────────────────────

/// Header of a channel's shared memory segment.
///
/// The slot bank follows the header in the same segment: exactly `NUM_SLOTS`
/// samples, reached by pointer arithmetic. Both processes mapping the segment
/// must agree on this layout, which the compile-time size assertions pin down.
#[repr(C)]
pub struct ChannelPage {
    pub max_payload_size: u64,
    pub next_seq_id: AtomicU64,
    pub occupancy: AtomicBitSet64,
    pub latest_sample_index: AtomicU64,
    // Followed by: NUM_SLOTS samples. Accessed via sample_ptr().
}

const _: () = assert!(std::mem::size_of::<ChannelPage>() == 32);

/// Total segment size for a channel with the given payload size.
pub const fn total_size(max_payload_size: usize) -> usize {
    std::mem::size_of::<ChannelPage>()
        + NUM_SLOTS * (std::mem::size_of::<ChannelSample>() + max_payload_size)
}

impl ChannelPage {
    /// Initialises a fresh channel page in `ptr`.
    ///
    /// Slot 0 is weakly reserved as the default latest: its occupancy bit is
    /// set but its ref count stays zero, so the first acquire on a
    /// never-written channel observes the zeroed slot with sequence id 0.
    ///
    /// # Safety
    /// `ptr` must point to at least `total_size(max_payload_size)` bytes of
    /// writable memory, aligned for `ChannelPage`, with no live references
    /// into it.
    pub unsafe fn init_in_place(ptr: *mut u8, max_payload_size: usize) -> *mut ChannelPage {
        let page = ptr as *mut ChannelPage;
        page.write(ChannelPage {
            max_payload_size: max_payload_size as u64,
            next_seq_id: AtomicU64::new(1),
            occupancy: AtomicBitSet64::new(1),
            latest_sample_index: AtomicU64::new(0),
        });
        ptr.add(std::mem::size_of::<ChannelPage>()).write_bytes(
            0,
            NUM_SLOTS * (std::mem::size_of::<ChannelSample>() + max_payload_size),
        );
        page
    }

    pub fn sample_size(&self) -> usize {
        std::mem::size_of::<ChannelSample>() + self.max_payload_size as usize
    }

    fn samples_base(&self) -> *mut u8 {
        unsafe { (self as *const Self as *mut u8).add(std::mem::size_of::<Self>()) }
    }

    pub fn sample_ptr(&self, index: usize) -> *mut ChannelSample {
        debug_assert!(index < NUM_SLOTS);
        unsafe { self.samples_base().add(index * self.sample_size()) as *mut ChannelSample }
    }

    pub fn sample(&self, index: usize) -> &ChannelSample {
        unsafe { &*self.sample_ptr(index) }
    }

    pub fn payload_ptr(&self, index: usize) -> *mut u8 {
        unsafe { (self.sample_ptr(index) as *mut u8).add(std::mem::size_of::<ChannelSample>()) }
    }

    // ── Lock-free exchange ──────────────────────────────────────────────────

    /// Whether the latest sample carries a sequence id greater than
    /// `sequence_id`. Best-effort: a racing submit may be missed or
    /// double-reported across the call.
    pub fn has_new_data(&self, sequence_id: u64) -> bool {
        let index = self.latest_sample_index.load(Ordering::Relaxed) as usize;
        self.sample(index).sequence_id > sequence_id
    }

    /// Takes a reference on the latest sample and returns its slot index.
    ///
    /// Never blocks. The slot may stop being latest between the index load
    /// and the count bump; the caller still observes a coherent sample,
    /// possibly not the newest.
    pub fn acquire(&self) -> usize {
        let index = self.latest_sample_index.load(Ordering::Relaxed) as usize;
        let sample = self.sample(index);

        // The acquire pairs with the release in submit(), so payload bytes
        // written before publication are visible.
        sample.ref_count.fetch_add(1, Ordering::Acquire);

        // Hint that the sample is in use. Re-setting a set bit is benign.
        self.occupancy.set(index);

        index
    }

    /// Drops a reference taken by `acquire`. The caller must not touch the
    /// slot afterwards.
    pub fn release(&self, index: usize) {
        let count = self.sample(index).ref_count.fetch_sub(1, Ordering::Relaxed);

        // Last holder out drops the hint.
        if count == 1 {
            self.occupancy.toggle(index);
        }
    }

    /// Reserves a free slot for writing and assigns its sequence id.
    ///
    /// Spins (with scheduler yields) while all slots are held, so worst-case
    /// latency is unbounded. Selection walks clear occupancy bits from the
    /// low end; the CAS on the slot's ref count is the authoritative
    /// reservation, so stale hints are safe.
    pub fn prepare(&self) -> usize {
        loop {
            let mut occupancy = self.occupancy.snapshot();

            while occupancy != u64::MAX {
                let index = occupancy.trailing_ones() as usize;
                let sample = self.sample(index);

                if sample
                    .ref_count
                    .compare_exchange(0, 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // The sample is ours now.
                    self.occupancy.set(index);

                    // Bump the seq id now but stamp the timestamp at submit,
                    // making writer races visible from the observed ids.
                    let sequence_id = self.next_seq_id.fetch_add(1, Ordering::Relaxed);
                    unsafe { (*self.sample_ptr(index)).sequence_id = sequence_id };
                    return index;
                }

                // The clear hint was racy: the slot is live. Mark it tried in
                // the local snapshot and move on.
                occupancy |= 1u64 << index;
            }

            // Everything occupied, or every clear hint was racy.
            std::thread::yield_now();
        }
    }

    /// Publishes a slot obtained from `prepare`. The caller must not touch
    /// the slot afterwards.
    pub fn submit(&self, index: usize) {
        unsafe { (*self.sample_ptr(index)).timestamp = now_ns() };

        // The release pairs with readers' acquire on the ref count bump.
        let previous = self
            .latest_sample_index
            .swap(index as u64, Ordering::Release) as usize;

        // Drop the implicit hold of the displaced sample.
        let prev_sample = self.sample(previous);
        match prev_sample
            .ref_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            }) {
            // Last holder out drops the hint.
            Ok(1) => self.occupancy.toggle(previous),
            Ok(_) => {}
            // The count was already zero: the displaced sample was the weakly
            // reserved default latest, which carries a hint but no hold. Drop
            // the hint too, or the slot stays unselectable forever.
            Err(_) => self.occupancy.clear(previous),
        }
    }
}

// ── ChannelMapping ──────────────────────────────────────────────────────────

/// Exclusive ownership of one mapping of a channel segment.
///
/// Unmaps on drop with the total size recorded at map time. Endpoints own
/// exactly one of these; sample handles borrow the page through it.
#[derive(Debug)]
pub struct ChannelMapping {
    page: NonNull<ChannelPage>,
    total_size: usize,
}

unsafe impl Send for ChannelMapping {}
unsafe impl Sync for ChannelMapping {}

impl ChannelMapping {
    pub fn map(fd: RawFd, total_size: usize) -> Result<Self> {
        let ptr = map_memory(
            fd,
            total_size,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        )?;
        Ok(Self {
            page: NonNull::new(ptr as *mut ChannelPage)
                .ok_or_else(|| FastIpcError::Internal("mmap returned null".into()))?,
            total_size,
        })
    }

    pub fn page(&self) -> &ChannelPage {
        unsafe { self.page.as_ref() }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

impl Drop for ChannelMapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.page.cast(), self.total_size);
        }
    }
}

// ── Memory mapping helpers ──────────────────────────────────────────────────

pub fn map_memory(fd: RawFd, size: usize, prot: ProtFlags) -> Result<*mut u8> {
    let size = NonZeroUsize::new(size)
        .ok_or_else(|| FastIpcError::InvalidArgument("cannot map zero-size region".into()))?;
    unsafe {
        let borrowed = BorrowedFd::borrow_raw(fd);
        let ptr = mmap(None, size, prot, MapFlags::MAP_SHARED, borrowed, 0)?;
        Ok(ptr.as_ptr() as *mut u8)
    }
}

/// Wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
