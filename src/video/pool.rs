//! Capture buffer pool
//!
//! A fixed set of `NUM_SLOTS` pixel buffers cycles between three owners: the
//! capture worker's fill stock ("with driver"), the ready queue (filled,
//! awaiting the pipeline) and the free queue (consumed, awaiting recycling).
//! The ready queue is capped so the worker always keeps at least
//! `MIN_HEADSPACE` buffers to fill; admitting a frame past the cap evicts the
//! oldest ready frame.
//!
//! The consumer side hands out [`FrameRef`], a move-only handle that returns
//! its slot to the free queue when dropped, so a frame can never be read
//! after its buffer has been recycled.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::format::Resolution;
use crate::error::{AppError, Result};

/// Number of pooled capture buffers
pub const NUM_SLOTS: usize = 10;
/// Minimum buffers kept on the fill side at all times
pub const MIN_HEADSPACE: usize = 3;
/// Maximum ready-queue depth implied by the headspace requirement
const READY_CAPACITY: usize = NUM_SLOTS - MIN_HEADSPACE;

/// One pooled buffer, identified for accounting and carrying its pixels.
#[derive(Debug)]
pub struct SlotBuf {
    pub index: usize,
    pub data: Vec<u8>,
}

struct Shared {
    ready: Mutex<VecDeque<SlotBuf>>,
    ready_cv: Condvar,
    free: Mutex<Vec<SlotBuf>>,
    /// Producer has exited cleanly.
    closed: AtomicBool,
    /// Producer has exited after a fatal capture error.
    failed: AtomicBool,
}

/// Create a pool for the given geometry. The producer starts out owning all
/// `NUM_SLOTS` buffers in its fill stock.
pub fn frame_pool(resolution: Resolution, bytes_per_pixel: usize) -> (Producer, Consumer) {
    let slot_len = resolution.pixels() * bytes_per_pixel;
    let shared = Arc::new(Shared {
        ready: Mutex::new(VecDeque::with_capacity(READY_CAPACITY)),
        ready_cv: Condvar::new(),
        free: Mutex::new(Vec::with_capacity(NUM_SLOTS)),
        closed: AtomicBool::new(false),
        failed: AtomicBool::new(false),
    });

    let fill = (0..NUM_SLOTS)
        .map(|index| SlotBuf {
            index,
            data: Vec::with_capacity(slot_len),
        })
        .collect();

    (
        Producer {
            shared: shared.clone(),
            fill,
        },
        Consumer { shared, resolution },
    )
}

/// Capture-worker side of the pool.
pub struct Producer {
    shared: Arc<Shared>,
    fill: VecDeque<SlotBuf>,
}

impl Producer {
    /// Recycle consumer-released buffers into the fill stock.
    pub fn reclaim(&mut self) {
        let mut free = self.shared.free.lock();
        for mut slot in free.drain(..) {
            slot.data.clear();
            self.fill.push_back(slot);
        }
    }

    /// Take an empty buffer to fill. The headspace invariant guarantees one
    /// is available after every `commit`.
    pub fn take_empty(&mut self) -> Option<SlotBuf> {
        if self.fill.is_empty() {
            self.reclaim();
        }
        self.fill.pop_front()
    }

    /// Admit a filled buffer to the ready queue and wake the consumer.
    ///
    /// When the ready queue is at capacity the oldest ready frame is evicted
    /// through the free queue; the free queue is then drained back into the
    /// fill stock so the headspace invariant holds on return.
    pub fn commit(&mut self, slot: SlotBuf) {
        {
            let mut ready = self.shared.ready.lock();
            if ready.len() >= READY_CAPACITY {
                let evicted = ready.pop_front();
                // Eviction path: ready lock held first, then free.
                let mut free = self.shared.free.lock();
                if let Some(evicted) = evicted {
                    free.push(evicted);
                }
            }
            ready.push_back(slot);
            self.shared.ready_cv.notify_one();
        }
        self.reclaim();
    }

    /// Buffers currently on the fill side.
    pub fn headspace(&self) -> usize {
        self.fill.len()
    }

    /// (with-driver, ready, free) slot counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        let ready = self.shared.ready.lock().len();
        let free = self.shared.free.lock().len();
        (self.fill.len(), ready, free)
    }

    /// Mark the producer as gone and wake any blocked consumer.
    pub fn close(&mut self, fatal: bool) {
        if fatal {
            self.shared.failed.store(true, Ordering::SeqCst);
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.ready_cv.notify_all();
    }
}

/// Pipeline side of the pool.
pub struct Consumer {
    shared: Arc<Shared>,
    resolution: Resolution,
}

impl Consumer {
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Block until a ready frame exists and return the newest one, plus the
    /// number of older ready frames that were dropped (drained to the free
    /// queue) in its favor.
    ///
    /// Returns `Err(Interrupt)` when `interrupt` is raised and
    /// `Err(CaptureGrabFail)` when the capture worker has died.
    pub fn latest(&self, interrupt: &AtomicBool) -> Result<(FrameRef, usize)> {
        let mut ready = self.shared.ready.lock();
        while ready.is_empty() {
            if self.shared.failed.load(Ordering::SeqCst) {
                return Err(AppError::CaptureGrabFail("capture worker exited".into()));
            }
            if interrupt.load(Ordering::SeqCst) || self.shared.closed.load(Ordering::SeqCst) {
                return Err(AppError::Interrupt);
            }
            // Bounded wait so an interrupt is observed even without a wakeup.
            self.shared
                .ready_cv
                .wait_for(&mut ready, Duration::from_millis(100));
        }

        let dropped = ready.len() - 1;
        if dropped > 0 {
            // Ready lock held first, then free.
            let mut free = self.shared.free.lock();
            while ready.len() > 1 {
                if let Some(stale) = ready.pop_front() {
                    free.push(stale);
                }
            }
        }

        let slot = ready
            .pop_front()
            .expect("ready queue cannot be empty here");
        Ok((
            FrameRef {
                slot: Some(slot),
                shared: self.shared.clone(),
                resolution: self.resolution,
            },
            dropped,
        ))
    }
}

/// Move-only handle to a ready frame. Dropping it releases the underlying
/// buffer back to the free queue.
pub struct FrameRef {
    slot: Option<SlotBuf>,
    shared: Arc<Shared>,
    resolution: Resolution,
}

impl FrameRef {
    /// Pixel data (row-major, tightly packed).
    pub fn data(&self) -> &[u8] {
        self.slot
            .as_ref()
            .map(|s| s.data.as_slice())
            .unwrap_or(&[])
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }
}

impl Drop for FrameRef {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.shared.free.lock().push(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> (Producer, Consumer) {
        frame_pool(Resolution::new(4, 2), 3)
    }

    fn fill_and_commit(producer: &mut Producer, tag: u8) {
        let mut slot = producer.take_empty().expect("fill stock exhausted");
        slot.data.clear();
        slot.data.extend_from_slice(&[tag; 24]);
        producer.commit(slot);
    }

    fn assert_invariant(producer: &Producer) {
        let (with_driver, ready, free) = producer.counts();
        assert_eq!(with_driver + ready + free, NUM_SLOTS);
        assert!(with_driver >= MIN_HEADSPACE, "headspace violated: {}", with_driver);
    }

    #[test]
    fn slot_counts_always_sum_to_pool_size() {
        let (mut producer, _consumer) = pool();
        assert_eq!(producer.counts(), (NUM_SLOTS, 0, 0));

        for tag in 0..20u8 {
            fill_and_commit(&mut producer, tag);
            assert_invariant(&producer);
        }
    }

    #[test]
    fn admission_evicts_oldest_when_headspace_would_drop() {
        let (mut producer, consumer) = pool();
        let stop = AtomicBool::new(false);

        for tag in 0..=READY_CAPACITY as u8 {
            fill_and_commit(&mut producer, tag);
        }
        // Eight commits into a capacity-seven queue: frame 0 was evicted.
        let (with_driver, ready, _free) = producer.counts();
        assert_eq!(ready, READY_CAPACITY);
        assert_eq!(with_driver, MIN_HEADSPACE);

        // Newest survives; the drained older frames count as drops.
        let (frame, dropped) = consumer.latest(&stop).unwrap();
        assert_eq!(dropped, READY_CAPACITY - 1);
        assert_eq!(frame.data()[0], READY_CAPACITY as u8);
    }

    #[test]
    fn latest_returns_newest_and_recycles_the_rest() {
        let (mut producer, consumer) = pool();
        let stop = AtomicBool::new(false);

        fill_and_commit(&mut producer, 1);
        fill_and_commit(&mut producer, 2);
        fill_and_commit(&mut producer, 3);

        let (frame, dropped) = consumer.latest(&stop).unwrap();
        assert_eq!(dropped, 2);
        assert_eq!(frame.data(), &[3u8; 24][..]);

        // The two stale frames moved to the free queue; the returned one is
        // still held by the FrameRef.
        let (_, ready, free) = producer.counts();
        assert_eq!(ready, 0);
        assert_eq!(free, 2);

        drop(frame);
        let (_, _, free) = producer.counts();
        assert_eq!(free, 3);

        producer.reclaim();
        assert_eq!(producer.counts(), (NUM_SLOTS, 0, 0));
    }

    #[test]
    fn latest_blocks_until_commit() {
        let (mut producer, consumer) = pool();
        let stop = Arc::new(AtomicBool::new(false));

        let stop2 = stop.clone();
        let handle = std::thread::spawn(move || {
            let (frame, dropped) = consumer.latest(&stop2).unwrap();
            (frame.data()[0], dropped)
        });

        std::thread::sleep(Duration::from_millis(20));
        fill_and_commit(&mut producer, 9);

        let (tag, dropped) = handle.join().unwrap();
        assert_eq!(tag, 9);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn interrupt_unblocks_waiting_consumer() {
        let (_producer, consumer) = pool();
        let stop = Arc::new(AtomicBool::new(false));

        let stop2 = stop.clone();
        let handle = std::thread::spawn(move || consumer.latest(&stop2));
        std::thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::SeqCst);

        match handle.join().unwrap() {
            Err(AppError::Interrupt) => {}
            other => panic!("expected Interrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn worker_death_reports_grab_failure() {
        let (mut producer, consumer) = pool();
        let stop = AtomicBool::new(false);

        producer.close(true);
        match consumer.latest(&stop) {
            Err(AppError::CaptureGrabFail(_)) => {}
            other => panic!("expected CaptureGrabFail, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn clean_close_reports_interrupt() {
        let (mut producer, consumer) = pool();
        let stop = AtomicBool::new(false);

        producer.close(false);
        match consumer.latest(&stop) {
            Err(AppError::Interrupt) => {}
            other => panic!("expected Interrupt, got {:?}", other.map(|_| ())),
        }
    }
}
