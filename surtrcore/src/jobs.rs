// SPDX-License-Identifier: MIT
// Copyright (C) 2026 The Surtr Project
//! Single-producer, multi-consumer lock-free job ring.
//!
//! Each slot is one cache line and its `sequence` word is the sole
//! synchronization primitive: slot `i` starts at sequence `i`; the producer
//! publishes by storing `head + 1`, a consumer hands the slot back for the
//! next lap by storing `claimed_tail + N`.
//!
//! Thread safety:
//!   * [`Producer`] operations: bootstrap core only (the handle is issued
//!     once)
//!   * [`Jobs::run_next`]: any number of consumer cores
//!
//! Payloads are limited to [`PAYLOAD`] bytes, checked at compile time.

use core::cell::UnsafeCell;
use core::mem::{align_of, size_of, MaybeUninit};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub const CACHE_LINE: usize = 64;

type Runner = unsafe fn(*mut u8);

/// Payload budget of one slot: a cache line minus runner, sequence and pad.
pub const PAYLOAD: usize = CACHE_LINE - size_of::<Runner>() - 2 * size_of::<u32>();

/// A unit of work. `run` consumes the job; whatever it owns is released
/// when it returns.
pub trait Job: Send + 'static {
    fn run(self);
}

#[repr(C, align(64))]
struct Slot {
    payload: UnsafeCell<MaybeUninit<[u8; PAYLOAD]>>,
    runner: UnsafeCell<MaybeUninit<Runner>>,
    sequence: AtomicU32,
    _pad: u32,
}

impl Slot {
    const EMPTY: Slot = Slot {
        payload: UnsafeCell::new(MaybeUninit::uninit()),
        runner: UnsafeCell::new(MaybeUninit::uninit()),
        sequence: AtomicU32::new(0),
        _pad: 0,
    };
}

const _: () = assert!(size_of::<Slot>() == CACHE_LINE);

#[repr(align(64))]
struct Line<T>(T);

/// The ring. `head`, `tail` and `completed` each own a cache line so the
/// producer and the consumers never share one.
#[repr(C)]
pub struct Jobs<const N: usize> {
    slots: [Slot; N],
    head: Line<AtomicU32>,
    tail: Line<AtomicU32>,
    completed: Line<AtomicU32>,
    producer_taken: Line<AtomicBool>,
}

unsafe impl<const N: usize> Sync for Jobs<N> {}

unsafe fn invoke<T: Job>(payload: *mut u8) {
    payload.cast::<T>().read().run()
}

impl<const N: usize> Jobs<N> {
    pub const fn new() -> Self {
        assert!(N.is_power_of_two() && N > 1);
        assert!(N <= u32::MAX as usize / 2);
        Self {
            slots: [Slot::EMPTY; N],
            head: Line(AtomicU32::new(0)),
            tail: Line(AtomicU32::new(0)),
            completed: Line(AtomicU32::new(0)),
            producer_taken: Line(AtomicBool::new(false)),
        }
    }

    /// Reset counters and stamp each slot with its initial sequence. Must
    /// run before the first submission and before consumers attach.
    pub fn init(&self) {
        self.head.0.store(0, Ordering::Relaxed);
        self.tail.0.store(0, Ordering::Relaxed);
        self.completed.0.store(0, Ordering::Relaxed);
        for (i, slot) in self.slots.iter().enumerate() {
            slot.sequence.store(i as u32, Ordering::Relaxed);
        }
    }

    /// Hand out the single producer capability. A second claim is a bug.
    pub fn producer(&self) -> Producer<'_, N> {
        let was = self.producer_taken.0.swap(true, Ordering::AcqRel);
        assert!(!was, "job queue already has a producer");
        Producer { queue: self }
    }

    /// Run one ready job. Returns false when nothing is ready at the
    /// current tail. Safe from any consumer core.
    pub fn run_next(&self) -> bool {
        // Optimistic tail read; staleness is caught by the sequence check
        // or the claim below.
        let mut t = self.tail.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[t as usize & (N - 1)];
            let seq = slot.sequence.load(Ordering::Acquire);
            if seq != t.wrapping_add(1) {
                return false;
            }
            // Claim the slot from competing consumers. Weak is fine: a
            // spurious failure just loops with the refreshed tail.
            match self.tail.0.compare_exchange_weak(
                t,
                t.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    unsafe {
                        let runner = (*slot.runner.get()).assume_init();
                        runner((*slot.payload.get()).as_mut_ptr().cast());
                    }
                    // Hand the slot to the producer for the next lap.
                    slot.sequence
                        .store(t.wrapping_add(N as u32), Ordering::Release);
                    self.completed.0.fetch_add(1, Ordering::Release);
                    return true;
                }
                Err(current) => t = current,
            }
        }
    }
}

/// Producer side of a [`Jobs`] ring. Held by the bootstrap core only.
pub struct Producer<'a, const N: usize> {
    queue: &'a Jobs<N>,
}

impl<'a, const N: usize> Producer<'a, N> {
    /// Place a job, or give it back if the slot for `head` is still owned
    /// by the previous lap.
    pub fn try_add<T: Job>(&mut self, job: T) -> Result<(), T> {
        const {
            assert!(size_of::<T>() <= PAYLOAD, "job too large for a queue slot");
            assert!(align_of::<T>() <= CACHE_LINE);
        }

        let q = self.queue;
        let head = q.head.0.load(Ordering::Relaxed);
        let slot = &q.slots[head as usize & (N - 1)];
        if slot.sequence.load(Ordering::Acquire) != head {
            return Err(job);
        }
        unsafe {
            (*slot.payload.get()).as_mut_ptr().cast::<T>().write(job);
            (*slot.runner.get()).write(invoke::<T>);
        }
        q.head.0.store(head.wrapping_add(1), Ordering::Relaxed);
        // Publish: pairs with the consumer's acquire of `sequence`.
        slot.sequence.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Spin until the ring accepts the job.
    pub fn add<T: Job>(&mut self, job: T) {
        let mut job = job;
        loop {
            match self.try_add(job) {
                Ok(()) => return,
                Err(back) => {
                    job = back;
                    core::hint::spin_loop();
                }
            }
        }
    }

    /// Jobs submitted but not yet completed. Monotonic snapshot.
    pub fn active_count(&self) -> u32 {
        let q = self.queue;
        q.head
            .0
            .load(Ordering::Relaxed)
            .wrapping_sub(q.completed.0.load(Ordering::Relaxed))
    }

    /// Spin until every submitted job has completed. On return, all side
    /// effects of those jobs are visible to the caller.
    pub fn wait_idle(&self) {
        let q = self.queue;
        let head = q.head.0.load(Ordering::Relaxed);
        while q.completed.0.load(Ordering::Acquire) != head {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32 as StdAtomicU32, Ordering as StdOrdering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    struct Record {
        seen: Arc<Mutex<Vec<u32>>>,
        value: u32,
    }

    impl Job for Record {
        fn run(self) {
            self.seen.lock().unwrap().push(self.value);
        }
    }

    struct Count(Arc<StdAtomicU32>);

    impl Job for Count {
        fn run(self) {
            self.0.fetch_add(1, StdOrdering::SeqCst);
        }
    }

    fn fresh() -> &'static Jobs<256> {
        let q: &'static Jobs<256> = Box::leak(Box::new(Jobs::new()));
        q.init();
        q
    }

    #[test]
    fn slot_geometry() {
        assert_eq!(PAYLOAD, 48);
        assert_eq!(size_of::<Slot>(), 64);
        assert_eq!(core::mem::align_of::<Jobs<256>>(), 64);
    }

    #[test]
    fn empty_ring_runs_nothing() {
        let q = fresh();
        assert!(!q.run_next());
    }

    #[test]
    #[should_panic(expected = "already has a producer")]
    fn second_producer_claim_panics() {
        let q = fresh();
        let _a = q.producer();
        let _b = q.producer();
    }

    #[test]
    fn fills_to_capacity_then_rejects() {
        let q = fresh();
        let mut p = q.producer();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..256u32 {
            let job = Record {
                seen: seen.clone(),
                value: i,
            };
            assert!(p.try_add(job).is_ok(), "slot {} refused", i);
        }
        assert!(p
            .try_add(Record {
                seen: seen.clone(),
                value: 256,
            })
            .is_err());
        assert_eq!(p.active_count(), 256);
        // Draining one slot makes room for exactly one more.
        assert!(q.run_next());
        assert!(p
            .try_add(Record {
                seen: seen.clone(),
                value: 256,
            })
            .is_ok());
    }

    #[test]
    fn single_consumer_preserves_submission_order() {
        let q = fresh();
        let mut p = q.producer();
        let seen = Arc::new(Mutex::new(Vec::new()));

        // 300 jobs through a 256-slot ring: interleave draining the way a
        // concurrent consumer would, then check order end to end.
        let mut submitted = 0u32;
        let mut drained = 0usize;
        while submitted < 300 {
            let job = Record {
                seen: seen.clone(),
                value: submitted,
            };
            match p.try_add(job) {
                Ok(()) => submitted += 1,
                Err(_) => {
                    assert!(q.run_next());
                    drained += 1;
                }
            }
        }
        while q.run_next() {
            drained += 1;
        }
        assert_eq!(drained, 300);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 300);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn multi_consumer_runs_each_job_exactly_once() {
        let q = fresh();
        let ran: Arc<Mutex<HashSet<u32>>> = Arc::new(Mutex::new(HashSet::new()));
        let stop = Arc::new(StdAtomicU32::new(0));

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let stop = stop.clone();
                thread::spawn(move || {
                    while stop.load(StdOrdering::SeqCst) == 0 {
                        if !q.run_next() {
                            std::hint::spin_loop();
                        }
                    }
                    while q.run_next() {}
                })
            })
            .collect();

        struct Mark {
            ran: Arc<Mutex<HashSet<u32>>>,
            id: u32,
        }
        impl Job for Mark {
            fn run(self) {
                assert!(self.ran.lock().unwrap().insert(self.id), "job ran twice");
            }
        }

        let mut p = q.producer();
        for id in 0..2000u32 {
            p.add(Mark {
                ran: ran.clone(),
                id,
            });
        }
        p.wait_idle();
        assert_eq!(p.active_count(), 0);

        stop.store(1, StdOrdering::SeqCst);
        for c in consumers {
            c.join().unwrap();
        }
        assert_eq!(ran.lock().unwrap().len(), 2000);
    }

    #[test]
    fn wait_idle_observes_all_side_effects() {
        let q = fresh();
        let counter = Arc::new(StdAtomicU32::new(0));
        let stop = Arc::new(StdAtomicU32::new(0));
        let consumer = {
            let stop = stop.clone();
            thread::spawn(move || {
                while stop.load(StdOrdering::SeqCst) == 0 {
                    if !q.run_next() {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        let mut p = q.producer();
        for _ in 0..256 {
            p.add(Count(counter.clone()));
        }
        p.wait_idle();
        assert_eq!(counter.load(StdOrdering::SeqCst), 256);

        stop.store(1, StdOrdering::SeqCst);
        consumer.join().unwrap();
    }

    #[test]
    fn payloads_are_released_after_running() {
        let q = fresh();
        let mut p = q.producer();
        let tracked = Arc::new(());

        struct Hold(Arc<()>);
        impl Job for Hold {
            fn run(self) {}
        }

        p.try_add(Hold(tracked.clone())).ok().unwrap();
        assert_eq!(Arc::strong_count(&tracked), 2);
        assert!(q.run_next());
        assert_eq!(Arc::strong_count(&tracked), 1);
    }

    #[test]
    fn ring_survives_many_laps() {
        let q = fresh();
        let mut p = q.producer();
        let counter = Arc::new(StdAtomicU32::new(0));
        for _ in 0..10 {
            for _ in 0..256 {
                p.add(Count(counter.clone()));
            }
            while q.run_next() {}
            p.wait_idle();
        }
        assert_eq!(counter.load(StdOrdering::SeqCst), 2560);
    }
}
