//! Lock-free external event ring
//!
//! External observers (a GUI event loop, a test driving pin changes from
//! another thread) never touch simulator state directly. They push
//! "raise this IRQ with this value" records into this single-producer /
//! single-consumer ring; the core drains it between instructions on the
//! simulation thread. All peripheral state therefore stays owned by one
//! thread and the core needs no locks.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::irq::IrqId;

/// One external raise request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalEvent {
    pub irq: IrqId,
    pub value: u32,
}

struct Shared {
    slots: Box<[UnsafeCell<MaybeUninit<ExternalEvent>>]>,
    mask: usize,
    /// Next slot the producer writes; only the producer stores it
    head: AtomicUsize,
    /// Next slot the consumer reads; only the consumer stores it
    tail: AtomicUsize,
}

// The protocol guarantees each slot is touched by exactly one side at a
// time: the producer writes slots in [tail, head), the consumer reads
// slots in [tail, head) only after the head store is visible.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Producer half, handed to the external thread
pub struct EventSender {
    shared: Arc<Shared>,
}

/// Consumer half, owned by the simulator
pub struct EventReceiver {
    shared: Arc<Shared>,
}

/// Create a ring with capacity rounded up to a power of two
pub fn event_ring(capacity: usize) -> (EventSender, EventReceiver) {
    let cap = capacity.next_power_of_two().max(2);
    let slots = (0..cap)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(Shared {
        slots,
        mask: cap - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        EventSender { shared: shared.clone() },
        EventReceiver { shared },
    )
}

impl EventSender {
    /// Push an event; returns it back when the ring is full
    pub fn push(&self, event: ExternalEvent) -> Result<(), ExternalEvent> {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) > self.shared.mask {
            return Err(event);
        }
        let slot = &self.shared.slots[head & self.shared.mask];
        unsafe { (*slot.get()).write(event) };
        self.shared.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }
}

impl EventReceiver {
    /// Pop the oldest pending event, if any
    pub fn pop(&self) -> Option<ExternalEvent> {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let slot = &self.shared.slots[tail & self.shared.mask];
        let event = unsafe { (*slot.get()).assume_init() };
        self.shared.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(event)
    }

    pub fn is_empty(&self) -> bool {
        self.shared.tail.load(Ordering::Relaxed) == self.shared.head.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ev(n: u32) -> ExternalEvent {
        ExternalEvent { irq: IrqId(0), value: n }
    }

    #[test]
    fn test_push_pop_fifo() {
        let (tx, rx) = event_ring(8);
        tx.push(ev(1)).unwrap();
        tx.push(ev(2)).unwrap();
        tx.push(ev(3)).unwrap();

        assert_eq!(rx.pop().unwrap().value, 1);
        assert_eq!(rx.pop().unwrap().value, 2);
        assert_eq!(rx.pop().unwrap().value, 3);
        assert!(rx.pop().is_none());
    }

    #[test]
    fn test_full_ring_rejects() {
        let (tx, rx) = event_ring(4);
        for i in 0..4 {
            tx.push(ev(i)).unwrap();
        }
        assert!(tx.push(ev(99)).is_err());

        // Draining one slot makes room again
        assert_eq!(rx.pop().unwrap().value, 0);
        tx.push(ev(4)).unwrap();
    }

    #[test]
    fn test_capacity_rounds_up() {
        let (tx, rx) = event_ring(5);
        for i in 0..8 {
            tx.push(ev(i)).unwrap();
        }
        assert!(tx.push(ev(8)).is_err());
        for i in 0..8 {
            assert_eq!(rx.pop().unwrap().value, i);
        }
    }

    #[test]
    fn test_cross_thread_ordering() {
        let (tx, rx) = event_ring(64);
        let producer = thread::spawn(move || {
            for i in 0..10_000u32 {
                let mut event = ev(i);
                loop {
                    match tx.push(event) {
                        Ok(()) => break,
                        Err(e) => {
                            event = e;
                            thread::yield_now();
                        }
                    }
                }
            }
        });

        let mut expected = 0;
        while expected < 10_000 {
            if let Some(event) = rx.pop() {
                assert_eq!(event.value, expected);
                expected += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
    }
}
