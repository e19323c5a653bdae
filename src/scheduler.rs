//! Cycle-indexed event queue
//!
//! Every deferred action in the simulator (timer boundary, UART shift,
//! ADC conversion, EEPROM write completion, watchdog expiry, TWI bus
//! operation) is an entry in this queue, keyed by the absolute cycle at
//! which it becomes due. Entries scheduled for the same cycle run in
//! insertion order.
//!
//! Entries are identified by stable handles. When a dispatched callback
//! re-arms itself (by returning the next due-cycle to the bus), the entry
//! keeps its slot, so handles held by peripherals stay valid across
//! re-arms. Cancellation is lazy: the heap keeps a stale record which is
//! skipped on pop.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// The closed set of deferred peripheral actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedEvent {
    /// Timer n reached its next compare/overflow boundary
    Timer(usize),
    /// UART transmit shift register ran out of bits
    UartTx,
    /// SPI transfer complete
    SpiXfer,
    /// ADC conversion complete
    AdcConversion,
    /// EEPROM programming finished
    EepromWrite,
    /// Watchdog timeout
    Watchdog,
    /// TWI bus reached its next documented state
    TwiOp,
    /// Wake-up marker used while sleeping with an otherwise empty queue
    IdleTick,
}

/// Stable handle to a scheduled (or re-armable) entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    slot: u32,
    gen: u32,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    gen: u32,
    event: TimedEvent,
    due: u64,
    armed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    due: u64,
    seq: u64,
    slot: u32,
    gen: u32,
}

/// Min-heap of pending timed events
#[derive(Debug, Default)]
pub struct CycleQueue {
    heap: BinaryHeap<Reverse<HeapKey>>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    seq: u64,
}

impl CycleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry, keeping slot storage
    pub fn reset(&mut self) {
        self.heap.clear();
        self.free.clear();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.armed = false;
            slot.gen = slot.gen.wrapping_add(1);
            self.free.push(i as u32);
        }
        self.seq = 0;
    }

    /// Schedule `event` at absolute cycle `due`
    pub fn schedule(&mut self, event: TimedEvent, due: u64) -> Handle {
        let slot = match self.free.pop() {
            Some(s) => {
                let entry = &mut self.slots[s as usize];
                entry.event = event;
                entry.due = due;
                entry.armed = true;
                s
            }
            None => {
                self.slots.push(Slot { gen: 0, event, due, armed: true });
                (self.slots.len() - 1) as u32
            }
        };
        let gen = self.slots[slot as usize].gen;
        self.push_key(due, slot, gen);
        Handle { slot, gen }
    }

    /// Cancel an entry; stale handles are ignored
    pub fn cancel(&mut self, handle: Handle) {
        if let Some(slot) = self.live_slot(handle) {
            self.slots[slot].armed = false;
            self.slots[slot].gen = self.slots[slot].gen.wrapping_add(1);
            self.free.push(handle.slot);
        }
    }

    /// Move an entry to a new due-cycle, keeping its handle valid
    pub fn reschedule(&mut self, handle: Handle, due: u64) {
        if let Some(slot) = self.live_slot(handle) {
            self.slots[slot].due = due;
            self.slots[slot].armed = true;
            let gen = self.slots[slot].gen;
            self.push_key(due, handle.slot, gen);
        }
    }

    /// Earliest due-cycle among armed entries
    pub fn next_due(&mut self) -> Option<u64> {
        self.skim_stale();
        self.heap.peek().map(|Reverse(k)| k.due)
    }

    /// Pop the next entry due at or before `now`.
    ///
    /// The slot stays reserved so the dispatcher can re-arm it with
    /// [`CycleQueue::rearm`]; call [`CycleQueue::release`] when the
    /// callback chose not to repeat.
    pub fn pop_due(&mut self, now: u64) -> Option<(TimedEvent, u64, Handle)> {
        self.skim_stale();
        let Reverse(key) = *self.heap.peek()?;
        if key.due > now {
            return None;
        }
        self.heap.pop();
        let slot = &mut self.slots[key.slot as usize];
        slot.armed = false;
        Some((slot.event, key.due, Handle { slot: key.slot, gen: key.gen }))
    }

    /// Re-arm a popped entry at `due`, reusing its slot
    pub fn rearm(&mut self, handle: Handle, due: u64) {
        let slot = &mut self.slots[handle.slot as usize];
        debug_assert_eq!(slot.gen, handle.gen);
        debug_assert!(due > slot.due, "re-armed entry must move forward");
        slot.due = due;
        slot.armed = true;
        self.push_key(due, handle.slot, handle.gen);
    }

    /// Retire a popped entry that is not being re-armed
    pub fn release(&mut self, handle: Handle) {
        let slot = &mut self.slots[handle.slot as usize];
        if slot.gen == handle.gen && !slot.armed {
            slot.gen = slot.gen.wrapping_add(1);
            self.free.push(handle.slot);
        }
    }

    /// Whether the handle refers to a live, armed entry
    pub fn is_armed(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.slot as usize)
            .map(|s| s.gen == handle.gen && s.armed)
            .unwrap_or(false)
    }

    fn push_key(&mut self, due: u64, slot: u32, gen: u32) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(HeapKey { due, seq, slot, gen }));
    }

    fn live_slot(&self, handle: Handle) -> Option<usize> {
        let slot = self.slots.get(handle.slot as usize)?;
        (slot.gen == handle.gen && slot.armed).then_some(handle.slot as usize)
    }

    /// Drop heap records whose slot was cancelled or rescheduled
    fn skim_stale(&mut self) {
        while let Some(Reverse(key)) = self.heap.peek() {
            let slot = &self.slots[key.slot as usize];
            if slot.gen == key.gen && slot.armed && slot.due == key.due {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_and_pop() {
        let mut q = CycleQueue::new();
        q.schedule(TimedEvent::Watchdog, 100);
        assert_eq!(q.next_due(), Some(100));
        assert!(q.pop_due(99).is_none());

        let (event, due, h) = q.pop_due(100).unwrap();
        assert_eq!(event, TimedEvent::Watchdog);
        assert_eq!(due, 100);
        q.release(h);
        assert_eq!(q.next_due(), None);
    }

    #[test]
    fn test_ties_pop_in_insertion_order() {
        let mut q = CycleQueue::new();
        q.schedule(TimedEvent::Timer(0), 50);
        q.schedule(TimedEvent::UartTx, 50);
        q.schedule(TimedEvent::AdcConversion, 50);

        let (e1, _, h1) = q.pop_due(50).unwrap();
        let (e2, _, h2) = q.pop_due(50).unwrap();
        let (e3, _, h3) = q.pop_due(50).unwrap();
        assert_eq!(e1, TimedEvent::Timer(0));
        assert_eq!(e2, TimedEvent::UartTx);
        assert_eq!(e3, TimedEvent::AdcConversion);
        q.release(h1);
        q.release(h2);
        q.release(h3);
    }

    #[test]
    fn test_cancel() {
        let mut q = CycleQueue::new();
        let h = q.schedule(TimedEvent::EepromWrite, 10);
        q.cancel(h);
        assert_eq!(q.next_due(), None);
        assert!(q.pop_due(1000).is_none());

        // Cancelling again is harmless
        q.cancel(h);
    }

    #[test]
    fn test_reschedule_moves_entry() {
        let mut q = CycleQueue::new();
        let h = q.schedule(TimedEvent::SpiXfer, 10);
        q.reschedule(h, 200);
        assert_eq!(q.next_due(), Some(200));
        assert!(q.pop_due(100).is_none());

        let (event, due, h2) = q.pop_due(200).unwrap();
        assert_eq!(event, TimedEvent::SpiXfer);
        assert_eq!(due, 200);
        q.release(h2);
    }

    #[test]
    fn test_rearm_keeps_handle_valid() {
        let mut q = CycleQueue::new();
        let h = q.schedule(TimedEvent::Timer(1), 10);
        let (_, due, popped) = q.pop_due(10).unwrap();
        assert_eq!(popped, h);
        q.rearm(popped, due + 64);

        // The original handle still cancels the re-armed entry
        assert!(q.is_armed(h));
        q.cancel(h);
        assert!(q.pop_due(u64::MAX).is_none());
    }

    #[test]
    fn test_stale_handle_ignored_after_release() {
        let mut q = CycleQueue::new();
        let h = q.schedule(TimedEvent::UartTx, 5);
        let (_, _, popped) = q.pop_due(5).unwrap();
        q.release(popped);

        // Slot was recycled; the old handle must not touch the new entry
        let h2 = q.schedule(TimedEvent::Watchdog, 9);
        q.cancel(h);
        assert!(q.is_armed(h2));
    }

    #[test]
    fn test_popped_due_is_monotone() {
        let mut q = CycleQueue::new();
        q.schedule(TimedEvent::Timer(0), 30);
        q.schedule(TimedEvent::Timer(1), 10);
        q.schedule(TimedEvent::Timer(2), 20);

        let mut last = 0;
        while let Some((_, due, h)) = q.pop_due(u64::MAX) {
            assert!(due >= last);
            last = due;
            q.release(h);
        }
        assert_eq!(last, 30);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Entries always pop in non-decreasing due order, regardless of
        /// insertion order, with ties broken by insertion.
        #[test]
        fn pop_order_is_sorted_and_stable(dues in proptest::collection::vec(0u64..1000, 1..64)) {
            let mut q = CycleQueue::new();
            for (i, &due) in dues.iter().enumerate() {
                q.schedule(TimedEvent::Timer(i), due);
            }

            let mut popped = Vec::new();
            while let Some((event, due, h)) = q.pop_due(u64::MAX) {
                popped.push((due, event));
                q.release(h);
            }

            prop_assert_eq!(popped.len(), dues.len());
            for w in popped.windows(2) {
                prop_assert!(w[0].0 <= w[1].0);
                if w[0].0 == w[1].0 {
                    // Same due-cycle: insertion order preserved
                    let (TimedEvent::Timer(a), TimedEvent::Timer(b)) = (w[0].1, w[1].1) else {
                        unreachable!()
                    };
                    prop_assert!(a < b);
                }
            }
        }

        /// Cancelled entries never pop
        #[test]
        fn cancelled_entries_stay_dead(dues in proptest::collection::vec(0u64..100, 1..32)) {
            let mut q = CycleQueue::new();
            let handles: Vec<_> = dues
                .iter()
                .enumerate()
                .map(|(i, &due)| q.schedule(TimedEvent::Timer(i), due))
                .collect();
            for (i, h) in handles.iter().enumerate() {
                if i % 2 == 0 {
                    q.cancel(*h);
                }
            }

            let mut survivors = 0;
            while let Some((event, _, h)) = q.pop_due(u64::MAX) {
                let TimedEvent::Timer(i) = event else { unreachable!() };
                prop_assert!(i % 2 == 1);
                survivors += 1;
                q.release(h);
            }
            prop_assert_eq!(survivors, dues.len() / 2);
        }
    }
}
