//! Cycle-keyed discrete-event scheduler: the timer wheel of §4.3.
//!
//! Single-threaded, cooperative. `process_expired` is driven by the
//! execution loop once per cycle budget; callbacks run synchronously and
//! may reschedule further events on the same queue, but must not block or
//! re-enter the CPU.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub type Cycle = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

struct Slot {
    deadline: Cycle,
    period: Option<Cycle>,
    enabled: bool,
    /// Bumped on every reschedule; invalidates stale heap entries left
    /// behind by `set_delay`/`advance`/periodic re-arm without a decrease-key
    /// operation on the heap itself.
    generation: u64,
    callback: Option<Box<dyn FnMut(&mut TimerQueue, Cycle)>>,
}

struct HeapEntry {
    deadline: Cycle,
    seq: u64,
    slot: usize,
    generation: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline
        // (and, on a tie, the earliest insertion sequence) on top.
        other.deadline.cmp(&self.deadline).then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TimerQueue {
    slots: Vec<Slot>,
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self { slots: Vec::new(), heap: BinaryHeap::new(), next_seq: 0 }
    }

    fn push(&mut self, slot: usize, deadline: Cycle, generation: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { deadline, seq, slot, generation });
    }

    /// Inserts a new event firing at `deadline`, optionally recurring every
    /// `period` cycles thereafter.
    pub fn add(
        &mut self,
        deadline: Cycle,
        period: Option<Cycle>,
        callback: Box<dyn FnMut(&mut TimerQueue, Cycle)>,
    ) -> TimerId {
        let idx = self.slots.len();
        self.slots.push(Slot { deadline, period, enabled: true, generation: 0, callback: Some(callback) });
        self.push(idx, deadline, 0);
        TimerId(idx)
    }

    fn slot_mut(&mut self, id: TimerId) -> &mut Slot {
        &mut self.slots[id.0]
    }

    /// Reschedules to fire `cycles` cycles from `now`.
    pub fn set_delay(&mut self, id: TimerId, now: Cycle, cycles: Cycle) {
        let deadline = now + cycles;
        let slot = self.slot_mut(id);
        slot.deadline = deadline;
        slot.generation += 1;
        let gen = slot.generation;
        self.push(id.0, deadline, gen);
    }

    /// Reschedules to fire `cycles` cycles from the *previous* deadline
    /// (period-stable — doesn't drift against wall/cycle time like
    /// rescheduling from `now` would).
    pub fn advance(&mut self, id: TimerId, cycles: Cycle) {
        let slot = self.slot_mut(id);
        slot.deadline += cycles;
        slot.generation += 1;
        let (deadline, gen) = (slot.deadline, slot.generation);
        self.push(id.0, deadline, gen);
    }

    pub fn disable(&mut self, id: TimerId) {
        self.slot_mut(id).enabled = false;
    }

    /// Re-enables, reinserting at the deadline last recorded for this timer.
    pub fn enable(&mut self, id: TimerId) {
        let slot = self.slot_mut(id);
        slot.enabled = true;
        slot.generation += 1;
        let (deadline, gen) = (slot.deadline, slot.generation);
        self.push(id.0, deadline, gen);
    }

    pub fn is_enabled(&self, id: TimerId) -> bool {
        self.slots[id.0].enabled
    }

    pub fn deadline(&self, id: TimerId) -> Cycle {
        self.slots[id.0].deadline
    }

    /// Fires all events due at or before `now`, in deadline order (FIFO on
    /// ties), re-arming periodic ones. Two-phase: first drains the full due
    /// set from the heap, then invokes callbacks — so a periodic timer whose
    /// re-armed deadline is still `<= now` fires next pass, not this one.
    pub fn process_expired(&mut self, now: Cycle) {
        let mut due: Vec<(usize, Cycle)> = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            let slot = &self.slots[entry.slot];
            if entry.generation != slot.generation || !slot.enabled {
                continue; // stale reschedule or lazily-cancelled entry
            }
            due.push((entry.slot, entry.deadline));
        }

        for (idx, fired_deadline) in due {
            tracing::trace!(slot = idx, deadline = fired_deadline, now, "timer fired");
            if let Some(period) = self.slots[idx].period {
                let new_deadline = self.slots[idx].deadline + period;
                self.slots[idx].deadline = new_deadline;
                self.slots[idx].generation += 1;
                let gen = self.slots[idx].generation;
                self.push(idx, new_deadline, gen);
            }
            let mut callback = self.slots[idx].callback.take();
            if let Some(cb) = &mut callback {
                cb(self, fired_deadline);
            }
            self.slots[idx].callback = callback;
        }
    }
}
