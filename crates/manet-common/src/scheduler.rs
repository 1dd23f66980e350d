//! Deterministic event scheduler.
//!
//! Events are ordered by `(time, id)`; ids are handed out in insertion order,
//! so events scheduled for the same instant dispatch first-in first-out.
//! Cancelled events stay in the heap and are discarded when they surface.

use crate::{EntityId, Event, EventId, EventPayload, SimError, SimTime};
use std::collections::{BinaryHeap, HashSet};

/// Pending-event queue and simulation clock.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BinaryHeap<Event>,
    pending: HashSet<EventId>,
    now: SimTime,
    next_event_id: u64,
    stop_time: Option<SimTime>,
    dispatched: u64,
}

impl Scheduler {
    /// Create an empty scheduler with the clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulation time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Set an inclusive stop time. Events after it are never dispatched.
    pub fn set_stop_time(&mut self, stop_time: SimTime) {
        self.stop_time = Some(stop_time);
    }

    /// Configured stop time, if any.
    pub fn stop_time(&self) -> Option<SimTime> {
        self.stop_time
    }

    /// Schedule an event at an absolute time.
    pub fn schedule(
        &mut self,
        time: SimTime,
        source: EntityId,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> Result<EventId, SimError> {
        if time < self.now {
            return Err(SimError::InvalidTime {
                requested: time,
                now: self.now,
            });
        }
        Ok(self.push(time, source, targets, payload))
    }

    /// Schedule an event after a delay relative to the current time.
    pub fn schedule_in(
        &mut self,
        delay: SimTime,
        source: EntityId,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> EventId {
        let time = self.now.saturating_add(delay);
        self.push(time, source, targets, payload)
    }

    fn push(
        &mut self,
        time: SimTime,
        source: EntityId,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> EventId {
        let id = EventId(self.next_event_id);
        self.next_event_id += 1;
        self.pending.insert(id);
        self.queue.push(Event {
            id,
            time,
            source,
            targets,
            payload,
        });
        id
    }

    /// Cancel a pending event. Returns false if it was already dispatched,
    /// already cancelled, or never existed.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.pending.remove(&id)
    }

    /// Returns true if the event is still waiting to be dispatched.
    pub fn is_pending(&self, id: EventId) -> bool {
        self.pending.contains(&id)
    }

    /// Number of events waiting to be dispatched.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of events dispatched so far.
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched
    }

    /// Time of the next live event, if any.
    pub fn peek_time(&mut self) -> Option<SimTime> {
        self.discard_cancelled();
        self.queue.peek().map(|e| e.time)
    }

    /// Pop the next live event and advance the clock to its time.
    ///
    /// Returns None when the queue is exhausted or the next event lies beyond
    /// the stop time. In the latter case the clock is advanced to the stop
    /// time and the event stays queued.
    pub fn pop_next(&mut self) -> Option<Event> {
        self.discard_cancelled();
        let next_time = self.queue.peek()?.time;
        if let Some(stop) = self.stop_time {
            if next_time > stop {
                self.now = self.now.max(stop);
                return None;
            }
        }
        let event = self.queue.pop()?;
        self.pending.remove(&event.id);
        self.now = event.time;
        self.dispatched += 1;
        Some(event)
    }

    fn discard_cancelled(&mut self) {
        while let Some(head) = self.queue.peek() {
            if self.pending.contains(&head.id) {
                break;
            }
            self.queue.pop();
        }
    }
}
