//! Pending-event store shared by registration and the dispatch pass.
//!
//! Nothing in here locks. The quantizer wraps a [`PendingSet`] in a single
//! mutex and only ever holds it while mutating the set, never while a
//! callback runs: due events are moved out with [`PendingSet::drain_due`]
//! and fired after the guard is dropped.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
};

/// One-shot callback.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a registration. Repeating actions keep their id across repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Action that fires on every `beat_division` grid step until cancelled.
///
/// After each firing the dispatch pass re-inserts it at the next grid line,
/// quantized against the tempo in effect at that moment.
pub struct BeatAction {
    beat_division: u32,
    extra_delay: f64,
    action: Box<dyn FnMut() + Send + 'static>,
}

impl BeatAction {
    pub fn new(beat_division: u32, action: impl FnMut() + Send + 'static) -> Self {
        Self {
            beat_division,
            extra_delay: 0.0,
            action: Box::new(action),
        }
    }

    pub fn with_delay(mut self, extra_delay: f64) -> Self {
        self.extra_delay = extra_delay;
        self
    }

    pub fn beat_division(&self) -> u32 {
        self.beat_division
    }

    pub fn extra_delay(&self) -> f64 {
        self.extra_delay
    }
}

impl fmt::Debug for BeatAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeatAction")
            .field("beat_division", &self.beat_division)
            .field("extra_delay", &self.extra_delay)
            .finish_non_exhaustive()
    }
}

pub enum EventAction {
    Once(Callback),
    Repeating(BeatAction),
}

/// Result of invoking a due event.
#[derive(Debug)]
pub enum FireOutcome {
    Done,
    /// The repeating action fired and wants to be re-inserted.
    Repeat(EventId, BeatAction),
    /// The callback panicked. The payload message is kept for logging.
    Panicked(EventId, String),
}

pub struct ScheduledEvent {
    id: EventId,
    beat_division: u32,
    extra_delay: f64,
    scheduled_time: f64,
    fired: bool,
    action: EventAction,
}

impl ScheduledEvent {
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn beat_division(&self) -> u32 {
        self.beat_division
    }

    pub fn extra_delay(&self) -> f64 {
        self.extra_delay
    }

    pub fn scheduled_time(&self) -> f64 {
        self.scheduled_time
    }

    pub fn is_fired(&self) -> bool {
        self.fired
    }

    pub fn is_due(&self, now: f64) -> bool {
        !self.fired && now >= self.scheduled_time
    }

    /// Invokes the callback, containing any panic it raises.
    pub fn fire(self) -> FireOutcome {
        let id = self.id;
        let result = match self.action {
            EventAction::Once(callback) => {
                panic::catch_unwind(AssertUnwindSafe(callback)).map(|_| None)
            }
            EventAction::Repeating(mut repeat) => {
                panic::catch_unwind(AssertUnwindSafe(|| (repeat.action)())).map(|_| Some(repeat))
            }
        };

        match result {
            Ok(None) => FireOutcome::Done,
            Ok(Some(repeat)) => FireOutcome::Repeat(id, repeat),
            Err(payload) => FireOutcome::Panicked(id, panic_message(payload.as_ref())),
        }
    }
}

impl fmt::Debug for ScheduledEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledEvent")
            .field("id", &self.id)
            .field("beat_division", &self.beat_division)
            .field("extra_delay", &self.extra_delay)
            .field("scheduled_time", &self.scheduled_time)
            .field("fired", &self.fired)
            .field("repeating", &matches!(self.action, EventAction::Repeating(_)))
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Registered events that have not fired yet.
#[derive(Default)]
pub struct PendingSet {
    events: Vec<ScheduledEvent>,
    next_id: u64,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn insert(
        &mut self,
        scheduled_time: f64,
        beat_division: u32,
        extra_delay: f64,
        action: EventAction,
    ) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.insert_with_id(id, scheduled_time, beat_division, extra_delay, action);
        id
    }

    /// Re-inserts a repeating action under the id it was registered with.
    pub fn reinsert(&mut self, id: EventId, scheduled_time: f64, action: BeatAction) {
        let (division, delay) = (action.beat_division, action.extra_delay);
        self.insert_with_id(id, scheduled_time, division, delay, EventAction::Repeating(action));
    }

    fn insert_with_id(
        &mut self,
        id: EventId,
        scheduled_time: f64,
        beat_division: u32,
        extra_delay: f64,
        action: EventAction,
    ) {
        self.events.push(ScheduledEvent {
            id,
            beat_division,
            extra_delay,
            scheduled_time,
            fired: false,
            action,
        });
    }

    /// Moves every event due at `now` out of the set, marked as fired.
    /// The order of the returned events is unspecified.
    pub fn drain_due(&mut self, now: f64) -> Vec<ScheduledEvent> {
        let mut due = Vec::new();
        let mut index = 0;
        while index < self.events.len() {
            if self.events[index].is_due(now) {
                let mut event = self.events.swap_remove(index);
                event.fired = true;
                due.push(event);
            } else {
                index += 1;
            }
        }
        due
    }

    pub fn remove(&mut self, id: EventId) -> bool {
        match self.events.iter().position(|event| event.id == id) {
            Some(index) => {
                self.events.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Drops every pending event and returns how many there were.
    pub fn clear(&mut self) -> usize {
        let dropped = self.events.len();
        self.events.clear();
        dropped
    }

    /// Earliest scheduled time among pending events.
    pub fn next_due(&self) -> Option<f64> {
        self.events
            .iter()
            .map(|event| event.scheduled_time)
            .min_by(|a, b| a.total_cmp(b))
    }
}

impl fmt::Debug for PendingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSet")
            .field("events", &self.events)
            .finish()
    }
}
