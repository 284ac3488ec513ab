use crate::queue::QueueCore;
use crate::task::TaskShared;
use crate::Simulation;

use ordered_float::OrderedFloat;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The integer unit of logical simulation time.
pub type Ticks = u64;

/// Identifies a pending event inside the scheduler's arena. Never reused
/// within a simulation.
pub(crate) type EventId = u64;

/// Total order over pending events: execution time first, then the
/// floating-point tie priority, then the insertion sequence.
///
/// The sequence component guarantees that no two pending events ever compare
/// equal and that exact (time, tie-priority) ties are processed in the order
/// they were scheduled.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) struct EventKey {
    pub time: Ticks,
    pub tpriority: OrderedFloat<f64>,
    pub seq: u64,
}

/// The work an event performs when the scheduler pops it.
pub(crate) enum EventAction {
    /// Invoke a one-shot callable on the driving thread.
    Call(Box<dyn FnOnce() + Send>),
    /// Start a not-yet-running task thread and wait for its first yield.
    StartTask(Arc<TaskShared>),
    /// Resume a parked task thread and wait for its next yield.
    ResumeTask(Arc<TaskShared>),
    /// Service a task queue's scheduled entry.
    QueueEntry {
        queue: Arc<QueueCore>,
        entry: u64,
    },
    /// Resume a task that paused through its queue without yielding the
    /// queue's scheduled slot.
    QueuePause {
        queue: Arc<QueueCore>,
        task: Arc<TaskShared>,
    },
}

pub(crate) struct EventRecord {
    pub id: EventId,
    pub source: Option<Arc<str>>,
    pub action: EventAction,
}

/// Priority-ordered arena of pending events.
///
/// Events are keyed by [`EventKey`] in a balanced tree, with a side index
/// from event id to key so that cancellation and rescheduling of an
/// arbitrary pending event stay sub-linear. An event is pending exactly as
/// long as its record is present here; popping or descheduling removes the
/// record, which is what makes a second `cancel()` on the same event report
/// failure without any extra bookkeeping.
#[derive(Default)]
pub(crate) struct EventArena {
    events: BTreeMap<EventKey, EventRecord>,
    index: HashMap<EventId, EventKey>,
}

impl EventArena {
    pub fn insert(&mut self, key: EventKey, record: EventRecord) {
        self.index.insert(record.id, key);
        let prior = self.events.insert(key, record);
        debug_assert!(prior.is_none(), "event keys must be unique");
    }

    /// Remove and return the earliest pending event.
    pub fn pop_first(&mut self) -> Option<(EventKey, EventRecord)> {
        let (key, record) = self.events.pop_first()?;
        self.index.remove(&record.id);
        Some((key, record))
    }

    /// The key of the earliest pending event, if any.
    pub fn peek_key(&self) -> Option<EventKey> {
        self.events.keys().next().copied()
    }

    /// Remove an arbitrary pending event by id. Returns the record when the
    /// event was still pending.
    pub fn remove(&mut self, id: EventId) -> Option<EventRecord> {
        let key = self.index.remove(&id)?;
        self.events.remove(&key)
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

enum EventTarget {
    /// An event owned directly by the scheduler.
    Sched { sim: Simulation, id: EventId },
    /// An entry owned by a task queue; cancellation must run the queue's
    /// dequeue protocol rather than just dropping the scheduler record.
    Queue { queue: Arc<QueueCore>, entry: u64 },
    /// A queue pause event; cancellation cancels the paused task and lets
    /// the queue continue with its next entry.
    QueuePause { queue: Arc<QueueCore>, id: EventId },
}

/// Handle to a scheduled piece of work.
///
/// Returned by every scheduling and queue-insertion operation. The handle
/// does not keep the work alive or pin it in place; it only provides
/// cancellation and inspection. Handles may be cloned freely and shared
/// across threads; all clones observe the same cancellation state.
#[derive(Clone)]
pub struct SimEvent {
    target: Arc<EventTarget>,
    canceled: Arc<AtomicBool>,
}

impl SimEvent {
    pub(crate) fn sched(sim: Simulation, id: EventId) -> Self {
        Self::new(EventTarget::Sched { sim, id })
    }

    pub(crate) fn queue_entry(queue: Arc<QueueCore>, entry: u64) -> Self {
        Self::new(EventTarget::Queue { queue, entry })
    }

    pub(crate) fn queue_pause(queue: Arc<QueueCore>, id: EventId) -> Self {
        Self::new(EventTarget::QueuePause { queue, id })
    }

    fn new(target: EventTarget) -> Self {
        Self {
            target: Arc::new(target),
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the scheduled work.
    ///
    /// Returns `true` if the work was still pending and has now been removed;
    /// `false` if it already ran, already began running, or was already
    /// canceled. Canceling a queued task-thread entry resumes the suspended
    /// task, whose queue-insertion call reports failure to its caller.
    pub fn cancel(&self) -> bool {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let ok = match &*self.target {
            EventTarget::Sched { sim, id } => sim.deschedule_id(*id),
            EventTarget::Queue { queue, entry } => queue.cancel_entry(*entry),
            EventTarget::QueuePause { queue, id } => queue.cancel_pause(*id),
        };
        if !ok {
            // lost the race: the work ran first, so the flag must not claim
            // a successful cancellation
            self.canceled.store(false, Ordering::Release);
        }
        ok
    }

    /// Move a still-pending scheduler event to `delay` ticks from now,
    /// giving it a fresh position in the tie order. Returns `false` for an
    /// event that already ran or one owned by a queue, whose timing is the
    /// queue's to decide.
    pub fn reschedule(&self, delay: Ticks, tpriority: f64) -> bool {
        match &*self.target {
            EventTarget::Sched { sim, id } => sim.reschedule_id(*id, delay, tpriority),
            EventTarget::Queue { .. } | EventTarget::QueuePause { .. } => false,
        }
    }

    /// Whether this handle successfully canceled its work.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Whether the work is still waiting to run, either on the scheduler's
    /// event queue or inside a task queue.
    pub fn is_pending(&self) -> bool {
        match &*self.target {
            EventTarget::Sched { sim, id } => sim.is_pending_id(*id),
            EventTarget::Queue { queue, entry } => queue.entry_is_live(*entry),
            EventTarget::QueuePause { queue, id } => queue.pause_is_live(*id),
        }
    }
}

impl Debug for SimEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match &*self.target {
            EventTarget::Sched { .. } => "sched",
            EventTarget::Queue { .. } => "queue",
            EventTarget::QueuePause { .. } => "queue-pause",
        };
        f.debug_struct("SimEvent")
            .field("target", &kind)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
