mod discipline;

pub use discipline::Discipline;
use discipline::Store;

use crate::event::{EventAction, EventId};
use crate::object::{QueueObserver, QueueStatus, SimObject};
use crate::task::{self, TaskContext, TaskShared};
use crate::{Error, Result, SimEvent, Simulation, Ticks};

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, Weak};

const POISONED: &str = "task queue state poisoned";

/// Governs whether a queue object may be deleted while it still holds work.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum QueueDeletePolicy {
    /// Deletion is refused unless the queue is empty.
    MustBeEmpty,
    /// Deletion is accepted at any time but completes once the queue drains.
    #[default]
    WhenEmpty,
    /// The queue can never be deleted.
    Never,
}

/// Policies for entries canceled while a release is in progress.
///
/// A release is in progress from a call to [`release`]/[`release_up_to`]
/// until the granted count is consumed or [`clear_release_count`] is called.
///
/// [`release`]: TaskQueue::release
/// [`release_up_to`]: TaskQueue::release_up_to
/// [`clear_release_count`]: TaskQueue::clear_release_count
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ReleasePolicy {
    /// Cancellations do not change the number of entries released.
    #[default]
    CancelsIgnored,
    /// Each cancellation counts as one released entry.
    CancelsAsReleased,
    /// Entries added during the release replace canceled ones; only the
    /// excess of cancellations over additions counts as released.
    ReplaceCancels,
}

/// Per-entry scheduling parameters.
///
/// Every queue insertion is described by the same three values: the
/// processing-time `interval` charged when the entry is serviced, the
/// discipline `priority` (meaningful for priority queues, lower is more
/// urgent), and the event-queue `tie_priority` used when the entry's event
/// is scheduled.
#[derive(Clone, Copy, Debug)]
pub struct EntryParams {
    pub(crate) interval: Ticks,
    pub(crate) tpriority: f64,
    pub(crate) priority: i32,
}

impl EntryParams {
    /// Parameters with the given processing interval, default priority 0 and
    /// tie priority 0.0.
    pub fn new(interval: Ticks) -> Self {
        Self {
            interval,
            tpriority: 0.0,
            priority: 0,
        }
    }

    /// Set the discipline priority (lower runs first).
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the tie priority used on the scheduler's event queue.
    pub fn tie_priority(mut self, tpriority: f64) -> Self {
        self.tpriority = tpriority;
        self
    }

    /// The processing-time interval.
    pub fn interval(&self) -> Ticks {
        self.interval
    }
}

pub(crate) enum EntryAction {
    /// Run a one-shot callable when the entry is serviced.
    Call(Box<dyn FnOnce() + Send>),
    /// Start a task thread when the entry is serviced.
    Start(Arc<TaskShared>),
    /// Resume a task thread parked by `add_current_task`.
    Resume(Arc<TaskShared>),
}

struct QueueEntry {
    params: EntryParams,
    action: EntryAction,
    off_queue_time: Ticks,
    arrival: u64,
}

#[derive(Clone, Copy)]
struct ScheduledEntry {
    id: u64,
    event: EventId,
}

struct QueueState {
    discipline: Discipline,
    store: Store,
    entries: HashMap<u64, QueueEntry>,
    next_entry: u64,
    next_arrival: u64,
    scheduled: Option<ScheduledEntry>,
    frozen: bool,
    can_freeze: bool,
    can_release: bool,
    preempt: bool,
    release_count: usize,
    release_extras: usize,
    adds_during_release: usize,
    cancels_during_release: usize,
    release_policy: ReleasePolicy,
    delete_policy: QueueDeletePolicy,
    deleting: bool,
    deleted: bool,
    processing: bool,
    pause_pending: Option<(EventId, Arc<TaskShared>)>,
    current_task: Option<Arc<TaskShared>>,
}

impl QueueState {
    fn release_in_progress(&self) -> bool {
        self.release_count > 0 || self.adds_during_release > 0 || self.cancels_during_release > 0
    }
}

pub(crate) struct QueueCore {
    sim: Simulation,
    name: Arc<str>,
    me: Weak<QueueCore>,
    state: Mutex<QueueState>,
    observers: Mutex<Vec<Arc<dyn QueueObserver>>>,
}

impl QueueCore {
    fn new(sim: &Simulation, name: String, discipline: Discipline) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            sim: sim.clone(),
            name: name.into(),
            me: me.clone(),
            state: Mutex::new(QueueState {
                discipline,
                store: Store::new(discipline),
                entries: HashMap::new(),
                next_entry: 0,
                next_arrival: 0,
                scheduled: None,
                frozen: false,
                can_freeze: true,
                can_release: false,
                // a LIFO queue's defining behavior is that a newcomer
                // displaces the entry being timed
                preempt: discipline == Discipline::Lifo,
                release_count: 0,
                release_extras: 0,
                adds_during_release: 0,
                cancels_during_release: 0,
                release_policy: ReleasePolicy::default(),
                delete_policy: QueueDeletePolicy::default(),
                deleting: false,
                deleted: false,
                processing: false,
                pause_pending: None,
                current_task: None,
            }),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// A fresh strong reference to this core, for embedding in events.
    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("queue core alive while in use")
    }

    /// Insert an entry, scheduling it immediately when the queue is idle and
    /// not gated. Returns the entry id and whether it became the scheduled
    /// entry, or `None` when the queue refuses new work.
    pub(crate) fn do_add(&self, action: EntryAction, params: EntryParams) -> Option<(u64, bool)> {
        let mut qs = self.state.lock().expect(POISONED);
        if qs.deleting {
            return None;
        }
        let id = qs.next_entry;
        qs.next_entry += 1;
        let arrival = qs.next_arrival;
        qs.next_arrival += 1;
        let mut schedule_now = false;
        if (qs.release_count > 0 || qs.release_extras > 0) && qs.scheduled.is_none() {
            schedule_now = true;
        } else if qs.frozen || qs.scheduled.is_some() {
            let mut admitted = false;
            if qs.preempt {
                if let Some(sched) = qs.scheduled {
                    // an entry whose event already fired is being processed
                    // and is never preempted
                    if self.sim.is_pending_id(sched.event) {
                        let preempts = match (qs.discipline, qs.entries.get(&sched.id)) {
                            (Discipline::Lifo, Some(_)) => true,
                            (Discipline::Priority, Some(old)) => {
                                params.priority < old.params.priority
                            }
                            _ => false,
                        };
                        if preempts {
                            let now = self.sim.current_ticks();
                            let old = qs
                                .entries
                                .get_mut(&sched.id)
                                .expect("scheduled entry missing from arena");
                            let elapsed = now.saturating_sub(old.off_queue_time);
                            old.params.interval = old.params.interval.saturating_sub(elapsed);
                            let (old_priority, old_arrival) = (old.params.priority, old.arrival);
                            self.sim.deschedule_id(sched.event);
                            qs.store.push_front(sched.id, old_priority, old_arrival);
                            qs.scheduled = None;
                            schedule_now = true;
                            admitted = true;
                        }
                    }
                }
            }
            if !admitted && !schedule_now {
                qs.store.push(id, params.priority, arrival);
            }
        } else {
            schedule_now = true;
        }
        if qs.release_extras > 0 {
            // an add during a banked release effectively grows the queue the
            // release was sized against; convert one banked slot into credit
            qs.release_extras -= 1;
            qs.release_count += 1;
        }
        if qs.release_count > 0 {
            qs.adds_during_release += 1;
        }
        qs.entries.insert(
            id,
            QueueEntry {
                params,
                action,
                off_queue_time: 0,
                arrival,
            },
        );
        if schedule_now {
            let event = self.sim.schedule_action(
                EventAction::QueueEntry {
                    queue: self.arc(),
                    entry: id,
                },
                params.interval,
                params.tpriority,
                Some(Arc::clone(&self.name)),
            );
            qs.scheduled = Some(ScheduledEntry { id, event });
            qs.entries
                .get_mut(&id)
                .expect("entry just inserted")
                .off_queue_time = self.sim.current_ticks();
        }
        drop(qs);
        self.notify_observers();
        Some((id, schedule_now))
    }

    /// Service the scheduled entry whose event just fired.
    pub(crate) fn process_scheduled(&self, entry: u64) {
        let action = {
            let mut qs = self.state.lock().expect(POISONED);
            let record = match qs.entries.remove(&entry) {
                Some(record) => record,
                None => {
                    qs.scheduled = None;
                    drop(qs);
                    self.advance_after();
                    return;
                }
            };
            qs.processing = true;
            match &record.action {
                EntryAction::Start(shared) | EntryAction::Resume(shared) => {
                    qs.current_task = Some(Arc::clone(shared));
                }
                EntryAction::Call(_) => {}
            }
            record.action
        };
        self.sim.fire_queue_start(&self.name);
        match action {
            EntryAction::Call(f) => {
                self.sim.fire_call_start(Some(&self.name));
                f();
                self.sim.fire_call_end(Some(&self.name));
            }
            EntryAction::Start(shared) => task::start_and_wait(&self.sim, &shared),
            EntryAction::Resume(shared) => task::resume_and_wait(&self.sim, &shared),
        }
        self.sim.fire_queue_stop(&self.name);
        self.finish_entry();
    }

    /// Resume a task that paused through [`pause_current_task`] while
    /// holding the queue's scheduled slot.
    ///
    /// [`pause_current_task`]: TaskQueue::pause_current_task
    pub(crate) fn process_pause(&self, paused: &Arc<TaskShared>) {
        {
            let mut qs = self.state.lock().expect(POISONED);
            qs.pause_pending = None;
            qs.current_task = Some(Arc::clone(paused));
        }
        task::resume_and_wait(&self.sim, paused);
        self.finish_entry();
    }

    /// Bookkeeping after the serviced task or callable returned control: if
    /// the task did not re-pause through the queue, the slot is free and the
    /// next eligible entry is pulled.
    fn finish_entry(&self) {
        let advance = {
            let mut qs = self.state.lock().expect(POISONED);
            let no_new_pause = qs.pause_pending.is_none();
            if no_new_pause {
                qs.processing = false;
            }
            qs.current_task = None;
            no_new_pause
        };
        if advance {
            self.advance_after();
        }
    }

    /// Clear the scheduled slot and pull the next eligible entry, honoring
    /// freeze/release gating and finishing a deferred deletion when the
    /// queue drains.
    pub(crate) fn advance_after(&self) {
        let mut qs = self.state.lock().expect(POISONED);
        qs.scheduled = None;
        let mut diff = 0usize;
        match qs.release_policy {
            ReleasePolicy::CancelsIgnored => {}
            ReleasePolicy::CancelsAsReleased => {
                qs.release_count = qs.release_count.saturating_sub(qs.cancels_during_release);
                qs.cancels_during_release = 0;
            }
            ReleasePolicy::ReplaceCancels => {
                diff = qs
                    .cancels_during_release
                    .saturating_sub(qs.adds_during_release);
                qs.cancels_during_release = 0;
                qs.adds_during_release = 0;
            }
        }
        let mut grant = qs.release_count.saturating_sub(diff);
        if !qs.frozen || grant > 0 {
            if let Some(next) = qs.store.pop() {
                if grant > 0 {
                    qs.release_count -= 1;
                    grant -= 1;
                    if grant == 0 {
                        qs.release_count = 0;
                        qs.release_extras = 0;
                        qs.adds_during_release = 0;
                        qs.cancels_during_release = 0;
                    }
                }
                let now = self.sim.current_ticks();
                let (interval, tpriority, resumed_task) = {
                    let entry = qs
                        .entries
                        .get_mut(&next)
                        .expect("stored entry missing from arena");
                    entry.off_queue_time = now;
                    let resumed = match &entry.action {
                        EntryAction::Resume(shared) => Some(Arc::clone(shared)),
                        _ => None,
                    };
                    (entry.params.interval, entry.params.tpriority, resumed)
                };
                if let Some(shared) = resumed_task {
                    shared.hand.lock().expect(task::POISONED).thread_queued = false;
                }
                let event = self.sim.schedule_action(
                    EventAction::QueueEntry {
                        queue: self.arc(),
                        entry: next,
                    },
                    interval,
                    tpriority,
                    Some(Arc::clone(&self.name)),
                );
                qs.scheduled = Some(ScheduledEntry { id: next, event });
                drop(qs);
                self.notify_observers();
            } else {
                if qs.deleting && !qs.deleted {
                    qs.deleted = true;
                }
                drop(qs);
                self.notify_observers();
            }
        } else {
            let drained = qs.deleting && !qs.deleted && qs.store.len() == 0;
            if drained {
                qs.deleted = true;
            }
            drop(qs);
            if drained {
                self.notify_observers();
            }
        }
    }

    /// Cancel an entry.
    ///
    /// The scheduled entry can be canceled while its event is still pending
    /// unless it carries a resumed task (such a task has left the queued
    /// state and the cancellation window has closed). A waiting entry is
    /// removed outright; a waiting task entry additionally resumes its task,
    /// whose insertion call then reports failure.
    pub(crate) fn cancel_entry(&self, entry: u64) -> bool {
        let mut qs = self.state.lock().expect(POISONED);
        let is_scheduled = qs.scheduled.map(|s| s.id == entry).unwrap_or(false);
        if is_scheduled {
            let record = match qs.entries.get(&entry) {
                Some(record) => record,
                // the entry's action is already executing
                None => return false,
            };
            if matches!(record.action, EntryAction::Resume(_)) {
                return false;
            }
            let event = qs.scheduled.expect("checked above").event;
            if !self.sim.deschedule_id(event) {
                return false;
            }
            qs.scheduled = None;
            qs.entries.remove(&entry);
            drop(qs);
            self.advance_after();
            true
        } else {
            let (priority, arrival) = match qs.entries.get(&entry) {
                Some(record) => (record.params.priority, record.arrival),
                None => return false,
            };
            if !qs.store.remove(entry, priority, arrival) {
                return false;
            }
            let record = qs.entries.remove(&entry).expect("entry present");
            if qs.release_count > 0 {
                qs.cancels_during_release += 1;
            }
            drop(qs);
            if let EntryAction::Resume(shared) = record.action {
                {
                    let mut hand = shared.hand.lock().expect(task::POISONED);
                    hand.queuing_canceled = true;
                    hand.thread_queued = false;
                }
                task::resume_and_wait(&self.sim, &shared);
            }
            self.notify_observers();
            true
        }
    }

    /// Cancel a pending pause event: the paused task is canceled outright so
    /// the queue keeps a resumption path for every suspension, and the queue
    /// moves on to its next entry.
    pub(crate) fn cancel_pause(&self, id: EventId) -> bool {
        let paused = {
            let mut qs = self.state.lock().expect(POISONED);
            match &qs.pause_pending {
                Some((pending, task)) if *pending == id => {
                    let task = Arc::clone(task);
                    if !self.sim.deschedule_id(id) {
                        return false;
                    }
                    qs.pause_pending = None;
                    task
                }
                _ => return false,
            }
        };
        {
            let mut hand = paused.hand.lock().expect(task::POISONED);
            hand.cancel_requested = true;
            hand.runnable_paused = false;
        }
        paused.resumed.notify_all();
        self.finish_entry();
        true
    }

    pub(crate) fn entry_is_live(&self, entry: u64) -> bool {
        self.state.lock().expect(POISONED).entries.contains_key(&entry)
    }

    pub(crate) fn pause_is_live(&self, id: EventId) -> bool {
        matches!(
            &self.state.lock().expect(POISONED).pause_pending,
            Some((pending, _)) if *pending == id
        )
    }

    pub(crate) fn force_freeze(&self, value: bool) {
        let unfroze = {
            let mut qs = self.state.lock().expect(POISONED);
            let old = qs.frozen;
            qs.frozen = value;
            old && !value
        };
        if unfroze {
            self.kick_if_idle();
        }
        self.notify_observers();
    }

    pub(crate) fn force_release(&self, count: usize) {
        let kick = {
            let mut qs = self.state.lock().expect(POISONED);
            let prev = qs.release_count;
            qs.release_count += count;
            prev == 0 && qs.release_count > 0
        };
        if kick {
            self.kick_if_idle();
        }
    }

    fn force_release_up_to(&self, count: usize) {
        let grant = {
            let mut qs = self.state.lock().expect(POISONED);
            let size = qs.store.len();
            if qs.release_count >= size {
                qs.release_extras += count;
                0
            } else if qs.release_count + count > size {
                let granted = size - qs.release_count;
                qs.release_extras += count - granted;
                granted
            } else {
                count
            }
        };
        if grant > 0 {
            self.force_release(grant);
        }
    }

    /// Start servicing entries if nothing is scheduled or being processed.
    fn kick_if_idle(&self) {
        let idle = {
            let qs = self.state.lock().expect(POISONED);
            qs.scheduled.is_none() && !qs.processing
        };
        if idle {
            self.advance_after();
        }
    }

    pub(crate) fn set_can_release(&self, value: bool) {
        self.state.lock().expect(POISONED).can_release = value;
    }

    pub(crate) fn force_preempt(&self, value: bool) {
        self.state.lock().expect(POISONED).preempt = value;
    }

    pub(crate) fn set_frozen_flag(&self, value: bool) {
        self.state.lock().expect(POISONED).frozen = value;
    }

    fn notify_observers(&self) {
        let observers: Vec<_> = self.observers.lock().expect(POISONED).clone();
        for observer in observers {
            observer.on_queue_change(self as &dyn QueueStatus);
        }
    }

    pub(crate) fn add_observer(&self, observer: Arc<dyn QueueObserver>) {
        let qs = self.state.lock().expect(POISONED);
        if qs.deleting {
            return;
        }
        drop(qs);
        self.observers.lock().expect(POISONED).push(observer);
    }

    pub(crate) fn remove_observer(&self, observer: &Arc<dyn QueueObserver>) -> bool {
        let mut observers = self.observers.lock().expect(POISONED);
        match observers.iter().position(|o| Arc::ptr_eq(o, observer)) {
            Some(idx) => {
                observers.remove(idx);
                true
            }
            None => false,
        }
    }
}

impl QueueStatus for QueueCore {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.state.lock().expect(POISONED).store.len()
    }

    fn is_busy(&self) -> bool {
        self.state.lock().expect(POISONED).scheduled.is_some()
    }

    fn is_frozen(&self) -> bool {
        self.state.lock().expect(POISONED).frozen
    }

    fn is_deleted(&self) -> bool {
        self.state.lock().expect(POISONED).deleted
    }

    fn in_use_count(&self) -> usize {
        usize::from(self.state.lock().expect(POISONED).scheduled.is_some())
    }

    fn server_count(&self) -> usize {
        1
    }
}

/// A queue of pending work awaiting a single timed resource.
///
/// Entries are callables, not-yet-started tasks, or the calling task itself
/// ([`add_current_task`]). At most one entry is *scheduled* (pulled off the
/// queue with a live event on the simulation's event queue) at any time;
/// when that event fires the entry is serviced and the next eligible entry
/// is pulled, subject to freeze/release gating. [`size()`] never counts the
/// scheduled entry.
///
/// The discipline fixes the order entries come off the queue and whether a
/// newcomer may preempt the scheduled entry; see [`Discipline`]. A preempted
/// entry keeps the wait it has already served: its remaining interval is
/// `max(0, interval − elapsed)` and it returns to the front of the queue.
///
/// `TaskQueue` is a cheap cloneable handle; clones share one queue.
///
/// [`add_current_task`]: TaskQueue::add_current_task
/// [`size()`]: TaskQueue::size
#[derive(Clone)]
pub struct TaskQueue {
    core: Arc<QueueCore>,
}

impl TaskQueue {
    /// A queue servicing entries in insertion order.
    pub fn fifo(sim: &Simulation, name: impl Into<String>) -> Self {
        Self {
            core: QueueCore::new(sim, name.into(), Discipline::Fifo),
        }
    }

    /// A queue servicing the most recently inserted entry first, preempting
    /// the scheduled entry when one is still waiting out its interval.
    pub fn lifo(sim: &Simulation, name: impl Into<String>) -> Self {
        Self {
            core: QueueCore::new(sim, name.into(), Discipline::Lifo),
        }
    }

    /// A queue servicing entries by ascending priority key, ties in arrival
    /// order. Does not preempt unless [`preempt`] is enabled.
    ///
    /// [`preempt`]: TaskQueue::preempt
    pub fn priority(sim: &Simulation, name: impl Into<String>) -> Self {
        Self {
            core: QueueCore::new(sim, name.into(), Discipline::Priority),
        }
    }

    /// A wait queue: FIFO order, initially frozen, with release support.
    /// Entries are held until released (in bulk or by count) or the queue is
    /// unfrozen.
    pub fn wait(sim: &Simulation, name: impl Into<String>) -> Self {
        let core = QueueCore::new(sim, name.into(), Discipline::Fifo);
        core.set_can_release(true);
        core.set_frozen_flag(true);
        Self { core }
    }

    /// Queue a callable. Returns a cancelable handle, or `None` when the
    /// queue refuses new entries (it is being deleted).
    pub fn add_call<F>(&self, f: F, params: EntryParams) -> Option<SimEvent>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core
            .do_add(EntryAction::Call(Box::new(f)), params)
            .map(|(id, _)| SimEvent::queue_entry(Arc::clone(&self.core), id))
    }

    /// Queue a task body; a task thread is started for it when the entry is
    /// serviced.
    pub fn add_task<F>(&self, f: F, params: EntryParams) -> Option<SimEvent>
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        let shared = Arc::new(TaskShared::new(
            Box::new(f),
            Some(Arc::clone(&self.core.name)),
        ));
        self.core
            .do_add(EntryAction::Start(shared), params)
            .map(|(id, _)| SimEvent::queue_entry(Arc::clone(&self.core), id))
    }

    /// Suspend the calling task until this queue services it.
    ///
    /// Returns `true` once the entry has been serviced and the wait (if any)
    /// has elapsed; `false` when the entry could not be queued or was
    /// canceled while waiting, in which case the task simply continues.
    pub fn add_current_task(&self, ctx: &TaskContext, params: EntryParams) -> bool {
        self.add_current_task_inner(ctx, params, None)
    }

    /// As [`add_current_task`], additionally passing the cancelable entry
    /// handle to `on_event` before suspending, so a timeout or another actor
    /// can cancel the wait.
    ///
    /// [`add_current_task`]: TaskQueue::add_current_task
    pub fn add_current_task_with<F>(&self, ctx: &TaskContext, params: EntryParams, on_event: F) -> bool
    where
        F: FnOnce(SimEvent),
    {
        self.add_current_task_inner(ctx, params, Some(Box::new(on_event)))
    }

    fn add_current_task_inner(
        &self,
        ctx: &TaskContext,
        params: EntryParams,
        on_event: Option<Box<dyn FnOnce(SimEvent) + '_>>,
    ) -> bool {
        let added = self
            .core
            .do_add(EntryAction::Resume(Arc::clone(&ctx.shared)), params);
        let (entry, scheduled_now) = match added {
            Some(outcome) => outcome,
            None => return false,
        };
        if !scheduled_now {
            let mut hand = ctx.shared.hand.lock().expect(task::POISONED);
            hand.thread_queued = true;
            hand.queuing_canceled = false;
        }
        if let Some(on_event) = on_event {
            on_event(SimEvent::queue_entry(Arc::clone(&self.core), entry));
        }
        task::park_until_resumed(&ctx.sim, &ctx.shared);
        let mut hand = ctx.shared.hand.lock().expect(task::POISONED);
        if hand.queuing_canceled {
            hand.queuing_canceled = false;
            hand.thread_queued = false;
            false
        } else {
            true
        }
    }

    /// Suspend the queue's currently serviced task for `interval` ticks
    /// without releasing the queue's slot: no other entry is serviced while
    /// the task sleeps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotCurrentTask`] unless called from the task this
    /// queue is currently servicing.
    ///
    /// [`Error::NotCurrentTask`]: crate::Error::NotCurrentTask
    pub fn pause_current_task(&self, ctx: &TaskContext, interval: Ticks) -> Result {
        self.pause_current_task_inner(ctx, interval, None)
    }

    /// As [`pause_current_task`], additionally passing the cancelable pause
    /// handle to `on_event` before suspending. Canceling the pause cancels
    /// the task itself and lets the queue continue.
    ///
    /// [`pause_current_task`]: TaskQueue::pause_current_task
    pub fn pause_current_task_with<F>(&self, ctx: &TaskContext, interval: Ticks, on_event: F) -> Result
    where
        F: FnOnce(SimEvent),
    {
        self.pause_current_task_inner(ctx, interval, Some(Box::new(on_event)))
    }

    fn pause_current_task_inner(
        &self,
        ctx: &TaskContext,
        interval: Ticks,
        on_event: Option<Box<dyn FnOnce(SimEvent) + '_>>,
    ) -> Result {
        {
            let qs = self.core.state.lock().expect(POISONED);
            match &qs.current_task {
                Some(task) if Arc::ptr_eq(task, &ctx.shared) => {}
                _ => return Err(Error::NotCurrentTask),
            }
        }
        let id = self.core.sim.schedule_action(
            EventAction::QueuePause {
                queue: Arc::clone(&self.core),
                task: Arc::clone(&ctx.shared),
            },
            interval,
            0.0,
            Some(Arc::clone(&self.core.name)),
        );
        self.core.state.lock().expect(POISONED).pause_pending = Some((id, Arc::clone(&ctx.shared)));
        if let Some(on_event) = on_event {
            on_event(SimEvent::queue_pause(Arc::clone(&self.core), id));
        }
        task::park_until_resumed(&ctx.sim, &ctx.shared);
        Ok(())
    }

    /// Whether this queue supports freezing.
    pub fn can_freeze(&self) -> bool {
        self.core.state.lock().expect(POISONED).can_freeze
    }

    /// Freeze or unfreeze the queue. While frozen, new entries accumulate
    /// and nothing is serviced except under an explicit release grant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CannotFreeze`] when the queue's configuration does
    /// not permit freezing.
    ///
    /// [`Error::CannotFreeze`]: crate::Error::CannotFreeze
    pub fn freeze(&self, value: bool) -> Result {
        if !self.can_freeze() {
            return Err(Error::CannotFreeze);
        }
        self.core.force_freeze(value);
        Ok(())
    }

    /// Whether the queue is currently frozen.
    pub fn is_frozen(&self) -> bool {
        self.core.state.lock().expect(POISONED).frozen
    }

    /// Whether release operations are supported.
    pub fn can_release(&self) -> bool {
        self.core.state.lock().expect(POISONED).can_release
    }

    /// Guarantee that `count` additional entries will be serviced even while
    /// the queue is frozen.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CannotRelease`] when the queue lacks release
    /// support.
    ///
    /// [`Error::CannotRelease`]: crate::Error::CannotRelease
    pub fn release(&self, count: usize) -> Result {
        if !self.can_release() {
            return Err(Error::CannotRelease);
        }
        self.core.force_release(count);
        Ok(())
    }

    /// As [`release`], but grants at most the current queue size; the excess
    /// is banked against entries added while the release is in progress.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CannotRelease`] when the queue lacks release
    /// support.
    ///
    /// [`release`]: TaskQueue::release
    /// [`Error::CannotRelease`]: crate::Error::CannotRelease
    pub fn release_up_to(&self, count: usize) -> Result {
        if !self.can_release() {
            return Err(Error::CannotRelease);
        }
        self.core.force_release_up_to(count);
        Ok(())
    }

    /// Revoke any outstanding release grant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CannotRelease`] when the queue lacks release
    /// support.
    ///
    /// [`Error::CannotRelease`]: crate::Error::CannotRelease
    pub fn clear_release_count(&self) -> Result {
        if !self.can_release() {
            return Err(Error::CannotRelease);
        }
        let mut qs = self.core.state.lock().expect(POISONED);
        qs.release_count = 0;
        qs.release_extras = 0;
        qs.adds_during_release = 0;
        qs.cancels_during_release = 0;
        Ok(())
    }

    /// The current release policy.
    pub fn release_policy(&self) -> ReleasePolicy {
        self.core.state.lock().expect(POISONED).release_policy
    }

    /// Set the release policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReleaseInProgress`] while a release grant is
    /// outstanding.
    ///
    /// [`Error::ReleaseInProgress`]: crate::Error::ReleaseInProgress
    pub fn set_release_policy(&self, policy: ReleasePolicy) -> Result {
        let mut qs = self.core.state.lock().expect(POISONED);
        if qs.release_in_progress() {
            return Err(Error::ReleaseInProgress);
        }
        qs.release_policy = policy;
        Ok(())
    }

    /// Whether this queue's discipline supports preemption.
    pub fn can_preempt(&self) -> bool {
        self.core.state.lock().expect(POISONED).discipline.supports_preempt()
    }

    /// Enable or disable preempt mode. While enabled, a newcomer that beats
    /// the scheduled entry in discipline order displaces it, carrying the
    /// displaced entry's remaining wait forward. An entry whose processing
    /// has begun is never preempted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CannotPreempt`] when the discipline does not support
    /// preemption.
    ///
    /// [`Error::CannotPreempt`]: crate::Error::CannotPreempt
    pub fn preempt(&self, value: bool) -> Result {
        if !self.can_preempt() {
            return Err(Error::CannotPreempt);
        }
        self.core.force_preempt(value);
        Ok(())
    }

    /// The current delete policy.
    pub fn delete_policy(&self) -> QueueDeletePolicy {
        self.core.state.lock().expect(POISONED).delete_policy
    }

    /// Set the delete policy. Ignored once deletion has begun.
    pub fn set_delete_policy(&self, policy: QueueDeletePolicy) {
        let mut qs = self.core.state.lock().expect(POISONED);
        if !qs.deleting {
            qs.delete_policy = policy;
        }
    }

    /// Delete the queue, immediately if it is idle or (under `WhenEmpty`)
    /// once it drains. A deleted queue refuses new entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CannotDelete`] when the delete policy forbids
    /// deletion in the queue's current state.
    ///
    /// [`Error::CannotDelete`]: crate::Error::CannotDelete
    pub fn delete(&self) -> Result {
        let done = {
            let mut qs = self.core.state.lock().expect(POISONED);
            if qs.deleting || qs.deleted {
                return Ok(());
            }
            let allowed = match qs.delete_policy {
                QueueDeletePolicy::MustBeEmpty => {
                    qs.store.len() == 0 && qs.scheduled.is_none()
                }
                QueueDeletePolicy::WhenEmpty => true,
                QueueDeletePolicy::Never => false,
            };
            if !allowed {
                return Err(Error::CannotDelete);
            }
            qs.deleting = true;
            let done = qs.scheduled.is_none() && qs.store.len() == 0;
            if done {
                qs.deleted = true;
            }
            done
        };
        if done {
            self.core.notify_observers();
        }
        Ok(())
    }

    /// Whether deletion has completed.
    pub fn is_deleted(&self) -> bool {
        self.core.state.lock().expect(POISONED).deleted
    }

    /// The number of waiting entries. Never includes the scheduled entry.
    pub fn size(&self) -> usize {
        QueueStatus::size(&*self.core)
    }

    /// Whether an entry is scheduled or being processed.
    pub fn is_busy(&self) -> bool {
        QueueStatus::is_busy(&*self.core)
    }

    /// Whether an entry's action is currently executing.
    pub fn is_processing(&self) -> bool {
        self.core.state.lock().expect(POISONED).processing
    }

    /// The number of entries being timed or processed, at most
    /// [`server_count()`].
    ///
    /// [`server_count()`]: TaskQueue::server_count
    pub fn in_use_count(&self) -> usize {
        QueueStatus::in_use_count(&*self.core)
    }

    /// The number of entries this queue can time concurrently.
    pub fn server_count(&self) -> usize {
        QueueStatus::server_count(&*self.core)
    }

    /// Register an observer notified on busy/size/frozen/deleted changes.
    pub fn add_observer(&self, observer: Arc<dyn QueueObserver>) {
        self.core.add_observer(observer);
    }

    /// Remove a previously registered observer.
    pub fn remove_observer(&self, observer: &Arc<dyn QueueObserver>) -> bool {
        self.core.remove_observer(observer)
    }

    pub(crate) fn core(&self) -> &Arc<QueueCore> {
        &self.core
    }
}

impl QueueStatus for TaskQueue {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn size(&self) -> usize {
        QueueStatus::size(&*self.core)
    }

    fn is_busy(&self) -> bool {
        QueueStatus::is_busy(&*self.core)
    }

    fn is_frozen(&self) -> bool {
        QueueStatus::is_frozen(&*self.core)
    }

    fn is_deleted(&self) -> bool {
        QueueStatus::is_deleted(&*self.core)
    }

    fn in_use_count(&self) -> usize {
        QueueStatus::in_use_count(&*self.core)
    }

    fn server_count(&self) -> usize {
        QueueStatus::server_count(&*self.core)
    }
}

impl SimObject for TaskQueue {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn print_configuration(&self, prefix: &str, out: &mut dyn io::Write) -> io::Result<()> {
        let qs = self.core.state.lock().expect(POISONED);
        writeln!(out, "{prefix}discipline: {:?}", qs.discipline)?;
        writeln!(out, "{prefix}deletion policy: {:?}", qs.delete_policy)?;
        writeln!(out, "{prefix}can freeze: {}", qs.can_freeze)?;
        writeln!(out, "{prefix}can release: {}", qs.can_release)?;
        writeln!(out, "{prefix}release policy: {:?}", qs.release_policy)?;
        writeln!(out, "{prefix}concurrency limit: 1")?;
        writeln!(out, "{prefix}preemption allowed: {}", qs.preempt)?;
        Ok(())
    }

    fn print_state(&self, prefix: &str, out: &mut dyn io::Write) -> io::Result<()> {
        let qs = self.core.state.lock().expect(POISONED);
        writeln!(out, "{prefix}queue size: {}", qs.store.len())?;
        writeln!(out, "{prefix}frozen: {}", qs.frozen)?;
        writeln!(out, "{prefix}release count: {}", qs.release_count)?;
        writeln!(out, "{prefix}busy: {}", qs.scheduled.is_some())?;
        writeln!(out, "{prefix}processing: {}", qs.processing)?;
        writeln!(
            out,
            "{prefix}number being serviced: {}",
            usize::from(qs.scheduled.is_some())
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let qs = self.core.state.lock().expect(POISONED);
        f.debug_struct("TaskQueue")
            .field("name", &&*self.core.name)
            .field("discipline", &qs.discipline)
            .field("size", &qs.store.len())
            .field("busy", &qs.scheduled.is_some())
            .field("frozen", &qs.frozen)
            .finish()
    }
}
