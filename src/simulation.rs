use crate::event::{EventAction, EventArena, EventId, EventKey, EventRecord};
use crate::task::{self, Task, TaskContext, TaskShared};
use crate::{Error, Result, SimEvent, Ticks};

use ordered_float::OrderedFloat;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

const POISONED: &str = "scheduler state poisoned";

/// Controls when a running simulation pauses.
///
/// [`Simulation::run_monitored`] polls [`simulation_pauses()`] once per loop
/// iteration, before the first event and after each processed event, and
/// returns as soon as it answers `true`. The event that would have run next
/// stays on the queue, so the run can be resumed later.
///
/// [`simulation_pauses()`]: SimulationMonitor::simulation_pauses
pub trait SimulationMonitor {
    /// Report whether the simulation should stop processing events for now.
    fn simulation_pauses(&mut self, sim: &Simulation) -> bool;
}

/// Observer of simulation-level lifecycle transitions.
///
/// Every method has an empty default body, so implementations override only
/// the transitions they care about. Each hook is also emitted as a
/// [`tracing`] event at trace level, whether or not listeners are
/// registered.
///
/// The `source` argument, where present, names the simulation object the
/// transition is attributed to, when one was named.
#[allow(unused_variables)]
pub trait SimulationListener: Send + Sync {
    /// The event loop is starting.
    fn simulation_start(&self, sim: &Simulation) {}
    /// The event loop has ended, normally or otherwise.
    fn simulation_end(&self, sim: &Simulation) {}
    /// A scheduled callable is about to run.
    fn call_start(&self, sim: &Simulation, source: Option<&str>) {}
    /// A scheduled callable has returned.
    fn call_end(&self, sim: &Simulation, source: Option<&str>) {}
    /// A task thread is starting.
    fn task_start(&self, sim: &Simulation, source: Option<&str>) {}
    /// A task thread is suspending.
    fn task_pause(&self, sim: &Simulation, source: Option<&str>) {}
    /// A suspended task thread is resuming.
    fn task_resume(&self, sim: &Simulation, source: Option<&str>) {}
    /// A task thread's body has returned or unwound.
    fn task_end(&self, sim: &Simulation, source: Option<&str>) {}
    /// A task queue has begun servicing an entry.
    fn queue_start(&self, sim: &Simulation, queue: &str) {}
    /// A task queue has finished servicing an entry.
    fn queue_stop(&self, sim: &Simulation, queue: &str) {}
    /// A server queue has bound an entry to a server.
    fn server_selected(&self, sim: &Simulation, queue: &str) {}
}

struct SchedState {
    queue: EventArena,
    current_ticks: Ticks,
    current_priority: f64,
    next_seq: u64,
    next_id: EventId,
    running: bool,
}

pub(crate) struct SimCore {
    state: Mutex<SchedState>,
    listeners: Mutex<Vec<Arc<dyn SimulationListener>>>,
}

/// The simulation scheduler: a logical clock plus the pending-event queue.
///
/// A `Simulation` is a cheap cloneable handle; clones share the same clock
/// and queue, which is how callables, task threads, and queues scheduled
/// from arbitrary threads all feed one event loop. Exactly one thread may
/// drive [`run()`] at a time.
///
/// Events execute in ascending order of (time, tie priority), with exact
/// ties broken by scheduling order. Time never moves backwards: scheduling
/// at an absolute time before [`current_ticks()`] fails with
/// [`Error::BackInTime`], and the relative forms take unsigned delays.
///
/// # Panics
///
/// The internal state is guarded by [`Mutex`]es that are never held across
/// calls into application code; methods on this type panic only if one of
/// those mutexes was poisoned by a panicking event action, in which case the
/// simulation state is unreliable anyway. A panic inside an event action or
/// a task thread aborts the run by propagating out of [`run()`].
///
/// [`run()`]: Simulation::run
/// [`current_ticks()`]: Simulation::current_ticks
/// [`Error::BackInTime`]: crate::Error::BackInTime
#[derive(Clone)]
pub struct Simulation {
    core: Arc<SimCore>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation {
    /// Create a simulation with an empty event queue and the clock at zero.
    pub fn new() -> Self {
        Self {
            core: Arc::new(SimCore {
                state: Mutex::new(SchedState {
                    queue: EventArena::default(),
                    current_ticks: 0,
                    current_priority: 0.0,
                    next_seq: 0,
                    next_id: 0,
                    running: false,
                }),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The current simulation time, in ticks.
    pub fn current_ticks(&self) -> Ticks {
        self.core.state.lock().expect(POISONED).current_ticks
    }

    /// The tie priority of the event that most recently advanced the clock;
    /// 0.0 between runs and after a manual [`advance`].
    ///
    /// [`advance`]: Simulation::advance
    pub fn current_tie_priority(&self) -> f64 {
        self.core.state.lock().expect(POISONED).current_priority
    }

    /// The number of events waiting on the queue.
    pub fn pending_event_count(&self) -> usize {
        self.core.state.lock().expect(POISONED).queue.len()
    }

    /// Ticks until the next scheduled event, or `None` for an empty queue.
    pub fn next_event_interval(&self) -> Option<Ticks> {
        let state = self.core.state.lock().expect(POISONED);
        state.queue.peek_key().map(|key| key.time - state.current_ticks)
    }

    /// Advance the clock by at most `interval` ticks, never past the next
    /// scheduled event. Returns the number of ticks actually advanced.
    pub fn advance(&self, interval: Ticks) -> Ticks {
        let mut state = self.core.state.lock().expect(POISONED);
        let step = match state.queue.peek_key() {
            Some(key) => interval.min(key.time - state.current_ticks),
            None => interval,
        };
        state.current_ticks += step;
        state.current_priority = 0.0;
        step
    }

    /// Schedule `f` to run after `delay` ticks.
    pub fn schedule_call<F>(&self, f: F, delay: Ticks) -> SimEvent
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_call_with_priority(f, delay, 0.0)
    }

    /// Schedule `f` to run after `delay` ticks with the given tie priority.
    ///
    /// Among events due at the same tick, lower tie priorities run first and
    /// exact ties run in scheduling order.
    pub fn schedule_call_with_priority<F>(&self, f: F, delay: Ticks, tpriority: f64) -> SimEvent
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.schedule_action(EventAction::Call(Box::new(f)), delay, tpriority, None);
        SimEvent::sched(self.clone(), id)
    }

    /// Schedule `f` to run at the absolute time `time`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackInTime`] when `time` is earlier than
    /// [`current_ticks()`], with no modification to the queue. Scheduling at
    /// exactly the current time succeeds; the event runs after every
    /// already-queued event due at this tick with a tie priority less than
    /// or equal to `tpriority`.
    ///
    /// [`current_ticks()`]: Simulation::current_ticks
    /// [`Error::BackInTime`]: crate::Error::BackInTime
    pub fn schedule_call_at<F>(&self, f: F, time: Ticks, tpriority: f64) -> Result<SimEvent>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.core.state.lock().expect(POISONED);
        if time < state.current_ticks {
            return Err(Error::BackInTime {
                requested: time,
                now: state.current_ticks,
            });
        }
        let id = state.insert(EventAction::Call(Box::new(f)), time, tpriority, None);
        drop(state);
        Ok(SimEvent::sched(self.clone(), id))
    }

    /// Create a task thread and schedule it to start after `delay` ticks.
    pub fn schedule_task<F>(&self, f: F, delay: Ticks) -> Task
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        self.schedule_task_with_priority(f, delay, 0.0)
    }

    /// As [`schedule_task`], with an explicit tie priority for the start
    /// event.
    ///
    /// [`schedule_task`]: Simulation::schedule_task
    pub fn schedule_task_with_priority<F>(&self, f: F, delay: Ticks, tpriority: f64) -> Task
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        let task = self.unscheduled_task(f);
        let id = self.schedule_action(
            EventAction::StartTask(Arc::clone(&task.shared)),
            delay,
            tpriority,
            None,
        );
        task.shared.hand.lock().expect(task::POISONED).resume_event = Some(id);
        task
    }

    /// Create a task thread without scheduling it. The task runs when its
    /// handle is scheduled or when a queue it was added to services it.
    pub fn unscheduled_task<F>(&self, f: F) -> Task
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        Task {
            sim: self.clone(),
            shared: Arc::new(TaskShared::new(Box::new(f), None)),
        }
    }

    /// Start a task immediately, blocking the calling logical thread until
    /// the task first suspends or terminates.
    ///
    /// May be called from the driving thread (between runs or inside an
    /// event action) or from another task; the handoff protocol keeps
    /// exactly one logical thread running either way.
    pub fn start_immediate_task<F>(&self, f: F) -> Task
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        let task = self.unscheduled_task(f);
        task::start_and_wait(self, &task.shared);
        task
    }

    /// Run the simulation until the event queue empties.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if called while another `run` form
    /// is active on this simulation.
    ///
    /// [`Error::AlreadyRunning`]: crate::Error::AlreadyRunning
    pub fn run(&self) -> Result {
        let _guard = self.begin_run()?;
        loop {
            match self.pop_next(None) {
                Some(record) => self.execute(record),
                None => return Ok(()),
            }
        }
    }

    /// Run the simulation for `interval` ticks of simulated time.
    ///
    /// Events due within the window are processed; later events stay queued
    /// and the clock is left at the end of the window whether or not the
    /// queue drained.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if called while another `run` form
    /// is active on this simulation.
    ///
    /// [`Error::AlreadyRunning`]: crate::Error::AlreadyRunning
    pub fn run_for(&self, interval: Ticks) -> Result {
        let maxtime = self.current_ticks() + interval;
        let _guard = self.begin_run()?;
        loop {
            match self.pop_next(Some(maxtime)) {
                Some(record) => self.execute(record),
                None => {
                    let mut state = self.core.state.lock().expect(POISONED);
                    state.current_ticks = maxtime;
                    state.current_priority = 0.0;
                    return Ok(());
                }
            }
        }
    }

    /// Run the simulation under the control of a [`SimulationMonitor`],
    /// returning when the monitor requests a pause or the queue empties.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if called while another `run` form
    /// is active on this simulation.
    ///
    /// [`Error::AlreadyRunning`]: crate::Error::AlreadyRunning
    pub fn run_monitored<M>(&self, monitor: &mut M) -> Result
    where
        M: SimulationMonitor + ?Sized,
    {
        let _guard = self.begin_run()?;
        if monitor.simulation_pauses(self) {
            return Ok(());
        }
        loop {
            match self.pop_next(None) {
                Some(record) => self.execute(record),
                None => return Ok(()),
            }
            if monitor.simulation_pauses(self) {
                return Ok(());
            }
        }
    }

    /// Register a listener for simulation lifecycle transitions.
    pub fn add_listener(&self, listener: Arc<dyn SimulationListener>) {
        self.core.listeners.lock().expect(POISONED).push(listener);
    }

    /// Remove a previously registered listener. Returns whether it was
    /// found.
    pub fn remove_listener(&self, listener: &Arc<dyn SimulationListener>) -> bool {
        let mut listeners = self.core.listeners.lock().expect(POISONED);
        match listeners.iter().position(|l| Arc::ptr_eq(l, listener)) {
            Some(idx) => {
                listeners.remove(idx);
                true
            }
            None => false,
        }
    }

    fn begin_run(&self) -> Result<RunGuard<'_>> {
        {
            let mut state = self.core.state.lock().expect(POISONED);
            if state.running {
                return Err(Error::AlreadyRunning);
            }
            state.running = true;
        }
        tracing::trace!(target: "quesim", "simulation starting");
        for listener in self.listeners() {
            listener.simulation_start(self);
        }
        Ok(RunGuard { sim: self })
    }

    /// Pop the next due event and advance the clock to it. With a bound,
    /// events past the bound are left on the queue.
    fn pop_next(&self, bound: Option<Ticks>) -> Option<EventRecord> {
        let mut state = self.core.state.lock().expect(POISONED);
        let key = state.queue.peek_key()?;
        if let Some(maxtime) = bound {
            if key.time > maxtime {
                return None;
            }
        }
        let (key, record) = state.queue.pop_first()?;
        if key.time > state.current_ticks {
            state.current_ticks = key.time;
            state.current_priority = key.tpriority.0;
        }
        Some(record)
    }

    fn execute(&self, record: EventRecord) {
        let source = record.source;
        match record.action {
            EventAction::Call(f) => {
                self.fire_call_start(source.as_deref());
                f();
                self.fire_call_end(source.as_deref());
            }
            EventAction::StartTask(shared) => task::start_and_wait(self, &shared),
            EventAction::ResumeTask(shared) => task::resume_and_wait(self, &shared),
            EventAction::QueueEntry { queue, entry } => queue.process_scheduled(entry),
            EventAction::QueuePause { queue, task } => queue.process_pause(&task),
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn SimulationListener>> {
        self.core.listeners.lock().expect(POISONED).clone()
    }

    pub(crate) fn schedule_action(
        &self,
        action: EventAction,
        delay: Ticks,
        tpriority: f64,
        source: Option<Arc<str>>,
    ) -> EventId {
        let mut state = self.core.state.lock().expect(POISONED);
        let time = state.current_ticks + delay;
        state.insert(action, time, tpriority, source)
    }

    /// Remove a pending event by id. Returns whether it was still pending.
    pub(crate) fn deschedule_id(&self, id: EventId) -> bool {
        self.core
            .state
            .lock()
            .expect(POISONED)
            .queue
            .remove(id)
            .is_some()
    }

    /// Move a pending event to `delay` ticks from now, keeping its id but
    /// assigning a fresh position in the tie order. Fails when the event is
    /// no longer pending.
    pub(crate) fn reschedule_id(&self, id: EventId, delay: Ticks, tpriority: f64) -> bool {
        let mut state = self.core.state.lock().expect(POISONED);
        let record = match state.queue.remove(id) {
            Some(record) => record,
            None => return false,
        };
        let time = state.current_ticks + delay;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.insert(
            EventKey {
                time,
                tpriority: OrderedFloat(tpriority),
                seq,
            },
            record,
        );
        true
    }

    pub(crate) fn is_pending_id(&self, id: EventId) -> bool {
        self.core.state.lock().expect(POISONED).queue.contains(id)
    }

    pub(crate) fn fire_call_start(&self, source: Option<&str>) {
        tracing::trace!(target: "quesim", source, "call start");
        for listener in self.listeners() {
            listener.call_start(self, source);
        }
    }

    pub(crate) fn fire_call_end(&self, source: Option<&str>) {
        tracing::trace!(target: "quesim", source, "call end");
        for listener in self.listeners() {
            listener.call_end(self, source);
        }
    }

    pub(crate) fn fire_task_start(&self, source: Option<&str>) {
        tracing::trace!(target: "quesim", source, "task start");
        for listener in self.listeners() {
            listener.task_start(self, source);
        }
    }

    pub(crate) fn fire_task_pause(&self, source: Option<&str>) {
        tracing::trace!(target: "quesim", source, "task pause");
        for listener in self.listeners() {
            listener.task_pause(self, source);
        }
    }

    pub(crate) fn fire_task_resume(&self, source: Option<&str>) {
        tracing::trace!(target: "quesim", source, "task resume");
        for listener in self.listeners() {
            listener.task_resume(self, source);
        }
    }

    pub(crate) fn fire_task_end(&self, source: Option<&str>) {
        tracing::trace!(target: "quesim", source, "task end");
        for listener in self.listeners() {
            listener.task_end(self, source);
        }
    }

    pub(crate) fn fire_queue_start(&self, queue: &str) {
        tracing::trace!(target: "quesim", queue, "queue servicing entry");
        for listener in self.listeners() {
            listener.queue_start(self, queue);
        }
    }

    pub(crate) fn fire_queue_stop(&self, queue: &str) {
        tracing::trace!(target: "quesim", queue, "queue finished entry");
        for listener in self.listeners() {
            listener.queue_stop(self, queue);
        }
    }

    pub(crate) fn fire_server_selected(&self, queue: &str) {
        tracing::trace!(target: "quesim", queue, "server selected");
        for listener in self.listeners() {
            listener.server_selected(self, queue);
        }
    }
}

impl SchedState {
    fn insert(
        &mut self,
        action: EventAction,
        time: Ticks,
        tpriority: f64,
        source: Option<Arc<str>>,
    ) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert(
            EventKey {
                time,
                tpriority: OrderedFloat(tpriority),
                seq,
            },
            EventRecord { id, source, action },
        );
        id
    }
}

struct RunGuard<'a> {
    sim: &'a Simulation,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.sim.core.state.lock().expect(POISONED).running = false;
        tracing::trace!(target: "quesim", "simulation ending");
        for listener in self.sim.listeners() {
            listener.simulation_end(self.sim);
        }
    }
}

impl Debug for Simulation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.lock().expect(POISONED);
        f.debug_struct("Simulation")
            .field("current_ticks", &state.current_ticks)
            .field("pending_events", &state.queue.len())
            .finish()
    }
}

impl std::fmt::Display for Simulation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Simulation at time {}", self.current_ticks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executes_events_in_time_order() {
        let sim = Simulation::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(4u64, 'b'), (2, 'a'), (9, 'c')] {
            let order = Arc::clone(&order);
            sim.schedule_call(move || order.lock().unwrap().push(tag), delay);
        }
        sim.run().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!['a', 'b', 'c']);
        assert_eq!(sim.current_ticks(), 9);
    }

    #[test]
    fn same_time_ties_break_by_priority_then_order() {
        let sim = Simulation::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let push = |tag: u32| {
            let order = Arc::clone(&order);
            move || order.lock().unwrap().push(tag)
        };
        sim.schedule_call_with_priority(push(2), 5, 1.0);
        sim.schedule_call_with_priority(push(1), 5, -1.0);
        sim.schedule_call_with_priority(push(3), 5, 1.0);
        sim.run().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn scheduling_into_the_past_fails() {
        let sim = Simulation::new();
        sim.schedule_call(|| {}, 7);
        sim.run().unwrap();
        let err = sim.schedule_call_at(|| {}, 3, 0.0).unwrap_err();
        assert_eq!(err, Error::BackInTime { requested: 3, now: 7 });
    }

    #[test]
    fn events_scheduled_during_processing_run_in_the_same_pass() {
        let sim = Simulation::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&hits);
        let sim2 = sim.clone();
        sim.schedule_call(
            move || {
                inner.lock().unwrap().push("outer");
                let inner2 = Arc::clone(&inner);
                // same-tick continuation runs after already-queued events
                sim2.schedule_call(move || inner2.lock().unwrap().push("inner"), 0);
            },
            1,
        );
        let tail = Arc::clone(&hits);
        sim.schedule_call(move || tail.lock().unwrap().push("tail"), 1);
        sim.run().unwrap();
        assert_eq!(*hits.lock().unwrap(), vec!["outer", "tail", "inner"]);
    }

    #[test]
    fn advance_clamps_to_next_event() {
        let sim = Simulation::new();
        sim.schedule_call(|| {}, 5);
        assert_eq!(sim.advance(3), 3);
        assert_eq!(sim.advance(10), 2);
        assert_eq!(sim.current_ticks(), 5);
        assert_eq!(sim.next_event_interval(), Some(0));
    }
}
