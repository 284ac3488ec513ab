use crate::event::{EventAction, EventId};
use crate::{Simulation, Ticks};

use std::panic::{catch_unwind, panic_any, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

pub(crate) const POISONED: &str = "task handoff state poisoned";

/// Panic payload used to unwind a canceled task. The spawn wrapper swallows
/// it; any other payload is forwarded to the driving thread and re-raised
/// there, aborting the run.
pub(crate) struct TaskCancel;

type TaskBody = Box<dyn FnOnce(&TaskContext) + Send>;

/// Handoff flags shared between a task thread and whichever thread is
/// driving the simulation.
///
/// `runnable_paused` gates the task side: the task parks while it is true.
/// `sched_paused` gates the driving side: the driver parks while it is true.
/// The two are never false at the same time while both threads are alive,
/// which is what keeps exactly one of them in unguarded application code.
pub(crate) struct Handoff {
    pub runnable_paused: bool,
    pub sched_paused: bool,
    pub cancel_requested: bool,
    /// The task is waiting inside a queue (not yet scheduled).
    pub thread_queued: bool,
    /// The task's queue entry was canceled; its queue-insertion call must
    /// report failure once the task resumes.
    pub queuing_canceled: bool,
    /// Scheduler event that will start or resume this task, when one exists.
    pub resume_event: Option<EventId>,
    pub started: bool,
    pub finished: bool,
    panic: Option<Box<dyn std::any::Any + Send>>,
}

/// Rendezvous channel for one task thread: one mutex, two conditions.
///
/// `resumed` wakes the task side, `yielded` wakes the driving side. Every
/// wait is a predicate loop over the [`Handoff`] flags, so spurious wakeups
/// cannot break the handoff invariant.
pub(crate) struct TaskShared {
    pub hand: Mutex<Handoff>,
    pub resumed: Condvar,
    pub yielded: Condvar,
    body: Mutex<Option<TaskBody>>,
    pub label: Option<Arc<str>>,
}

impl TaskShared {
    pub fn new(body: TaskBody, label: Option<Arc<str>>) -> Self {
        Self {
            hand: Mutex::new(Handoff {
                runnable_paused: true,
                sched_paused: false,
                cancel_requested: false,
                thread_queued: false,
                queuing_canceled: false,
                resume_event: None,
                started: false,
                finished: false,
                panic: None,
            }),
            resumed: Condvar::new(),
            yielded: Condvar::new(),
            body: Mutex::new(Some(body)),
            label,
        }
    }
}

/// Block the calling (driving) thread until the task yields control back,
/// then re-raise any panic the task produced.
pub(crate) fn wait_for_yield(shared: &TaskShared) {
    let mut hand = shared.hand.lock().expect(POISONED);
    while hand.sched_paused {
        hand = shared.yielded.wait(hand).expect(POISONED);
    }
    if let Some(payload) = hand.panic.take() {
        drop(hand);
        resume_unwind(payload);
    }
}

/// Process a start event: spawn the OS thread for a task that has not run
/// yet and wait for its first yield. A task whose body was already taken
/// (canceled before starting) is skipped.
pub(crate) fn start_and_wait(sim: &Simulation, shared: &Arc<TaskShared>) {
    let body = match shared.body.lock().expect(POISONED).take() {
        Some(body) => body,
        None => return,
    };
    {
        let mut hand = shared.hand.lock().expect(POISONED);
        hand.resume_event = None;
        hand.started = true;
        hand.sched_paused = true;
        hand.runnable_paused = false;
    }
    sim.fire_task_start(shared.label.as_deref());
    let ctx = TaskContext {
        sim: sim.clone(),
        shared: Arc::clone(shared),
    };
    let spawn_result = thread::Builder::new()
        .name(match &shared.label {
            Some(label) => format!("quesim-task-{label}"),
            None => "quesim-task".to_string(),
        })
        .spawn(move || run_task(ctx, body));
    match spawn_result {
        Ok(_) => wait_for_yield(shared),
        // spawn failure is an environment-level fault; restore the handoff
        // so the driving thread is not stranded, then surface it
        Err(err) => {
            let mut hand = shared.hand.lock().expect(POISONED);
            hand.sched_paused = false;
            hand.finished = true;
            drop(hand);
            panic!("failed to spawn task thread: {err}");
        }
    }
}

fn run_task(ctx: TaskContext, body: TaskBody) {
    let outcome = catch_unwind(AssertUnwindSafe(|| body(&ctx)));
    ctx.sim.fire_task_end(ctx.shared.label.as_deref());
    let mut hand = ctx.shared.hand.lock().expect(POISONED);
    if let Err(payload) = outcome {
        if !payload.is::<TaskCancel>() {
            hand.panic = Some(payload);
        }
    }
    hand.finished = true;
    hand.runnable_paused = true;
    hand.sched_paused = false;
    drop(hand);
    ctx.shared.yielded.notify_all();
}

/// Process a resume event: wake a parked task and wait for its next yield.
/// Resuming a task that already terminated is a no-op.
pub(crate) fn resume_and_wait(sim: &Simulation, shared: &Arc<TaskShared>) {
    {
        let mut hand = shared.hand.lock().expect(POISONED);
        if hand.finished {
            return;
        }
        if !hand.started {
            // the task was handed to a queue before ever running; its first
            // resumption is its start
            drop(hand);
            start_and_wait(sim, shared);
            return;
        }
        hand.resume_event = None;
        hand.sched_paused = true;
        hand.runnable_paused = false;
    }
    sim.fire_task_resume(shared.label.as_deref());
    shared.resumed.notify_all();
    wait_for_yield(shared);
}

/// Park the calling task thread until a resume event (or a queue) wakes it.
///
/// The caller must already have arranged exactly one resumption path: a
/// scheduler event or a queue entry. Yields control to the driving thread,
/// then blocks; on cancellation the pending resume event is descheduled and
/// the task unwinds.
pub(crate) fn park_until_resumed(sim: &Simulation, shared: &Arc<TaskShared>) {
    sim.fire_task_pause(shared.label.as_deref());
    let mut hand = shared.hand.lock().expect(POISONED);
    hand.runnable_paused = true;
    hand.sched_paused = false;
    shared.yielded.notify_all();
    loop {
        if hand.cancel_requested {
            hand.cancel_requested = false;
            hand.runnable_paused = true;
            let stale = hand.resume_event.take();
            drop(hand);
            if let Some(id) = stale {
                sim.deschedule_id(id);
            }
            panic_any(TaskCancel);
        }
        if !hand.runnable_paused {
            break;
        }
        hand = shared.resumed.wait(hand).expect(POISONED);
    }
}

/// The execution context handed to every task body.
///
/// A task is an ordinary closure running on its own OS thread, but the
/// handoff protocol guarantees that it never runs concurrently with the
/// driving thread or another task. The context provides the blocking
/// operations that suspend the task in simulated time and access to the
/// owning [`Simulation`] for scheduling further work.
pub struct TaskContext {
    pub(crate) sim: Simulation,
    pub(crate) shared: Arc<TaskShared>,
}

impl TaskContext {
    /// The simulation this task belongs to.
    pub fn simulation(&self) -> &Simulation {
        &self.sim
    }

    /// Suspend this task for `delay` ticks of simulated time.
    pub fn pause(&self, delay: Ticks) {
        self.pause_with_priority(delay, 0.0);
    }

    /// Suspend this task for `delay` ticks, resuming with the given
    /// tie priority.
    pub fn pause_with_priority(&self, delay: Ticks, tpriority: f64) {
        let id = self.sim.schedule_action(
            EventAction::ResumeTask(Arc::clone(&self.shared)),
            delay,
            tpriority,
            self.shared.label.clone(),
        );
        self.shared.hand.lock().expect(POISONED).resume_event = Some(id);
        park_until_resumed(&self.sim, &self.shared);
    }

    /// Terminate this task immediately by unwinding it.
    pub fn cancel(&self) -> ! {
        panic_any(TaskCancel)
    }
}

/// Handle to a task thread.
///
/// Obtained from [`Simulation::schedule_task`] or
/// [`Simulation::unscheduled_task`]. Dropping the handle does not affect the
/// task.
///
/// [`Simulation::schedule_task`]: crate::Simulation::schedule_task
/// [`Simulation::unscheduled_task`]: crate::Simulation::unscheduled_task
#[derive(Clone)]
pub struct Task {
    pub(crate) sim: Simulation,
    pub(crate) shared: Arc<TaskShared>,
}

impl Task {
    /// Cancel this task.
    ///
    /// A task that has not started will never start; a parked task is woken
    /// and unwinds instead of resuming; a finished task is unaffected.
    pub fn cancel(&self) {
        *self.shared.body.lock().expect(POISONED) = None;
        let stale = self.shared.hand.lock().expect(POISONED).resume_event.take();
        if let Some(id) = stale {
            self.sim.deschedule_id(id);
        }
        let mut hand = self.shared.hand.lock().expect(POISONED);
        if hand.finished {
            return;
        }
        hand.cancel_requested = true;
        hand.runnable_paused = false;
        drop(hand);
        self.shared.resumed.notify_all();
    }

    /// Schedule a not-yet-started task to start after `delay` ticks.
    /// Returns `false` when the task already started, finished, or has a
    /// pending start event.
    pub fn schedule(&self, delay: Ticks) -> bool {
        self.schedule_with_priority(delay, 0.0)
    }

    /// As [`schedule`], with an explicit tie priority for the start event.
    ///
    /// [`schedule`]: Task::schedule
    pub fn schedule_with_priority(&self, delay: Ticks, tpriority: f64) -> bool {
        {
            let hand = self.shared.hand.lock().expect(POISONED);
            if hand.started || hand.finished || hand.resume_event.is_some() {
                return false;
            }
        }
        let id = self.sim.schedule_action(
            EventAction::StartTask(Arc::clone(&self.shared)),
            delay,
            tpriority,
            self.shared.label.clone(),
        );
        self.shared.hand.lock().expect(POISONED).resume_event = Some(id);
        true
    }

    /// Move this task's pending start or resume event to `delay` ticks from
    /// now. Fails (returns `false`) when the task has no pending event, e.g.
    /// while it is running or waiting inside a queue.
    pub fn reschedule(&self, delay: Ticks) -> bool {
        self.reschedule_with_priority(delay, 0.0)
    }

    /// As [`reschedule`], with an explicit tie priority.
    ///
    /// [`reschedule`]: Task::reschedule
    pub fn reschedule_with_priority(&self, delay: Ticks, tpriority: f64) -> bool {
        let pending = self.shared.hand.lock().expect(POISONED).resume_event;
        match pending {
            Some(id) => self.sim.reschedule_id(id, delay, tpriority),
            None => false,
        }
    }

    /// Whether the task has a pending start or resume event on the
    /// scheduler's queue.
    pub fn is_scheduled(&self) -> bool {
        let pending = self.shared.hand.lock().expect(POISONED).resume_event;
        match pending {
            Some(id) => self.sim.is_pending_id(id),
            None => false,
        }
    }

    /// Whether the task's body has returned or unwound.
    pub fn is_finished(&self) -> bool {
        self.shared.hand.lock().expect(POISONED).finished
    }
}
