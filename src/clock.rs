use crate::object::{QueueStatus, SimObject};
use crate::queue::{EntryParams, TaskQueue};
use crate::task::TaskContext;
use crate::{SimEvent, Simulation, Ticks};

use std::io;

/// Models exclusive consumption of a single timed resource, such as CPU
/// time.
///
/// A `ProcessClock` wraps one priority queue with preempt mode enabled:
/// requests consume the clock one at a time in priority order (lower is more
/// urgent), and a newly arrived request that outranks the one currently
/// consuming time displaces it, carrying the displaced request's remaining
/// interval forward. A request whose consumption has finished and whose
/// action is running is never preempted.
#[derive(Clone, Debug)]
pub struct ProcessClock {
    queue: TaskQueue,
    name: String,
}

impl ProcessClock {
    /// Create a process clock.
    pub fn new(sim: &Simulation, name: impl Into<String>) -> Self {
        let name = name.into();
        let queue = TaskQueue::priority(sim, format!("{name}[queue]"));
        queue.core().force_preempt(true);
        Self { queue, name }
    }

    /// Request `interval` ticks of the clock at the given priority, running
    /// `f` when the time has been consumed. Returns a cancelable handle, or
    /// `None` when the clock refuses new requests.
    pub fn advance_call<F>(&self, f: F, priority: i32, interval: Ticks) -> Option<SimEvent>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue
            .add_call(f, EntryParams::new(interval).priority(priority))
    }

    /// Suspend the calling task until the clock is free and `interval` ticks
    /// have been consumed at the given priority.
    ///
    /// Returns `false` when the request could not be queued or was canceled
    /// while waiting; the task continues either way.
    pub fn advance(&self, ctx: &TaskContext, priority: i32, interval: Ticks) -> bool {
        self.queue
            .add_current_task(ctx, EntryParams::new(interval).priority(priority))
    }

    /// As [`advance`], additionally passing the cancelable request handle to
    /// `on_event` before suspending.
    ///
    /// [`advance`]: ProcessClock::advance
    pub fn advance_with<F>(
        &self,
        ctx: &TaskContext,
        priority: i32,
        interval: Ticks,
        on_event: F,
    ) -> bool
    where
        F: FnOnce(SimEvent),
    {
        self.queue
            .add_current_task_with(ctx, EntryParams::new(interval).priority(priority), on_event)
    }

    /// Requests waiting for the clock, excluding the one consuming it.
    pub fn size(&self) -> usize {
        self.queue.size()
    }

    /// Whether a request is consuming the clock.
    pub fn is_busy(&self) -> bool {
        self.queue.is_busy()
    }
}

impl SimObject for ProcessClock {
    fn name(&self) -> &str {
        &self.name
    }

    fn print_configuration(&self, prefix: &str, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "{prefix}queue:")?;
        let deeper = format!("{prefix}  ");
        self.queue.print_configuration(&deeper, out)
    }

    fn print_state(&self, prefix: &str, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "{prefix}busy: {}", self.is_busy())?;
        writeln!(out, "{prefix}queue:")?;
        let deeper = format!("{prefix}  ");
        self.queue.print_state(&deeper, out)
    }
}

impl QueueStatus for ProcessClock {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.queue.size()
    }

    fn is_busy(&self) -> bool {
        self.queue.is_busy()
    }

    fn is_frozen(&self) -> bool {
        self.queue.is_frozen()
    }

    fn is_deleted(&self) -> bool {
        self.queue.is_deleted()
    }

    fn in_use_count(&self) -> usize {
        self.queue.in_use_count()
    }

    fn server_count(&self) -> usize {
        self.queue.server_count()
    }
}
