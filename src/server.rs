use crate::event::EventAction;
use crate::object::{QueueObserver, QueueStatus, SimObject};
use crate::queue::{EntryParams, QueueDeletePolicy, TaskQueue};
use crate::task::TaskContext;
use crate::{Error, Result, SimEvent, Simulation, Ticks};

use std::collections::BTreeSet;
use std::io;
use std::sync::{Arc, Mutex, Weak};

const POISONED: &str = "server queue state poisoned";

/// A server resource owned by a [`ServerQueue`].
///
/// The server's own processing interval is added to the interval requested
/// with each entry it serves; a server that adds no time of its own can rely
/// on the default.
pub trait QueueServer: Send + 'static {
    /// Ticks this server adds to every entry it serves.
    fn interval(&self) -> Ticks {
        0
    }
}

/// Work queued on a [`ServerQueue`] as a callable.
///
/// When a server becomes available and the combined interval elapses,
/// [`interact_with`] runs with exclusive access to the server; the server is
/// then released and [`complete`] runs.
///
/// [`interact_with`]: QueueCallable::interact_with
/// [`complete`]: QueueCallable::complete
pub trait QueueCallable<S>: Send {
    /// The interaction with the server that ends the entry's service time.
    fn interact_with(&mut self, server: &mut S);
    /// Runs after the server has been released.
    fn complete(&mut self) {}
}

/// Work queued on a [`ServerQueue`] that runs as a task thread.
///
/// A task thread is started when service completes: it first runs
/// [`interact_with`] while holding the server, then releases the server and
/// runs [`run`], which may itself suspend.
///
/// [`interact_with`]: QueueRunnable::interact_with
/// [`run`]: QueueRunnable::run
pub trait QueueRunnable<S>: Send {
    /// The interaction with the server that ends the entry's service time.
    fn interact_with(&mut self, ctx: &TaskContext, server: &mut S);
    /// Runs on the task thread after the server has been released.
    #[allow(unused_variables)]
    fn run(&mut self, ctx: &TaskContext) {}
}

struct Pool<S> {
    slots: Vec<Option<S>>,
    idle: BTreeSet<usize>,
}

struct SqState {
    user_frozen: bool,
    deleting: bool,
    deleted: bool,
    waiting_for_last_server: bool,
    delete_policy: QueueDeletePolicy,
    can_freeze: bool,
}

pub(crate) struct ServerCore<S: QueueServer> {
    sim: Simulation,
    name: Arc<str>,
    queue: TaskQueue,
    pool: Mutex<Pool<S>>,
    state: Mutex<SqState>,
    observers: Mutex<Vec<Arc<dyn QueueObserver>>>,
    server_total: usize,
}

impl<S: QueueServer> ServerCore<S> {
    /// Claim the lowest-index idle server, freezing the waiting room when
    /// the pool empties.
    ///
    /// # Panics
    ///
    /// Panics if no server is idle; the waiting room's gating makes that an
    /// internal consistency failure rather than a recoverable condition.
    fn take_idle(&self) -> (usize, S) {
        let (idx, server, exhausted) = {
            let mut pool = self.pool.lock().expect(POISONED);
            let idx = pool
                .idle
                .pop_first()
                .expect("server queue scheduled an entry with no idle server");
            let server = pool.slots[idx].take().expect("idle server slot vacated");
            (idx, server, pool.idle.is_empty())
        };
        if exhausted {
            self.queue.core().force_freeze(true);
        }
        self.notify_observers();
        (idx, server)
    }

    /// Return a server to the pool, resuming the waiting room unless the
    /// user froze the queue, and completing a deferred deletion when the
    /// last server comes back.
    fn put_idle(&self, idx: usize, server: S) {
        let (was_empty, in_use) = {
            let mut pool = self.pool.lock().expect(POISONED);
            let was_empty = pool.idle.is_empty();
            pool.slots[idx] = Some(server);
            pool.idle.insert(idx);
            (was_empty, self.server_total - pool.idle.len())
        };
        let finish_delete = {
            let mut st = self.state.lock().expect(POISONED);
            if st.waiting_for_last_server && in_use == 0 {
                st.waiting_for_last_server = false;
                st.deleted = true;
                true
            } else {
                false
            }
        };
        let user_frozen = self.state.lock().expect(POISONED).user_frozen;
        if was_empty && !user_frozen {
            self.queue.core().force_freeze(false);
        }
        if finish_delete {
            tracing::trace!(target: "quesim", queue = &*self.name, "server queue deleted");
        }
        self.notify_observers();
    }

    fn in_use(&self) -> usize {
        self.server_total - self.pool.lock().expect(POISONED).idle.len()
    }

    fn notify_observers(&self) {
        let observers: Vec<_> = self.observers.lock().expect(POISONED).clone();
        for observer in observers {
            observer.on_queue_change(self as &dyn QueueStatus);
        }
    }
}

impl<S: QueueServer> QueueStatus for ServerCore<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        let mut size = self.queue.size();
        // a dequeued entry counts until its service completes, except while
        // its action is actually executing
        if self.queue.is_busy() {
            size += 1;
        }
        if self.queue.is_processing() {
            size = size.saturating_sub(1);
        }
        size
    }

    fn is_busy(&self) -> bool {
        if self.server_total > 0 {
            self.pool.lock().expect(POISONED).idle.is_empty()
        } else {
            self.queue.size() > 0
        }
    }

    fn is_frozen(&self) -> bool {
        self.state.lock().expect(POISONED).user_frozen
    }

    fn is_deleted(&self) -> bool {
        self.state.lock().expect(POISONED).deleted
    }

    fn in_use_count(&self) -> usize {
        self.in_use()
    }

    fn server_count(&self) -> usize {
        self.server_total
    }
}

/// Watches the waiting room so a deferred server-queue deletion completes
/// once the room drains and the last busy server returns.
struct DeleteWatcher<S: QueueServer> {
    core: Weak<ServerCore<S>>,
}

impl<S: QueueServer> QueueObserver for DeleteWatcher<S> {
    fn on_queue_change(&self, queue: &dyn QueueStatus) {
        if !queue.is_deleted() {
            return;
        }
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let mut st = core.state.lock().expect(POISONED);
        if st.deleted || st.waiting_for_last_server {
            return;
        }
        if core.in_use() == 0 {
            st.deleted = true;
            drop(st);
            core.notify_observers();
        } else {
            st.waiting_for_last_server = true;
        }
    }
}

/// A queue whose entries wait for one of a fixed set of servers.
///
/// Entries wait in a discipline-ordered waiting room; whenever a server is
/// free the next entry is dequeued and bound to the lowest-index idle
/// server, occupying it for the entry's requested interval plus the server's
/// own [`interval()`]. When every server is busy the waiting room freezes,
/// and returning a server resumes it, so no server is ever bound to two
/// entries and entries never overtake the discipline order.
///
/// The generic parameter fixes the server type at compile time, which is the
/// type-checked configuration surface: a queue built over one server type
/// cannot be handed servers (or server interactions) of another.
///
/// `ServerQueue` is a cheap cloneable handle; clones share one queue.
///
/// [`interval()`]: QueueServer::interval
pub struct ServerQueue<S: QueueServer> {
    core: Arc<ServerCore<S>>,
}

impl<S: QueueServer> Clone for ServerQueue<S> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<S: QueueServer> ServerQueue<S> {
    /// A server queue whose waiting room services entries in insertion
    /// order.
    pub fn fifo(sim: &Simulation, name: impl Into<String>, servers: Vec<S>) -> Self {
        let name = name.into();
        let queue = TaskQueue::fifo(sim, format!("{name}[queue]"));
        Self::build(sim, name, queue, servers)
    }

    /// A server queue whose waiting room services the most recently added
    /// entry first.
    pub fn lifo(sim: &Simulation, name: impl Into<String>, servers: Vec<S>) -> Self {
        let name = name.into();
        let queue = TaskQueue::lifo(sim, format!("{name}[queue]"));
        // waiting-room entries carry no interval of their own, so
        // preemption has nothing to carry forward
        queue.core().force_preempt(false);
        Self::build(sim, name, queue, servers)
    }

    /// A server queue whose waiting room services entries by ascending
    /// priority key, ties in arrival order.
    pub fn priority(sim: &Simulation, name: impl Into<String>, servers: Vec<S>) -> Self {
        let name = name.into();
        let queue = TaskQueue::priority(sim, format!("{name}[queue]"));
        Self::build(sim, name, queue, servers)
    }

    fn build(sim: &Simulation, name: String, queue: TaskQueue, servers: Vec<S>) -> Self {
        let server_total = servers.len();
        if server_total == 0 {
            queue.core().force_freeze(true);
        }
        let idle = (0..server_total).collect();
        let slots = servers.into_iter().map(Some).collect();
        Self {
            core: Arc::new(ServerCore {
                sim: sim.clone(),
                name: name.into(),
                queue,
                pool: Mutex::new(Pool { slots, idle }),
                state: Mutex::new(SqState {
                    user_frozen: false,
                    deleting: false,
                    deleted: false,
                    waiting_for_last_server: false,
                    delete_policy: QueueDeletePolicy::default(),
                    can_freeze: true,
                }),
                observers: Mutex::new(Vec::new()),
                server_total,
            }),
        }
    }

    /// Queue a callable entry. Returns a cancelable handle, or `None` when
    /// the queue refuses new entries.
    pub fn add<C>(&self, callable: C, params: EntryParams) -> Option<SimEvent>
    where
        C: QueueCallable<S> + 'static,
    {
        if self.core.state.lock().expect(POISONED).deleting {
            return None;
        }
        let core = Arc::clone(&self.core);
        let request_interval = params.interval();
        let mut callable = callable;
        let assign = move || {
            let (idx, mut server) = core.take_idle();
            let total = request_interval + server.interval();
            core.sim.fire_server_selected(&core.name);
            let core2 = Arc::clone(&core);
            let service = move || {
                callable.interact_with(&mut server);
                core2.put_idle(idx, server);
                callable.complete();
            };
            core.sim.schedule_action(
                EventAction::Call(Box::new(service)),
                total,
                0.0,
                Some(Arc::clone(&core.name)),
            );
        };
        self.core.queue.add_call(assign, Self::waiting_params(params))
    }

    /// Queue a callable entry from a pair of closures: the server
    /// interaction and an optional completion step.
    pub fn add_fn<I, D>(&self, interact: I, done: D, params: EntryParams) -> Option<SimEvent>
    where
        I: FnOnce(&mut S) + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        struct FnCallable<I, D> {
            interact: Option<I>,
            done: Option<D>,
        }
        impl<S, I, D> QueueCallable<S> for FnCallable<I, D>
        where
            I: FnOnce(&mut S) + Send,
            D: FnOnce() + Send,
        {
            fn interact_with(&mut self, server: &mut S) {
                if let Some(interact) = self.interact.take() {
                    interact(server);
                }
            }
            fn complete(&mut self) {
                if let Some(done) = self.done.take() {
                    done();
                }
            }
        }
        self.add(
            FnCallable {
                interact: Some(interact),
                done: Some(done),
            },
            params,
        )
    }

    /// Queue an entry that runs as a task thread once served.
    pub fn add_task<R>(&self, runnable: R, params: EntryParams) -> Option<SimEvent>
    where
        R: QueueRunnable<S> + 'static,
    {
        if self.core.state.lock().expect(POISONED).deleting {
            return None;
        }
        let core = Arc::clone(&self.core);
        let request_interval = params.interval();
        let assign = move || {
            let (idx, mut server) = core.take_idle();
            let total = request_interval + server.interval();
            core.sim.fire_server_selected(&core.name);
            let core2 = Arc::clone(&core);
            let mut runnable = runnable;
            let body = move |ctx: &TaskContext| {
                runnable.interact_with(ctx, &mut server);
                core2.put_idle(idx, server);
                runnable.run(ctx);
            };
            core.sim.schedule_task(body, total);
        };
        self.core.queue.add_call(assign, Self::waiting_params(params))
    }

    /// Suspend the calling task until a server is free and the combined
    /// interval elapses, then run `interact` with the server before
    /// returning.
    ///
    /// Returns `false` when the entry could not be queued or was canceled
    /// while waiting; the task continues either way.
    pub fn add_current_task<H>(&self, ctx: &TaskContext, params: EntryParams, interact: H) -> bool
    where
        H: FnOnce(&mut S),
    {
        if self.core.state.lock().expect(POISONED).deleting {
            return false;
        }
        if !self
            .core
            .queue
            .add_current_task(ctx, Self::waiting_params(params))
        {
            return false;
        }
        self.serve_current(ctx, params, interact);
        true
    }

    /// As [`add_current_task`], additionally passing the cancelable entry
    /// handle to `on_event` before suspending.
    ///
    /// [`add_current_task`]: ServerQueue::add_current_task
    pub fn add_current_task_with<H, F>(
        &self,
        ctx: &TaskContext,
        params: EntryParams,
        interact: H,
        on_event: F,
    ) -> bool
    where
        H: FnOnce(&mut S),
        F: FnOnce(SimEvent),
    {
        if self.core.state.lock().expect(POISONED).deleting {
            return false;
        }
        if !self
            .core
            .queue
            .add_current_task_with(ctx, Self::waiting_params(params), on_event)
        {
            return false;
        }
        self.serve_current(ctx, params, interact);
        true
    }

    /// The server phase of a current-task entry, run on the task thread
    /// after the waiting room services it.
    fn serve_current<H>(&self, ctx: &TaskContext, params: EntryParams, interact: H)
    where
        H: FnOnce(&mut S),
    {
        let (idx, mut server) = self.core.take_idle();
        let total = params.interval() + server.interval();
        self.core.sim.fire_server_selected(&self.core.name);
        if total > 0 {
            ctx.pause(total);
        }
        interact(&mut server);
        self.core.put_idle(idx, server);
    }

    fn waiting_params(params: EntryParams) -> EntryParams {
        // the wait for a server is open-ended; the requested interval is
        // charged only once a server is claimed
        EntryParams::new(0)
            .priority(params.priority)
            .tie_priority(params.tpriority)
    }

    /// Whether this queue supports freezing.
    pub fn can_freeze(&self) -> bool {
        self.core.state.lock().expect(POISONED).can_freeze
    }

    /// Freeze or unfreeze the waiting room.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CannotFreeze`] when freezing is not supported.
    ///
    /// [`Error::CannotFreeze`]: crate::Error::CannotFreeze
    pub fn freeze(&self, value: bool) -> Result {
        if !self.can_freeze() {
            return Err(Error::CannotFreeze);
        }
        self.core.state.lock().expect(POISONED).user_frozen = value;
        let pool_has_idle = !self.core.pool.lock().expect(POISONED).idle.is_empty();
        if pool_has_idle {
            self.core.queue.core().force_freeze(value);
        }
        self.core.notify_observers();
        Ok(())
    }

    /// Whether the user has frozen the queue.
    pub fn is_frozen(&self) -> bool {
        QueueStatus::is_frozen(&*self.core)
    }

    /// Waiting entries plus any dequeued entry still in service.
    pub fn size(&self) -> usize {
        QueueStatus::size(&*self.core)
    }

    /// Whether every server is busy.
    pub fn is_busy(&self) -> bool {
        QueueStatus::is_busy(&*self.core)
    }

    /// The number of servers currently bound to entries.
    pub fn in_use_count(&self) -> usize {
        QueueStatus::in_use_count(&*self.core)
    }

    /// The number of servers this queue owns.
    pub fn server_count(&self) -> usize {
        self.core.server_total
    }

    /// The current delete policy.
    pub fn delete_policy(&self) -> QueueDeletePolicy {
        self.core.state.lock().expect(POISONED).delete_policy
    }

    /// Set the delete policy for this queue and its waiting room. Ignored
    /// once deletion has begun.
    pub fn set_delete_policy(&self, policy: QueueDeletePolicy) {
        let mut st = self.core.state.lock().expect(POISONED);
        if !st.deleting {
            st.delete_policy = policy;
            drop(st);
            self.core.queue.set_delete_policy(policy);
        }
    }

    /// Delete the queue; under `WhenEmpty` the deletion completes once the
    /// waiting room drains and the last busy server returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CannotDelete`] when the delete policy forbids it.
    ///
    /// [`Error::CannotDelete`]: crate::Error::CannotDelete
    pub fn delete(&self) -> Result {
        {
            let st = self.core.state.lock().expect(POISONED);
            if st.deleting || st.deleted {
                return Ok(());
            }
            let allowed = match st.delete_policy {
                QueueDeletePolicy::MustBeEmpty => {
                    QueueStatus::size(&*self.core) == 0 && self.core.in_use() == 0
                }
                QueueDeletePolicy::WhenEmpty => true,
                QueueDeletePolicy::Never => false,
            };
            if !allowed {
                return Err(Error::CannotDelete);
            }
        }
        if self.can_freeze() {
            // a deleting queue must drain, so any user freeze is lifted
            let _ = self.freeze(false);
        }
        self.core.state.lock().expect(POISONED).deleting = true;
        self.core.queue.add_observer(Arc::new(DeleteWatcher {
            core: Arc::downgrade(&self.core),
        }));
        self.core.queue.delete()
    }

    /// Whether deletion has completed.
    pub fn is_deleted(&self) -> bool {
        QueueStatus::is_deleted(&*self.core)
    }

    /// Register an observer notified on busy/size/frozen/deleted changes.
    pub fn add_observer(&self, observer: Arc<dyn QueueObserver>) {
        if self.core.state.lock().expect(POISONED).deleting {
            return;
        }
        self.core.observers.lock().expect(POISONED).push(observer);
    }

    /// Remove a previously registered observer.
    pub fn remove_observer(&self, observer: &Arc<dyn QueueObserver>) -> bool {
        let mut observers = self.core.observers.lock().expect(POISONED);
        match observers.iter().position(|o| Arc::ptr_eq(o, observer)) {
            Some(idx) => {
                observers.remove(idx);
                true
            }
            None => false,
        }
    }
}

impl<S: QueueServer> QueueStatus for ServerQueue<S> {
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
        self.core.server_total
    }
}

impl<S: QueueServer> SimObject for ServerQueue<S> {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn print_configuration(&self, prefix: &str, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "{prefix}number of servers: {}", self.server_count())?;
        writeln!(out, "{prefix}deletion policy: {:?}", self.delete_policy())?;
        writeln!(out, "{prefix}can freeze: {}", self.can_freeze())?;
        writeln!(out, "{prefix}waiting room:")?;
        let deeper = format!("{prefix}  ");
        self.core.queue.print_configuration(&deeper, out)
    }

    fn print_state(&self, prefix: &str, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "{prefix}queue size: {}", self.size())?;
        writeln!(out, "{prefix}frozen: {}", self.is_frozen())?;
        writeln!(out, "{prefix}busy: {}", self.is_busy())?;
        writeln!(out, "{prefix}number being serviced: {}", self.in_use_count())?;
        writeln!(out, "{prefix}waiting room:")?;
        let deeper = format!("{prefix}  ");
        self.core.queue.print_state(&deeper, out)
    }
}

impl<S: QueueServer> std::fmt::Debug for ServerQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerQueue")
            .field("name", &&*self.core.name)
            .field("servers", &self.server_count())
            .field("in_use", &self.in_use_count())
            .field("size", &self.size())
            .finish()
    }
}
