//! # Overview
//!
//! quesim is a discrete-event simulation engine with a cooperative
//! task-thread facility and a family of queueing abstractions layered on
//! top:
//!
//! * The [`Simulation`] owns a logical clock and a priority-ordered event
//!   queue. Events execute one at a time in ascending (time, tie-priority)
//!   order, with exact ties processed in scheduling order, so every run of
//!   the same model is deterministic.
//! * A *task thread* ([`Task`], [`TaskContext`]) is ordinary blocking-style
//!   code on its own OS thread, coordinated with the scheduler so that at
//!   most one logical thread of control executes application code at any
//!   instant. Tasks suspend in simulated time ([`TaskContext::pause`], or
//!   by waiting on a queue) and resume exactly where they left off, with
//!   no locking required in model code and no real concurrency hazards.
//! * A [`TaskQueue`] times pending work against a single resource under a
//!   FIFO, LIFO, or priority [`Discipline`], with freeze/release gating,
//!   delete policies, and (for LIFO and priority order) preemption that
//!   carries a displaced entry's remaining wait forward.
//! * A [`ServerQueue`] models a set of servers fed from a discipline-ordered
//!   waiting room; a [`ProcessClock`] models preemptible exclusive
//!   consumption of a single timed resource.
//!
//! Scheduling never travels backwards: relative delays are unsigned and
//! absolute times earlier than [`Simulation::current_ticks`] are rejected
//! with [`Error::BackInTime`]. Cancellation is a first-class outcome rather
//! than an error: [`SimEvent::cancel`] reports whether the cancellation won
//! the race, and losing is always safe.
//!
//! # Observability
//!
//! Queues notify registered [`QueueObserver`]s whenever their observable
//! state changes, and a [`SimulationListener`] receives task, call, and
//! queue lifecycle transitions. Every hook is also emitted as a [`tracing`]
//! event at trace level, so a subscriber can watch a run without any
//! listener wiring. Named objects describe themselves through
//! [`SimObject::print_configuration`] and [`SimObject::print_state`].
//!
//! [`TaskContext::pause`]: TaskContext::pause
//! [`Error::BackInTime`]: Error::BackInTime
//! [`SimEvent::cancel`]: SimEvent::cancel
//! [`SimObject::print_configuration`]: SimObject::print_configuration
//! [`SimObject::print_state`]: SimObject::print_state

mod clock;
mod error;
mod event;
mod object;
mod queue;
mod server;
mod simulation;
mod task;

pub use clock::ProcessClock;
pub use error::{Error, Result};
pub use event::{SimEvent, Ticks};
pub use object::{QueueObserver, QueueStatus, SimObject};
pub use queue::{Discipline, EntryParams, QueueDeletePolicy, ReleasePolicy, TaskQueue};
pub use server::{QueueCallable, QueueRunnable, QueueServer, ServerQueue};
pub use simulation::{Simulation, SimulationListener, SimulationMonitor};
pub use task::{Task, TaskContext};
