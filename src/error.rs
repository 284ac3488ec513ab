use crate::Ticks;

/// Errors that may be encountered while configuring or running a simulation.
///
/// The [`BackInTime`] variant originates from the scheduling interface of
/// [`Simulation`] to indicate that an event's requested execution time is
/// prior to the simulation's current time. This error likely corresponds to a
/// logical bug on the client side, e.g. forgetting to add an offset to the
/// current time when scheduling a new event.
///
/// The remaining variants report misuse of the queue configuration surface:
/// freezing a queue that cannot be frozen, releasing entries from a queue
/// without release support, and so on. All of them are returned synchronously
/// from the offending call with no partial side effects.
///
/// Cancellation is deliberately *not* represented here: canceling an event
/// that has already run (or has already been canceled) returns `false` from
/// [`SimEvent::cancel()`] rather than producing an error, since losing a
/// cancellation race is an ordinary outcome in a discrete-event simulation.
///
/// [`BackInTime`]: Error::BackInTime
/// [`Simulation`]: crate::Simulation
/// [`SimEvent::cancel()`]: crate::SimEvent::cancel
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The scheduler rejected an event that would have executed at a time
    /// that has already passed.
    #[error("event time {requested} precedes current simulation time {now}")]
    BackInTime {
        /// The execution time the caller asked for.
        requested: Ticks,
        /// The simulation time at the moment of the call.
        now: Ticks,
    },
    /// [`freeze()`] was called on a queue whose configuration does not permit
    /// freezing.
    ///
    /// [`freeze()`]: crate::TaskQueue::freeze
    #[error("queue does not support freezing")]
    CannotFreeze,
    /// A release operation was requested on a queue without release support.
    #[error("queue does not support release operations")]
    CannotRelease,
    /// [`preempt()`] was called on a queue whose discipline does not support
    /// preemption.
    ///
    /// [`preempt()`]: crate::TaskQueue::preempt
    #[error("queue discipline does not support preemption")]
    CannotPreempt,
    /// The release policy cannot be changed while a release is in progress.
    #[error("a release operation is in progress")]
    ReleaseInProgress,
    /// An operation reserved for a queue's currently serviced task was called
    /// from some other context.
    #[error("current task is not the queue's active task")]
    NotCurrentTask,
    /// `run()` was called while the simulation was already running.
    #[error("simulation is already running")]
    AlreadyRunning,
    /// The queue's delete policy forbids deletion in its current state.
    #[error("queue cannot be deleted in its current state")]
    CannotDelete,
}

/// [`std::result::Result`]`<T, `[`quesim::Error`]`>`
///
/// A type alias that simplifies the signatures of various functions in
/// quesim.
///
/// [`quesim::Error`]: Error
pub type Result<T = ()> = std::result::Result<T, Error>;
