use std::io;

/// A named simulation object that can describe itself.
///
/// The two print methods produce indented human-readable text: every line is
/// prefixed with `prefix`, and objects that own other objects (a server
/// queue and its waiting room, a process clock and its queue) recurse with a
/// deeper prefix. The output is meant for people, not parsers; only the
/// nesting structure is guaranteed.
pub trait SimObject {
    /// The object's name, used in diagnostics and trace attribution.
    fn name(&self) -> &str;

    /// Write the object's configuration (the settings that do not change as
    /// the simulation runs), one `prefix`-indented line per item.
    fn print_configuration(&self, prefix: &str, out: &mut dyn io::Write) -> io::Result<()>;

    /// Write the object's current state, one `prefix`-indented line per
    /// item.
    fn print_state(&self, prefix: &str, out: &mut dyn io::Write) -> io::Result<()>;
}

/// Status snapshot offered to queue observers.
///
/// Implemented by every queue-like object in the crate. Observers receive a
/// reference to the changed object through this trait rather than a concrete
/// type so one observer can watch queues of different kinds.
pub trait QueueStatus: Send + Sync {
    /// The queue's name.
    fn name(&self) -> &str;
    /// Waiting entries, excluding any being timed or served.
    fn size(&self) -> usize;
    /// Whether any entry is being timed or served.
    fn is_busy(&self) -> bool;
    /// Whether the queue is frozen.
    fn is_frozen(&self) -> bool;
    /// Whether the queue has been deleted.
    fn is_deleted(&self) -> bool;
    /// Entries currently bound to a server (or being timed).
    fn in_use_count(&self) -> usize;
    /// The maximum number of entries handled concurrently.
    fn server_count(&self) -> usize;
}

/// Observer of queue state changes.
///
/// Registered with [`add_observer`]; called with the queue itself whenever
/// its busy/size/frozen/deleted state may have changed. Callbacks run on
/// whichever logical thread performed the change, which under the handoff
/// protocol is never concurrent with other application code.
///
/// [`add_observer`]: crate::TaskQueue::add_observer
pub trait QueueObserver: Send + Sync {
    /// The queue's observable state may have changed.
    fn on_queue_change(&self, queue: &dyn QueueStatus);
}
