use quesim::{EntryParams, QueueDeletePolicy, ReleasePolicy, SimEvent, Simulation, TaskQueue};
use std::sync::{Arc, Mutex};

type Log<T> = Arc<Mutex<Vec<T>>>;

fn log<T>() -> Log<T> {
    Arc::new(Mutex::new(Vec::new()))
}

/// Queue a callable that records the tick at which it was serviced.
fn record_completion(queue: &TaskQueue, sim: &Simulation, out: &Log<(&'static str, u64)>, tag: &'static str, params: EntryParams) -> SimEvent {
    let out = Arc::clone(out);
    let sim = sim.clone();
    queue
        .add_call(move || out.lock().unwrap().push((tag, sim.current_ticks())), params)
        .expect("queue accepts entries")
}

#[test]
fn fifo_services_one_entry_at_a_time() {
    let sim = Simulation::new();
    let queue = TaskQueue::fifo(&sim, "fifo");
    let out = log();
    record_completion(&queue, &sim, &out, "a", EntryParams::new(10));
    record_completion(&queue, &sim, &out, "b", EntryParams::new(20));
    assert_eq!(queue.size(), 1, "scheduled entry is not counted");
    assert!(queue.is_busy());
    sim.run().unwrap();
    assert_eq!(*out.lock().unwrap(), vec![("a", 10), ("b", 30)]);
    assert_eq!(queue.size(), 0);
    assert!(!queue.is_busy());
}

#[test]
fn lifo_preempts_the_scheduled_entry() {
    let sim = Simulation::new();
    let queue = TaskQueue::lifo(&sim, "lifo");
    let out = log();
    // entry A starts its 10-tick wait at time 0
    record_completion(&queue, &sim, &out, "a", EntryParams::new(10));
    {
        let queue = queue.clone();
        let sim2 = sim.clone();
        let out = Arc::clone(&out);
        sim.schedule_call(
            move || {
                record_completion(&queue, &sim2, &out, "b", EntryParams::new(2));
            },
            3,
        );
    }
    sim.run().unwrap();
    // B jumps in at time 3 and completes at 5; A keeps the 3 ticks it
    // already waited, so its remaining 7 run from 5 to 12
    assert_eq!(*out.lock().unwrap(), vec![("b", 5), ("a", 12)]);
}

#[test]
fn lifo_preemption_clamps_remaining_to_zero() {
    let sim = Simulation::new();
    let queue = TaskQueue::lifo(&sim, "lifo");
    let out = log();
    record_completion(&queue, &sim, &out, "a", EntryParams::new(10));
    for (delay, tag) in [(3u64, "b"), (12, "c")] {
        let queue = queue.clone();
        let sim2 = sim.clone();
        let out = Arc::clone(&out);
        sim.schedule_call(
            move || {
                record_completion(&queue, &sim2, &out, tag, EntryParams::new(2));
            },
            delay,
        );
    }
    sim.run().unwrap();
    // after B, A is rescheduled at 5 with 7 remaining, due at 12; C's add at
    // 12 runs ahead of A's event and preempts with nothing left, so A comes
    // back at the front with a zero-tick wait and completes right after C
    assert_eq!(*out.lock().unwrap(), vec![("b", 5), ("c", 14), ("a", 14)]);
}

#[test]
fn priority_order_does_not_preempt_by_default() {
    let sim = Simulation::new();
    let queue = TaskQueue::priority(&sim, "prio");
    let out = log();
    record_completion(&queue, &sim, &out, "slow", EntryParams::new(10).priority(5));
    record_completion(&queue, &sim, &out, "low", EntryParams::new(1).priority(9));
    record_completion(&queue, &sim, &out, "high", EntryParams::new(1).priority(0));
    sim.run().unwrap();
    // "slow" keeps its slot; the waiting entries order by priority
    assert_eq!(
        *out.lock().unwrap(),
        vec![("slow", 10), ("high", 11), ("low", 12)]
    );
}

#[test]
fn wait_queue_holds_entries_until_released() {
    let sim = Simulation::new();
    let queue = TaskQueue::wait(&sim, "waitq");
    let out = log();
    for tag in ["a", "b", "c", "d", "e"] {
        record_completion(&queue, &sim, &out, tag, EntryParams::new(0));
    }
    assert_eq!(queue.size(), 5);
    assert!(!queue.is_busy());
    assert_eq!(queue.in_use_count(), 0);
    sim.run().unwrap();
    assert!(out.lock().unwrap().is_empty(), "frozen queue released nothing");

    queue.release_up_to(2).unwrap();
    sim.run().unwrap();
    assert_eq!(*out.lock().unwrap(), vec![("a", 0), ("b", 0)]);
    assert_eq!(queue.size(), 3);

    queue.freeze(false).unwrap();
    sim.run().unwrap();
    assert_eq!(queue.size(), 0);
    assert_eq!(out.lock().unwrap().len(), 5);
}

#[test]
fn release_credit_outlives_an_empty_queue() {
    let sim = Simulation::new();
    let queue = TaskQueue::wait(&sim, "waitq");
    queue.release(2).unwrap();
    let out = log();
    record_completion(&queue, &sim, &out, "a", EntryParams::new(4));
    record_completion(&queue, &sim, &out, "b", EntryParams::new(4));
    record_completion(&queue, &sim, &out, "c", EntryParams::new(4));
    sim.run().unwrap();
    // with credit outstanding and the queue idle, a is admitted directly
    // without consuming it; the two credits then admit b and c
    assert_eq!(*out.lock().unwrap(), vec![("a", 4), ("b", 8), ("c", 12)]);
    assert_eq!(queue.size(), 0);
}

#[test]
fn canceling_a_waiting_entry_removes_it() {
    let sim = Simulation::new();
    let queue = TaskQueue::fifo(&sim, "fifo");
    let out = log();
    record_completion(&queue, &sim, &out, "a", EntryParams::new(5));
    let victim = record_completion(&queue, &sim, &out, "b", EntryParams::new(5));
    record_completion(&queue, &sim, &out, "c", EntryParams::new(5));
    assert!(victim.cancel());
    assert!(!victim.cancel());
    sim.run().unwrap();
    assert_eq!(*out.lock().unwrap(), vec![("a", 5), ("c", 10)]);
}

#[test]
fn canceling_the_scheduled_entry_promotes_the_next() {
    let sim = Simulation::new();
    let queue = TaskQueue::fifo(&sim, "fifo");
    let out = log();
    let victim = record_completion(&queue, &sim, &out, "a", EntryParams::new(10));
    record_completion(&queue, &sim, &out, "b", EntryParams::new(5));
    assert!(victim.cancel());
    sim.run().unwrap();
    assert_eq!(*out.lock().unwrap(), vec![("b", 5)]);
}

#[test]
fn release_policies_treat_cancellations_differently() {
    for (policy, expect_last) in [
        (ReleasePolicy::CancelsIgnored, true),
        (ReleasePolicy::CancelsAsReleased, false),
    ] {
        let sim = Simulation::new();
        let queue = TaskQueue::wait(&sim, "waitq");
        queue.set_release_policy(policy).unwrap();
        let out = log();
        record_completion(&queue, &sim, &out, "a", EntryParams::new(1));
        let victim = record_completion(&queue, &sim, &out, "b", EntryParams::new(1));
        record_completion(&queue, &sim, &out, "c", EntryParams::new(1));
        queue.release(2).unwrap();
        assert!(victim.cancel());
        sim.run().unwrap();
        let serviced = out.lock().unwrap().clone();
        if expect_last {
            // the cancellation does not consume a release slot
            assert_eq!(serviced, vec![("a", 1), ("c", 2)]);
        } else {
            // the cancellation counts as one of the two released entries
            assert_eq!(serviced, vec![("a", 1)]);
        }
    }
}

#[test]
fn current_task_waits_on_the_queue() {
    let sim = Simulation::new();
    let queue = TaskQueue::fifo(&sim, "fifo");
    let out: Log<(&str, u64, bool)> = log();
    {
        let queue = queue.clone();
        let out = Arc::clone(&out);
        sim.schedule_task(
            move |ctx| {
                let ok = queue.add_current_task(ctx, EntryParams::new(10));
                out.lock()
                    .unwrap()
                    .push(("task", ctx.simulation().current_ticks(), ok));
            },
            2,
        );
    }
    sim.run().unwrap();
    assert_eq!(*out.lock().unwrap(), vec![("task", 12, true)]);
}

#[test]
fn canceling_a_queued_task_entry_resumes_it_with_failure() {
    let sim = Simulation::new();
    let queue = TaskQueue::wait(&sim, "waitq");
    let out: Log<(&str, u64, bool)> = log();
    let stored: Arc<Mutex<Option<SimEvent>>> = Arc::new(Mutex::new(None));
    {
        let queue = queue.clone();
        let out = Arc::clone(&out);
        let stored = Arc::clone(&stored);
        sim.schedule_task(
            move |ctx| {
                let ok = queue.add_current_task_with(ctx, EntryParams::new(0), |event| {
                    *stored.lock().unwrap() = Some(event);
                });
                out.lock()
                    .unwrap()
                    .push(("task", ctx.simulation().current_ticks(), ok));
            },
            0,
        );
    }
    {
        let stored = Arc::clone(&stored);
        sim.schedule_call(
            move || {
                let event = stored.lock().unwrap().take().expect("event was stored");
                assert!(event.cancel());
            },
            5,
        );
    }
    sim.run().unwrap();
    assert_eq!(*out.lock().unwrap(), vec![("task", 5, false)]);
    assert_eq!(queue.size(), 0);
}

#[test]
fn pause_current_task_holds_the_queue_slot() {
    let sim = Simulation::new();
    let queue = TaskQueue::fifo(&sim, "fifo");
    let out: Log<(&str, u64)> = log();
    {
        let queue2 = queue.clone();
        let out = Arc::clone(&out);
        queue
            .add_task(
                move |ctx| {
                    out.lock()
                        .unwrap()
                        .push(("task", ctx.simulation().current_ticks()));
                    queue2.pause_current_task(ctx, 5).unwrap();
                    out.lock()
                        .unwrap()
                        .push(("task", ctx.simulation().current_ticks()));
                },
                EntryParams::new(2),
            )
            .unwrap();
    }
    record_completion(&queue, &sim, &out, "next", EntryParams::new(3));
    sim.run().unwrap();
    // the queued callable waits out both the task's service and its pause
    assert_eq!(
        *out.lock().unwrap(),
        vec![("task", 2), ("task", 7), ("next", 10)]
    );
}

#[test]
fn pause_current_task_rejects_other_contexts() {
    let sim = Simulation::new();
    let queue = TaskQueue::fifo(&sim, "fifo");
    let outcome: Log<bool> = log();
    {
        let queue = queue.clone();
        let outcome = Arc::clone(&outcome);
        sim.schedule_task(
            move |ctx| {
                outcome
                    .lock()
                    .unwrap()
                    .push(queue.pause_current_task(ctx, 5).is_err());
            },
            0,
        );
    }
    sim.run().unwrap();
    assert_eq!(*outcome.lock().unwrap(), vec![true]);
}

#[test]
fn delete_policies_gate_deletion() {
    let sim = Simulation::new();
    let queue = TaskQueue::fifo(&sim, "fifo");
    let out = log();
    record_completion(&queue, &sim, &out, "a", EntryParams::new(5));

    queue.set_delete_policy(QueueDeletePolicy::Never);
    assert!(queue.delete().is_err());

    queue.set_delete_policy(QueueDeletePolicy::MustBeEmpty);
    assert!(queue.delete().is_err(), "busy queue is not empty");

    queue.set_delete_policy(QueueDeletePolicy::WhenEmpty);
    queue.delete().unwrap();
    assert!(!queue.is_deleted(), "deletion waits for the queue to drain");
    assert!(
        record_completion_is_refused(&queue),
        "a deleting queue refuses new entries"
    );
    sim.run().unwrap();
    assert!(queue.is_deleted());
    assert_eq!(*out.lock().unwrap(), vec![("a", 5)]);
}

fn record_completion_is_refused(queue: &TaskQueue) -> bool {
    queue.add_call(|| {}, EntryParams::new(1)).is_none()
}

#[test]
fn queue_diagnostics_render_nested_state() {
    let sim = Simulation::new();
    let queue = TaskQueue::lifo(&sim, "jobs");
    queue.add_call(|| {}, EntryParams::new(3)).unwrap();
    let mut config = Vec::new();
    let mut state = Vec::new();
    use quesim::SimObject;
    queue.print_configuration("  ", &mut config).unwrap();
    queue.print_state("  ", &mut state).unwrap();
    let config = String::from_utf8(config).unwrap();
    let state = String::from_utf8(state).unwrap();
    assert!(config.contains("discipline: Lifo"));
    assert!(config.lines().all(|line| line.starts_with("  ")));
    assert!(state.contains("busy: true"));
    assert!(state.lines().all(|line| line.starts_with("  ")));
}
