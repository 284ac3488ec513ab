use quesim::{EntryParams, ProcessClock, QueueServer, ServerQueue, Simulation, Ticks};
use std::sync::{Arc, Mutex};

type Log<T> = Arc<Mutex<Vec<T>>>;

fn log<T>() -> Log<T> {
    Arc::new(Mutex::new(Vec::new()))
}

struct Clerk {
    setup: Ticks,
    served: usize,
}

impl Clerk {
    fn new(setup: Ticks) -> Self {
        Self { setup, served: 0 }
    }
}

impl QueueServer for Clerk {
    fn interval(&self) -> Ticks {
        self.setup
    }
}

/// Push an entry that records its completion tick.
fn push_entry(
    queue: &ServerQueue<Clerk>,
    sim: &Simulation,
    out: &Log<(&'static str, u64)>,
    tag: &'static str,
    params: EntryParams,
) {
    let out = Arc::clone(out);
    let sim = sim.clone();
    queue
        .add_fn(
            |clerk: &mut Clerk| clerk.served += 1,
            move || out.lock().unwrap().push((tag, sim.current_ticks())),
            params,
        )
        .expect("queue accepts entries");
}

#[test]
fn single_server_serializes_service() {
    let sim = Simulation::new();
    let queue = ServerQueue::fifo(&sim, "counter", vec![Clerk::new(0)]);
    let out = log();
    for tag in ["a", "b", "c"] {
        push_entry(&queue, &sim, &out, tag, EntryParams::new(4));
    }
    sim.run().unwrap();
    assert_eq!(*out.lock().unwrap(), vec![("a", 4), ("b", 8), ("c", 12)]);
    assert_eq!(queue.in_use_count(), 0);
    assert_eq!(queue.size(), 0);
}

#[test]
fn the_server_interval_extends_service() {
    let sim = Simulation::new();
    let queue = ServerQueue::fifo(&sim, "counter", vec![Clerk::new(2)]);
    let out = log();
    push_entry(&queue, &sim, &out, "a", EntryParams::new(3));
    sim.run().unwrap();
    assert_eq!(*out.lock().unwrap(), vec![("a", 5)]);
}

#[test]
fn servers_are_never_double_booked() {
    let sim = Simulation::new();
    let queue = ServerQueue::fifo(&sim, "counter", vec![Clerk::new(0), Clerk::new(0)]);
    let out = log();
    let peak = Arc::new(Mutex::new(0usize));
    for tag in ["a", "b", "c", "d", "e"] {
        let out2 = Arc::clone(&out);
        let sim2 = sim.clone();
        let peak2 = Arc::clone(&peak);
        let queue2 = queue.clone();
        queue
            .add_fn(
                move |clerk: &mut Clerk| {
                    clerk.served += 1;
                    let in_use = queue2.in_use_count();
                    assert!(in_use <= queue2.server_count());
                    let mut peak = peak2.lock().unwrap();
                    *peak = (*peak).max(in_use);
                },
                move || out2.lock().unwrap().push((tag, sim2.current_ticks())),
                EntryParams::new(3),
            )
            .unwrap();
    }
    sim.run().unwrap();
    assert_eq!(
        *out.lock().unwrap(),
        vec![("a", 3), ("b", 3), ("c", 6), ("d", 6), ("e", 9)]
    );
    assert_eq!(*peak.lock().unwrap(), 2);
}

#[test]
fn priority_server_queue_orders_the_waiting_room() {
    let sim = Simulation::new();
    let queue = ServerQueue::priority(&sim, "triage", vec![Clerk::new(0)]);
    let out = log();
    // occupy the server, then queue three entries in mixed priority order
    push_entry(&queue, &sim, &out, "first", EntryParams::new(5).priority(9));
    push_entry(&queue, &sim, &out, "mid", EntryParams::new(1).priority(3));
    push_entry(&queue, &sim, &out, "urgent", EntryParams::new(1).priority(1));
    push_entry(&queue, &sim, &out, "routine", EntryParams::new(1).priority(8));
    sim.run().unwrap();
    assert_eq!(
        *out.lock().unwrap(),
        vec![("first", 5), ("urgent", 6), ("mid", 7), ("routine", 8)]
    );
}

#[test]
fn tasks_wait_for_a_server_and_interact_with_it() {
    let sim = Simulation::new();
    let queue = ServerQueue::fifo(&sim, "counter", vec![Clerk::new(2)]);
    let out: Log<(&str, u64, bool)> = log();
    {
        let queue = queue.clone();
        let out = Arc::clone(&out);
        sim.schedule_task(
            move |ctx| {
                let ok = queue.add_current_task(ctx, EntryParams::new(3), |clerk| {
                    clerk.served += 1;
                });
                out.lock()
                    .unwrap()
                    .push(("task", ctx.simulation().current_ticks(), ok));
            },
            1,
        );
    }
    sim.run().unwrap();
    // queued at 1, served for 3 + 2 setup
    assert_eq!(*out.lock().unwrap(), vec![("task", 6, true)]);
    assert_eq!(queue.in_use_count(), 0);
}

#[test]
fn a_busy_queue_makes_tasks_wait_their_turn() {
    let sim = Simulation::new();
    let queue = ServerQueue::fifo(&sim, "counter", vec![Clerk::new(0)]);
    let out: Log<(&str, u64)> = log();
    push_entry(&queue, &sim, &out, "walk-in", EntryParams::new(10));
    {
        let queue = queue.clone();
        let out = Arc::clone(&out);
        sim.schedule_task(
            move |ctx| {
                assert!(queue.add_current_task(ctx, EntryParams::new(4), |_| {}));
                out.lock()
                    .unwrap()
                    .push(("task", ctx.simulation().current_ticks()));
            },
            2,
        );
    }
    sim.run().unwrap();
    assert_eq!(*out.lock().unwrap(), vec![("walk-in", 10), ("task", 14)]);
}

#[test]
fn empty_server_sets_freeze_the_waiting_room() {
    let sim = Simulation::new();
    let queue: ServerQueue<Clerk> = ServerQueue::fifo(&sim, "unstaffed", Vec::new());
    let out = log();
    push_entry(&queue, &sim, &out, "stuck", EntryParams::new(1));
    sim.run().unwrap();
    assert!(out.lock().unwrap().is_empty());
    assert_eq!(queue.size(), 1);
}

#[test]
fn process_clock_preempts_pending_requests_only() {
    let sim = Simulation::new();
    let clock = ProcessClock::new(&sim, "cpu");
    let out: Log<(&str, u64)> = log();
    {
        let out = Arc::clone(&out);
        let sim2 = sim.clone();
        clock
            .advance_call(
                move || out.lock().unwrap().push(("batch", sim2.current_ticks())),
                5,
                10,
            )
            .unwrap();
    }
    {
        let clock2 = clock.clone();
        let out = Arc::clone(&out);
        let sim2 = sim.clone();
        sim.schedule_call(
            move || {
                let out2 = Arc::clone(&out);
                let sim3 = sim2.clone();
                clock2
                    .advance_call(
                        move || out2.lock().unwrap().push(("urgent", sim3.current_ticks())),
                        1,
                        2,
                    )
                    .unwrap();
            },
            3,
        );
    }
    sim.run().unwrap();
    // the urgent request displaces the batch request mid-consumption; the
    // batch keeps its 3 consumed ticks and finishes its remaining 7 after
    assert_eq!(*out.lock().unwrap(), vec![("urgent", 5), ("batch", 12)]);
}

#[test]
fn process_clock_never_preempts_a_request_in_service() {
    let sim = Simulation::new();
    let clock = ProcessClock::new(&sim, "cpu");
    let out: Log<(&str, u64)> = log();
    {
        let clock2 = clock.clone();
        let out2 = Arc::clone(&out);
        let sim2 = sim.clone();
        clock
            .advance_call(
                move || {
                    // the running request queues a more urgent one; being
                    // already dequeued, it must not be re-run or displaced
                    out2.lock().unwrap().push(("running", sim2.current_ticks()));
                    let out3 = Arc::clone(&out2);
                    let sim3 = sim2.clone();
                    clock2
                        .advance_call(
                            move || out3.lock().unwrap().push(("urgent", sim3.current_ticks())),
                            0,
                            2,
                        )
                        .unwrap();
                },
                5,
                4,
            )
            .unwrap();
    }
    sim.run().unwrap();
    assert_eq!(*out.lock().unwrap(), vec![("running", 4), ("urgent", 6)]);
}

#[test]
fn blocking_clock_requests_serialize_consumption() {
    let sim = Simulation::new();
    let clock = ProcessClock::new(&sim, "cpu");
    let out: Log<(&str, u64)> = log();
    for (tag, priority, interval, start) in
        [("lo", 5, 6u64, 0u64), ("hi", 1, 2, 1)]
    {
        let clock = clock.clone();
        let out = Arc::clone(&out);
        sim.schedule_task(
            move |ctx| {
                assert!(clock.advance(ctx, priority, interval));
                out.lock()
                    .unwrap()
                    .push((tag, ctx.simulation().current_ticks()));
            },
            start,
        );
    }
    sim.run().unwrap();
    // "hi" arrives at 1 and displaces "lo" (one tick consumed, five left)
    assert_eq!(*out.lock().unwrap(), vec![("hi", 3), ("lo", 8)]);
}
