use inferno::time::FixedRate;
use inferno::{task, Repository, RepositoryConfig, Scheduler, SchedulerConfig, SchedulerState};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq)]
struct Ticks(u32);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn scheduler() -> Scheduler {
    init_tracing();
    Scheduler::new(SchedulerConfig::default().with_worker_threads(2)).unwrap()
}

#[test]
fn test_fixed_rate_period() {
    assert!(FixedRate::new(0).is_none());
    let rate = FixedRate::new(10).unwrap();
    assert_eq!(rate.ups(), 10);
    assert_eq!(rate.period(), Duration::from_millis(100));
}

#[test]
fn test_run_at_rate_then_stop() {
    let scheduler = scheduler();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);
    scheduler.add_stage(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(scheduler.run_at_rate(10));
    assert!(scheduler.is_ticking());
    // Same rate again leaves the schedule alone
    assert!(scheduler.run_at_rate(10));
    thread::sleep(Duration::from_millis(1_000));

    assert!(scheduler.run_at_rate(0));
    assert!(!scheduler.is_ticking());
    let observed = runs.load(Ordering::SeqCst);
    assert!((5..=15).contains(&observed), "ran {observed} times");

    thread::sleep(Duration::from_millis(300));
    assert_eq!(runs.load(Ordering::SeqCst), observed);
    assert_eq!(scheduler.state(), SchedulerState::Scheduled);
}

#[test]
fn test_changing_rate_replaces_schedule() {
    let scheduler = scheduler();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);
    scheduler.add_stage(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(scheduler.run_at_rate(2));
    assert!(scheduler.run_at_rate(50));
    thread::sleep(Duration::from_millis(500));
    assert!(scheduler.run_at_rate(0));
    // A 2 ups schedule alone would have managed at most two passes
    assert!(runs.load(Ordering::SeqCst) > 5);
}

#[test]
fn test_disabled_task_skipped_while_ticking() {
    let scheduler = scheduler();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);
    let id = scheduler.add_stage(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(scheduler.disable(id));
    assert!(scheduler.run_at_rate(100));
    thread::sleep(Duration::from_millis(200));
    assert!(scheduler.run_at_rate(0));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(scheduler.frame_count() > 0);

    assert!(scheduler.enable(id));
    assert!(scheduler.run_once());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_parallel_stage_sees_previous_stage() {
    let scheduler = scheduler();
    let log = Arc::new(Mutex::new(Vec::new()));

    let first = Arc::clone(&log);
    scheduler.add_stage(move |_| first.lock().unwrap().push("setup"));
    let tasks = (0..3).map(|_| {
        let log = Arc::clone(&log);
        task(move |_| {
            let mut log = log.lock().unwrap();
            assert_eq!(log.first(), Some(&"setup"));
            log.push("work");
        })
    });
    assert_eq!(scheduler.add_parallel_stage(tasks).len(), 3);
    let last = Arc::clone(&log);
    scheduler.add_stage(move |_| last.lock().unwrap().push("teardown"));

    assert!(scheduler.run_once());
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 5);
    assert_eq!(log.last(), Some(&"teardown"));
}

#[test]
fn test_task_fork_join_uses_worker_pool() {
    let scheduler = Arc::new(scheduler());
    let sums = Arc::new(Mutex::new(Vec::new()));
    let handle = Arc::clone(&scheduler);
    let out = Arc::clone(&sums);
    scheduler.add_stage(move |ctx| {
        assert!(handle.is_scheduler_thread());
        let parts = ctx.fork_join_all((0..4u64).map(|i| move || i * 10).collect());
        let total = handle.fork_join(|| parts.iter().sum::<u64>()).unwrap();
        out.lock().unwrap().push(total);
    });

    assert!(scheduler.run_once());
    assert!(!scheduler.is_scheduler_thread());
    assert!(scheduler.fork_join(|| 1).is_err());
    assert_eq!(*sums.lock().unwrap(), vec![60]);
    assert!(scheduler.shutdown());
}

#[test]
fn test_repository_update_at_rate() {
    init_tracing();
    let repo = Repository::new(RepositoryConfig::new("ticking")).unwrap();
    let entity = repo.create((Ticks(0),)).unwrap();
    let scheduler = repo.create_scheduler().unwrap();
    let world = repo.clone();
    scheduler.add_stage(move |_| {
        for (ticks, _) in world.view::<(Ticks,)>().iter() {
            ticks.write().0 += 1;
        }
    });

    assert!(repo.update_at_rate(20));
    thread::sleep(Duration::from_millis(500));
    assert!(repo.update_at_rate(0));
    let ticks = entity.get::<Ticks>().unwrap().read().0;
    assert!(ticks >= 3, "ticked {ticks} times");
    assert_eq!(u64::from(ticks), scheduler.frame_count());

    assert!(repo.close());
    assert!(!scheduler.run_once());
}
