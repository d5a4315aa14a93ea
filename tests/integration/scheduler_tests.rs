//! Heartbeat scheduler behaviour under real timers

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rstest::rstest;
use serial_test::serial;
use tickstream_core::{CoreError, LoopRunTask};
use tickstream_tests::{block_on, fast_scheduler, sleep_ms, wait_until, Counter};

#[rstest]
#[case(30)]
#[case(60)]
#[serial]
fn first_firing_within_two_intervals_then_spaced(#[case] interval_ms: u64) {
    block_on(|| async move {
        let scheduler = fast_scheduler();
        let interval = Duration::from_millis(interval_ms);
        let fired_at = Rc::new(RefCell::new(Vec::new()));

        let log = fired_at.clone();
        let registered_at = Instant::now();
        scheduler
            .register(
                move || {
                    log.borrow_mut().push(Instant::now());
                    std::future::ready(())
                },
                interval,
            )
            .unwrap();

        sleep_ms(interval_ms * 4 + 10).await;

        let fired_at = fired_at.borrow();
        assert!(fired_at.len() >= 2, "fired {} times", fired_at.len());
        assert!(fired_at[0] - registered_at <= interval * 2);
        // Recorded when the callback starts, a hair after its tick
        let slack = Duration::from_millis(1);
        for pair in fired_at.windows(2) {
            assert!(pair[1] - pair[0] + slack >= interval);
        }
    });
}

#[test]
#[serial]
fn counter_scenario() {
    block_on(|| async {
        let tasks = LoopRunTask::new(fast_scheduler());
        let counter = Counter::new();
        tasks.register(counter.callback(), Duration::from_millis(40)).unwrap();

        // 5.5 intervals
        sleep_ms(220).await;
        let count = counter.get();
        assert!((4..=6).contains(&count), "count was {count}");
    });
}

#[test]
#[serial]
fn unregister_before_due_prevents_firing() {
    block_on(|| async {
        let scheduler = fast_scheduler();
        let counter = Counter::new();
        let id = scheduler.register(counter.callback(), Duration::from_millis(50)).unwrap();

        sleep_ms(20).await;
        scheduler.unregister(id);
        sleep_ms(150).await;

        assert_eq!(counter.get(), 0);
        assert!(!scheduler.contains(id));
    });
}

#[test]
#[serial]
fn started_firing_completes_after_unregister() {
    block_on(|| async {
        let scheduler = fast_scheduler();
        let started = Counter::new();
        let finished = Counter::new();

        let (s, f) = (started.clone(), finished.clone());
        let id = scheduler
            .register(
                move || {
                    let (s, f) = (s.clone(), f.clone());
                    async move {
                        s.incr();
                        sleep_ms(60).await;
                        f.incr();
                    }
                },
                Duration::from_millis(20),
            )
            .unwrap();

        while started.get() == 0 {
            sleep_ms(5).await;
        }
        scheduler.unregister(id);
        sleep_ms(120).await;

        assert_eq!(started.get(), 1);
        assert_eq!(finished.get(), 1);
    });
}

#[test]
#[serial]
fn slow_task_never_overlaps_itself() {
    block_on(|| async {
        let scheduler = fast_scheduler();
        let running = Rc::new(Cell::new(false));
        let overlaps = Counter::new();
        let runs = Counter::new();

        let (running_c, overlaps_c, runs_c) = (running.clone(), overlaps.clone(), runs.clone());
        scheduler
            .register(
                move || {
                    let (running, overlaps, runs) = (running_c.clone(), overlaps_c.clone(), runs_c.clone());
                    async move {
                        if running.replace(true) {
                            overlaps.incr();
                        }
                        runs.incr();
                        sleep_ms(45).await;
                        running.set(false);
                    }
                },
                Duration::from_millis(10),
            )
            .unwrap();

        sleep_ms(200).await;
        assert_eq!(overlaps.get(), 0);
        assert!(runs.get() >= 2);
    });
}

#[test]
#[serial]
fn failing_and_panicking_callbacks_keep_firing() {
    block_on(|| async {
        let scheduler = fast_scheduler();
        let failures = Counter::new();
        let panics = Counter::new();

        let f = failures.clone();
        scheduler
            .register(
                move || {
                    f.incr();
                    std::future::ready(Err::<(), _>(anyhow::anyhow!("feed unavailable")))
                },
                Duration::from_millis(20),
            )
            .unwrap();

        let p = panics.clone();
        scheduler
            .register(
                move || {
                    p.incr();
                    let explode = true;
                    async move {
                        if explode {
                            panic!("callback blew up");
                        }
                    }
                },
                Duration::from_millis(20),
            )
            .unwrap();

        let kept_firing = wait_until(Duration::from_secs(5), || failures.get() >= 3 && panics.get() >= 3).await;
        assert!(kept_firing, "failing task fired {} times", failures.get());
        assert!(panics.get() >= 3, "panicking task fired {} times", panics.get());
    });
}

#[test]
fn zero_interval_is_rejected() {
    block_on(|| async {
        let scheduler = fast_scheduler();
        let result = scheduler.register(Counter::new().callback(), Duration::ZERO);
        assert!(matches!(result, Err(CoreError::InvalidInterval(_))));
        assert!(scheduler.is_empty());
    });
}

#[test]
fn shutdown_is_terminal() {
    block_on(|| async {
        let scheduler = fast_scheduler();
        let counter = Counter::new();
        scheduler.register(counter.callback(), Duration::from_millis(10)).unwrap();

        scheduler.shutdown();
        sleep_ms(50).await;

        assert_eq!(counter.get(), 0);
        assert!(scheduler.is_shut_down());
        assert!(matches!(
            scheduler.register(counter.callback(), Duration::from_millis(10)),
            Err(CoreError::SchedulerShutdown)
        ));
    });
}
