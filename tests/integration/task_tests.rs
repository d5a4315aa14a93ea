//! One-shot task execution

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serial_test::serial;
use tickstream_core::SingleTask;
use tickstream_tests::{block_on, sleep_ms, wait_until, Counter};

#[test]
fn zero_delay_never_runs_inside_the_caller() {
    block_on(|| async {
        let counter = Counter::new();
        let c = counter.clone();
        SingleTask::call_later(Duration::ZERO, move || {
            c.incr();
            std::future::ready(())
        });

        assert_eq!(counter.get(), 0);
        sleep_ms(1).await;
        assert_eq!(counter.get(), 1);
    });
}

#[test]
#[serial]
fn zero_delay_runs_before_longer_delays() {
    block_on(|| async {
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        SingleTask::call_later(Duration::from_millis(20), move || {
            o.borrow_mut().push("later");
            std::future::ready(())
        });
        let o = order.clone();
        SingleTask::call_later(Duration::ZERO, move || {
            o.borrow_mut().push("now");
            std::future::ready(())
        });

        sleep_ms(50).await;
        assert_eq!(order.borrow().as_slice(), &["now", "later"]);
    });
}

#[test]
#[serial]
fn delay_is_respected() {
    block_on(|| async {
        let counter = Counter::new();
        let c = counter.clone();
        SingleTask::call_later(Duration::from_millis(40), move || {
            c.incr();
            std::future::ready(())
        });

        sleep_ms(20).await;
        assert_eq!(counter.get(), 0);
        sleep_ms(40).await;
        assert_eq!(counter.get(), 1);
    });
}

#[test]
fn run_returns_before_the_work_finishes() {
    block_on(|| async {
        let counter = Counter::new();
        let c = counter.clone();
        SingleTask::run(async move {
            sleep_ms(10).await;
            c.incr();
        });

        assert_eq!(counter.get(), 0);
        sleep_ms(30).await;
        assert_eq!(counter.get(), 1);
    });
}

#[test]
fn failures_are_isolated() {
    block_on(|| async {
        let counter = Counter::new();

        SingleTask::run(async { Err::<(), _>(anyhow::anyhow!("subscription rejected")) });
        let explode = true;
        SingleTask::run(async move {
            if explode {
                panic!("handler bug");
            }
        });
        let c = counter.clone();
        SingleTask::call_later(Duration::from_millis(5), move || async move {
            c.incr();
            Ok::<(), anyhow::Error>(())
        });

        assert!(wait_until(Duration::from_secs(5), || counter.get() == 1).await);
        // Nothing else runs it a second time
        sleep_ms(20).await;
        assert_eq!(counter.get(), 1);
    });
}
