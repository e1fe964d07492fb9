//! Promise resolution order, uncancellable waits, and the event loop's
//! observable guarantees.

mod common;

use common::{entries, log, push};
use weft::{Error, Promise, Runtime, RuntimeConfig, Switch};

#[test]
fn fulfill_wakes_awaiters_in_wait_order() {
    let events = log();
    let result = common::run({
        let events = events.clone();
        async move {
            Switch::run(|sw| async move {
                let (promise, resolver) = Promise::<u32>::create();
                for i in 0..3 {
                    let events = events.clone();
                    let promise = promise.clone();
                    sw.fork_ignore(async move {
                        let value = promise.wait().await?;
                        push(&events, format!("waiter {i} got {value}"));
                        Ok(())
                    })
                    .await?;
                }
                assert!(!promise.is_resolved());
                resolver.fulfill(7);
                assert_eq!(promise.try_get().expect("resolved").unwrap(), 7);
                Ok(())
            })
            .await
        }
    });

    assert!(result.is_ok());
    assert_eq!(
        entries(&events),
        vec!["waiter 0 got 7", "waiter 1 got 7", "waiter 2 got 7"]
    );
}

#[test]
fn breaking_a_promise_delivers_the_failure_to_every_awaiter() {
    let boom = Error::msg("broken");
    let events = log();
    let result = common::run({
        let events = events.clone();
        let boom = boom.clone();
        async move {
            Switch::run(|sw| async move {
                let (promise, resolver) = Promise::<u32>::create();
                for i in 0..2 {
                    let events = events.clone();
                    let promise = promise.clone();
                    sw.fork_ignore(async move {
                        match promise.wait().await {
                            Err(e) => push(&events, format!("waiter {i}: {e}")),
                            Ok(v) => push(&events, format!("waiter {i} got {v}")),
                        }
                        Ok(())
                    })
                    .await?;
                }
                resolver.break_with(boom);
                Ok(())
            })
            .await
        }
    });

    assert!(result.is_ok());
    assert_eq!(entries(&events), vec!["waiter 0: broken", "waiter 1: broken"]);
}

#[test]
fn wait_result_outlives_cancellation() {
    let events = log();
    let result = common::run({
        let events = events.clone();
        async move {
            Switch::run(|sw| async move {
                let (promise, resolver) = Promise::<&'static str>::create();
                let inner = events.clone();
                sw.fork_ignore(async move {
                    let value = promise.wait_result().await?;
                    push(&inner, format!("drained: {value}"));
                    Ok(())
                })
                .await?;
                // Cancel the scope, then resolve: the masked waiter must see
                // the value, not the cancellation.
                sw.cancel_ctx().cancel(&Error::msg("stop"));
                resolver.fulfill("payload");
                Ok(())
            })
            .await
        }
    });

    assert!(result.is_ok());
    assert_eq!(entries(&events), vec!["drained: payload"]);
}

#[test]
fn a_cancelled_wait_deregisters_its_waiter() {
    let events = log();
    let result = common::run({
        let events = events.clone();
        async move {
            Switch::run(|sw| async move {
                let (promise, resolver) = Promise::<u32>::create();
                let inner = events.clone();
                let p = promise.clone();
                sw.fork_ignore(async move {
                    let err = p.wait().await.unwrap_err();
                    push(&inner, format!("wait: {err}"));
                    Ok(())
                })
                .await?;
                sw.cancel_ctx().cancel(&Error::msg("stop"));
                // Resolving afterwards must not double-resume anything.
                resolver.fulfill(1);
                assert_eq!(promise.try_get().expect("resolved").unwrap(), 1);
                Ok(())
            })
            .await
        }
    });

    assert!(result.is_ok());
    assert_eq!(entries(&events), vec!["wait: cancelled: stop"]);
}

#[test]
fn yields_interleave_in_fifo_order() {
    let events = log();
    let result = common::run({
        let events = events.clone();
        async move {
            Switch::run(|sw| async move {
                for name in ["a", "b"] {
                    let events = events.clone();
                    sw.fork_ignore(async move {
                        push(&events, format!("{name}1"));
                        weft::yield_now().await?;
                        push(&events, format!("{name}2"));
                        Ok(())
                    })
                    .await?;
                }
                Ok(())
            })
            .await
        }
    });

    assert!(result.is_ok());
    assert_eq!(entries(&events), vec!["a1", "b1", "a2", "b2"]);
}

#[test]
fn deadlock_is_reported_not_hung() {
    let result = common::run(async {
        let (promise, _resolver) = Promise::<u32>::create();
        // The resolver is alive but nothing will ever call it from another
        // fibre; with the main fibre parked, the loop has no work left.
        promise.wait().await
    });
    assert!(matches!(result, Err(Error::Deadlocked)));
}

#[test]
fn the_step_limit_stops_a_runaway_loop() {
    common::init_test_logging();
    let runtime = Runtime::with_config(RuntimeConfig::new().max_steps(64));
    let result = runtime.run::<()>(async {
        loop {
            weft::yield_now().await?;
        }
    });
    assert!(result.is_err());
    assert!(!matches!(result, Err(Error::Deadlocked)));
}

#[test]
fn live_fibres_drop_to_zero_after_a_structured_run() {
    common::init_test_logging();
    let runtime = Runtime::new();
    let result: weft::Result<()> = runtime.run(async {
        Switch::run(|sw| async move {
            sw.fork_ignore(async {
                weft::yield_now().await?;
                Ok(())
            })
            .await?;
            Ok(())
        })
        .await
    });
    assert!(result.is_ok());
    assert_eq!(runtime.live_fibres(), 0);
}
