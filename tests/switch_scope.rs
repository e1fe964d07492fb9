//! Switch lifecycle: release ordering, op accounting, hooks, and the
//! failure-aggregation policy.

mod common;

use common::{entries, log, push};
use std::cell::RefCell;
use std::rc::Rc;
use weft::{Error, Switch};

#[test]
fn release_handlers_run_in_reverse_order_before_the_failure() {
    let events = log();
    let boom = Error::msg("boom");
    let result = common::run({
        let events = events.clone();
        let boom = boom.clone();
        async move {
            Switch::run(|sw| async move {
                for name in ["h1", "h2", "h3"] {
                    let events = events.clone();
                    sw.on_release(move || {
                        push(&events, name);
                        Ok(())
                    })?;
                }
                Err::<(), _>(boom)
            })
            .await
        }
    });

    assert_eq!(entries(&events), vec!["h3", "h2", "h1"]);
    assert!(Error::same(&result.unwrap_err(), &boom));
}

#[test]
fn release_handlers_run_exactly_once_on_clean_exit() {
    let events = log();
    let result = common::run({
        let events = events.clone();
        async move {
            Switch::run(|sw| async move {
                let events = events.clone();
                sw.on_release(move || {
                    push(&events, "released");
                    Ok(())
                })?;
                Ok(17)
            })
            .await
        }
    });

    assert_eq!(result.unwrap(), 17);
    assert_eq!(entries(&events), vec!["released"]);
}

#[test]
fn escaped_switch_handle_rejects_everything() {
    let escaped: Rc<RefCell<Option<Switch>>> = Rc::default();
    let result = common::run({
        let escaped = escaped.clone();
        async move {
            Switch::run(|sw| async move {
                *escaped.borrow_mut() = Some(sw.clone());
                Ok(())
            })
            .await
        }
    });
    assert!(result.is_ok());

    let sw = escaped.borrow_mut().take().expect("handle escaped");
    assert_eq!(sw.op_count(), 0);
    assert!(!sw.is_on());
    assert!(matches!(sw.check(), Err(Error::SwitchFinished)));
    assert!(matches!(sw.on_release(|| Ok(())), Err(Error::SwitchFinished)));
    assert!(matches!(
        sw.add_cancel_hook(|_| {}),
        Err(Error::SwitchFinished)
    ));
}

#[test]
fn with_op_counts_only_while_running() {
    let result = common::run(async {
        Switch::run(|sw| async move {
            assert_eq!(sw.op_count(), 0);
            let observer = sw.clone();
            let during = sw.with_op(async move { Ok(observer.op_count()) }).await?;
            assert_eq!(during, 1);
            assert_eq!(sw.op_count(), 0);
            Ok(())
        })
        .await
    });
    assert!(result.is_ok());
}

#[test]
fn run_waits_for_forked_fibres() {
    let events = log();
    let result = common::run({
        let events = events.clone();
        async move {
            let scope_events = events.clone();
            Switch::run(|sw| async move {
                for i in 0..3 {
                    let events = scope_events.clone();
                    sw.fork_ignore(async move {
                        weft::yield_now().await?;
                        push(&events, format!("child {i}"));
                        Ok(())
                    })
                    .await?;
                }
                push(&scope_events, "body done");
                Ok(())
            })
            .await?;
            push(&events, "scope closed");
            Ok(())
        }
    });

    assert!(result.is_ok());
    let seen = entries(&events);
    assert_eq!(*seen.last().expect("non-empty"), "scope closed");
    for i in 0..3 {
        assert!(seen.contains(&format!("child {i}")));
    }
}

#[test]
fn cancel_hooks_fire_newest_first_and_removal_sticks() {
    let events = log();
    let boom = Error::msg("halt");
    let result = common::run({
        let events = events.clone();
        let boom = boom.clone();
        async move {
            Switch::run(|sw| async move {
                let e1 = events.clone();
                sw.add_cancel_hook(move |_| push(&e1, "h1"))?;
                let e2 = events.clone();
                let second = sw.add_cancel_hook(move |_| push(&e2, "h2"))?;
                let e3 = events.clone();
                sw.add_cancel_hook(move |cause| push(&e3, format!("h3:{cause}")))?;

                assert!(sw.remove_cancel_hook(second));
                sw.turn_off(boom.clone());
                // Hooks have fired by the time turn_off returns.
                assert!(!sw.remove_cancel_hook(second));
                Ok(())
            })
            .await
        }
    });

    assert_eq!(entries(&events), vec!["h3:halt", "h1"]);
    assert!(Error::same(&result.unwrap_err(), &boom));
}

#[test]
fn hook_added_while_turning_off_fires_immediately() {
    let events = log();
    let result = common::run({
        let events = events.clone();
        async move {
            Switch::run(|sw| async move {
                sw.turn_off(Error::msg("early"));
                let events = events.clone();
                let handle = sw.add_cancel_hook(move |cause| push(&events, format!("{cause}")))?;
                assert!(!sw.remove_cancel_hook(handle));
                Ok(())
            })
            .await
        }
    });

    assert_eq!(entries(&events), vec!["early"]);
    assert!(result.is_err());
}

#[test]
fn stored_failure_absorbs_cancellations_and_aggregates_real_failures() {
    let result = common::run(async {
        Switch::run(|sw| async move {
            let x = Error::msg("x");
            sw.turn_off(x.clone());
            // A cancellation signal never displaces a real failure.
            sw.turn_off(Error::cancelled(&Error::msg("late cancel")));
            assert!(Error::same(sw.get_error().as_ref().expect("stored"), &x));
            // The same failure reported twice is not duplicated.
            sw.turn_off(x.clone());
            assert!(Error::same(sw.get_error().as_ref().expect("stored"), &x));
            // A distinct real failure aggregates in arrival order.
            let y = Error::msg("y");
            sw.turn_off(y.clone());
            match sw.get_error().expect("stored") {
                Error::Multiple(list) => {
                    assert_eq!(list.len(), 2);
                    assert!(Error::same(&list[0], &x));
                    assert!(Error::same(&list[1], &y));
                }
                other => unreachable!("expected aggregate, got {other:?}"),
            }
            Ok(())
        })
        .await
    });
    assert!(matches!(result, Err(Error::Multiple(_))));
}

#[test]
fn latest_cancellation_wins_until_a_real_failure_arrives() {
    let result = common::run(async {
        Switch::run(|sw| async move {
            let a = Error::msg("a");
            let b = Error::msg("b");
            sw.turn_off(Error::cancelled(&a));
            sw.turn_off(Error::cancelled(&b));
            let stored = sw.get_error().expect("stored");
            assert!(Error::same(
                stored.cancel_cause().expect("wrapped"),
                &b
            ));
            Ok(())
        })
        .await
    });
    // Only cancellations were recorded; the scope reports the unwrapped cause.
    assert_eq!(result.unwrap_err().to_string(), "b");
}

#[test]
fn failing_release_handlers_fold_into_the_stored_failure() {
    let boom = Error::msg("body");
    let h1 = Error::msg("h1");
    let h2 = Error::msg("h2");
    let result = common::run({
        let (boom, h1, h2) = (boom.clone(), h1.clone(), h2.clone());
        async move {
            Switch::run(|sw| async move {
                let e = h1.clone();
                sw.on_release(move || Err(e))?;
                let e = h2.clone();
                sw.on_release(move || Err(e))?;
                Err::<(), _>(boom)
            })
            .await
        }
    });

    match result.unwrap_err() {
        Error::Multiple(list) => {
            assert_eq!(list.len(), 3);
            assert!(Error::same(&list[0], &boom));
            // Handlers run in reverse registration order.
            assert!(Error::same(&list[1], &h2));
            assert!(Error::same(&list[2], &h1));
        }
        other => unreachable!("expected aggregate, got {other:?}"),
    }
}

#[test]
fn fork_returns_the_fibre_result_through_a_promise() {
    let result = common::run(async {
        Switch::run(|sw| async move {
            let p = sw.fork(async { Ok(6 * 7) }).await?;
            p.wait().await
        })
        .await
    });
    assert_eq!(result.unwrap(), 42);
}

#[test]
fn forked_fibre_runs_before_the_forker_resumes() {
    let events = log();
    let result = common::run({
        let events = events.clone();
        async move {
            Switch::run(|sw| async move {
                push(&events, "before fork");
                let inner = events.clone();
                sw.fork_ignore(async move {
                    push(&inner, "child");
                    Ok(())
                })
                .await?;
                push(&events, "after fork");
                Ok(())
            })
            .await
        }
    });

    assert!(result.is_ok());
    assert_eq!(entries(&events), vec!["before fork", "child", "after fork"]);
}

#[test]
fn fork_ignore_failure_turns_the_switch_off() {
    let boom = Error::msg("child failed");
    let result = common::run({
        let boom = boom.clone();
        async move {
            Switch::run(|sw| async move {
                sw.fork_ignore(async move { Err(boom) }).await?;
                // The child already ran and turned us off.
                assert!(sw.get_error().is_some());
                Ok(())
            })
            .await
        }
    });
    assert!(Error::same(&result.unwrap_err(), &boom));
}

#[test]
fn fork_on_turning_off_switch_never_starts_the_fibre() {
    let events = log();
    let boom = Error::msg("first");
    let result = common::run({
        let events = events.clone();
        let boom = boom.clone();
        async move {
            Switch::run(|sw| async move {
                sw.turn_off(boom.clone());
                let inner = events.clone();
                let p = sw
                    .fork(async move {
                        push(&inner, "must not run");
                        Ok(())
                    })
                    .await?;
                let broken = p.wait_result().await.unwrap_err();
                assert!(broken.is_cancelled());
                // fork_ignore is silently dropped: the cause is recorded.
                let inner = events.clone();
                sw.fork_ignore(async move {
                    push(&inner, "must not run either");
                    Ok(())
                })
                .await?;
                Ok(())
            })
            .await
        }
    });

    assert!(entries(&events).is_empty());
    assert!(Error::same(&result.unwrap_err(), &boom));
}

#[test]
fn sub_reports_failures_to_on_error_but_passes_cancellation_through() {
    let seen = log();
    let boom = Error::msg("handled");
    let result = common::run({
        let seen = seen.clone();
        let boom = boom.clone();
        async move {
            Switch::run(|sw| async move {
                let seen2 = seen.clone();
                sw.sub(
                    move |e| {
                        push(&seen2, format!("on_error:{e}"));
                        Ok(())
                    },
                    |_child| async move { Err(boom) },
                )
                .await?;
                Ok(())
            })
            .await
        }
    });

    assert!(result.is_ok());
    assert_eq!(entries(&seen), vec!["on_error:handled"]);
}
