//! The scoped-resource primitive: `fork_sub_ignore` frees its resource in
//! every outcome and routes failures to the right place.

mod common;

use common::{entries, log, push, Log};
use weft::{Error, ReleaseFn, Switch};

fn release_into(events: &Log) -> Option<ReleaseFn> {
    let events = events.clone();
    Some(Box::new(move || {
        push(&events, "released");
        Ok(())
    }))
}

#[test]
fn happy_path_attaches_the_release_to_the_child_scope() {
    let events = log();
    let result = common::run({
        let events = events.clone();
        async move {
            Switch::run(|sw| async move {
                let body_events = events.clone();
                sw.fork_sub_ignore(
                    |_e| Ok(()),
                    release_into(&events),
                    move |_child| async move {
                        push(&body_events, "body");
                        Ok(())
                    },
                )
                .await?;
                // The child ran to completion before we resumed, closing its
                // scope and running the release handler.
                push(&events, "after fork");
                Ok(())
            })
            .await
        }
    });

    assert!(result.is_ok());
    assert_eq!(entries(&events), vec!["body", "released", "after fork"]);
}

#[test]
fn body_failure_goes_to_on_error_and_the_release_still_runs() {
    let events = log();
    let boom = Error::msg("child body failed");
    let result = common::run({
        let events = events.clone();
        let boom = boom.clone();
        async move {
            Switch::run(|sw| async move {
                let seen = events.clone();
                sw.fork_sub_ignore(
                    move |e| {
                        push(&seen, format!("on_error:{e}"));
                        Ok(())
                    },
                    release_into(&events),
                    move |_child| async move { Err(boom) },
                )
                .await?;
                Ok(())
            })
            .await
        }
    });

    assert!(result.is_ok());
    assert_eq!(
        entries(&events),
        vec!["released", "on_error:child body failed"]
    );
}

#[test]
fn on_error_failure_turns_the_parent_off_with_both() {
    let body_err = Error::msg("body");
    let handler_err = Error::msg("handler");
    let result = common::run({
        let (body_err, handler_err) = (body_err.clone(), handler_err.clone());
        async move {
            Switch::run(|sw| async move {
                let e2 = handler_err.clone();
                sw.fork_sub_ignore(
                    move |_e| Err(e2),
                    None,
                    move |_child| async move { Err(body_err) },
                )
                .await?;
                Ok(())
            })
            .await
        }
    });

    match result.unwrap_err() {
        Error::Multiple(list) => {
            assert_eq!(list.len(), 2);
            assert!(Error::same(&list[0], &body_err));
            assert!(Error::same(&list[1], &handler_err));
        }
        other => unreachable!("expected aggregate, got {other:?}"),
    }
}

#[test]
fn release_runs_when_the_parent_is_already_turning_off() {
    let events = log();
    let boom = Error::msg("earlier failure");
    let result = common::run({
        let events = events.clone();
        let boom = boom.clone();
        async move {
            Switch::run(|sw| async move {
                sw.turn_off(boom.clone());
                let body_events = events.clone();
                let refused = sw
                    .fork_sub_ignore(
                        |_e| Ok(()),
                        release_into(&events),
                        move |_child| async move {
                            push(&body_events, "body must not run");
                            Ok(())
                        },
                    )
                    .await;
                // The resource was freed and the original failure came back
                // unchanged.
                assert!(Error::same(&refused.unwrap_err(), &boom));
                Ok(())
            })
            .await
        }
    });

    assert_eq!(entries(&events), vec!["released"]);
    assert!(Error::same(&result.unwrap_err(), &boom));
}

#[test]
fn release_runs_when_the_parent_handle_is_finished() {
    let events = log();
    let escaped: std::rc::Rc<std::cell::RefCell<Option<Switch>>> = std::rc::Rc::default();
    let result = common::run({
        let events = events.clone();
        let escaped = escaped.clone();
        async move {
            Switch::run({
                let escaped = escaped.clone();
                |sw| async move {
                    *escaped.borrow_mut() = Some(sw.clone());
                    Ok(())
                }
            })
            .await?;

            let stale = escaped.borrow_mut().take().expect("escaped handle");
            let refused = stale
                .fork_sub_ignore(|_e| Ok(()), release_into(&events), |_child| async move {
                    Ok(())
                })
                .await;
            assert!(matches!(refused, Err(Error::SwitchFinished)));
            Ok(())
        }
    });

    assert!(result.is_ok());
    assert_eq!(entries(&events), vec!["released"]);
}

#[test]
fn release_runs_when_the_parent_context_is_already_cancelled() {
    let events = log();
    let stop = Error::msg("ctx cancelled");
    let result = common::run({
        let events = events.clone();
        let stop = stop.clone();
        async move {
            Switch::run(|sw| async move {
                sw.cancel_ctx().cancel(&stop);
                let body_events = events.clone();
                let refused = sw
                    .fork_sub_ignore(
                        |_e| Ok(()),
                        release_into(&events),
                        move |_child| async move {
                            push(&body_events, "body must not run");
                            Ok(())
                        },
                    )
                    .await;
                let err = refused.unwrap_err();
                assert!(Error::same(&err, &stop));
                Err::<(), _>(err)
            })
            .await
        }
    });

    assert_eq!(entries(&events), vec!["released"]);
    assert!(Error::same(&result.unwrap_err(), &stop));
}

#[test]
fn cancellation_of_the_child_is_reported_through_the_parent() {
    let stop = Error::msg("parent failed");
    let events = log();
    let result = common::run({
        let events = events.clone();
        let stop = stop.clone();
        async move {
            Switch::run(|sw| async move {
                let seen = events.clone();
                sw.fork_sub_ignore(
                    move |e| {
                        push(&seen, format!("on_error:{e}"));
                        Ok(())
                    },
                    None,
                    |_child| async move { weft::await_cancel().await },
                )
                .await?;
                // The child is parked; fail the parent scope.
                sw.turn_off(stop.clone());
                Ok(())
            })
            .await
        }
    });

    // on_error never saw the cancellation; the parent's own failure is the
    // one reported.
    assert!(entries(&events).is_empty());
    assert!(Error::same(&result.unwrap_err(), &stop));
}
