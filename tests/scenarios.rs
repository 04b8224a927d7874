use std::cell::{Cell, RefCell};
use std::rc::Rc;

use reactive_graph::{on_cleanup, peek, EngineError, Graph};

fn err(msg: &'static str) -> Box<dyn std::error::Error> {
    #[derive(Debug)]
    struct Boom(&'static str);
    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for Boom {}
    Box::new(Boom(msg))
}

#[test]
fn basic_set_get() {
    let graph = Graph::new();
    let a = graph.create_source(1).unwrap();
    assert_eq!(a.read(), 1);
    a.write(2).unwrap();
    assert_eq!(a.read(), 2);
}

#[test]
fn diamond_exact_values_and_single_effect_run() {
    let graph = Graph::new();
    let a = graph.create_source(1).unwrap();
    let b = graph
        .create_computed({
            let a = a.clone();
            move || Ok(a.read() + 10)
        })
        .unwrap();
    let c = graph
        .create_computed({
            let a = a.clone();
            move || Ok(a.read() + 100)
        })
        .unwrap();
    let d = graph
        .create_computed({
            let b = b.clone();
            let c = c.clone();
            move || Ok(b.read().unwrap_or(0) + c.read().unwrap_or(0))
        })
        .unwrap();

    assert_eq!(b.read().unwrap(), 11);
    assert_eq!(c.read().unwrap(), 101);
    assert_eq!(d.read().unwrap(), 112);

    let runs = Rc::new(Cell::new(0));
    let (_effect, result) = graph
        .create_effect({
            let d = d.clone();
            let runs = runs.clone();
            move || {
                d.read().map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;
                runs.set(runs.get() + 1);
                Ok(())
            }
        })
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(runs.get(), 1);

    a.write(2).unwrap();
    assert_eq!(d.read().unwrap(), 114);
    assert_eq!(runs.get(), 2);
}

#[test]
fn conditional_dependency_resubscribes() {
    let graph = Graph::new();
    let cond = graph.create_source(true).unwrap();
    let a = graph.create_source(1).unwrap();
    let b = graph.create_source(2).unwrap();
    let x = graph
        .create_computed({
            let cond = cond.clone();
            let a = a.clone();
            let b = b.clone();
            move || Ok(if cond.read() { a.read() } else { b.read() })
        })
        .unwrap();

    let runs = Rc::new(Cell::new(0));
    let seen = Rc::new(Cell::new(0));
    let (_effect, result) = graph
        .create_effect({
            let x = x.clone();
            let runs = runs.clone();
            let seen = seen.clone();
            move || {
                let v = x.read().map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;
                seen.set(v);
                runs.set(runs.get() + 1);
                Ok(())
            }
        })
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(runs.get(), 1);
    assert_eq!(seen.get(), 1);

    // b is not currently depended on; writing it must not trigger a run.
    b.write(20).unwrap();
    assert_eq!(runs.get(), 1);

    // Flip the condition: x now depends on b instead of a.
    cond.write(false).unwrap();
    assert_eq!(runs.get(), 2);
    assert_eq!(seen.get(), 20);

    // a is no longer depended on.
    a.write(99).unwrap();
    assert_eq!(runs.get(), 2);

    // b is depended on again.
    b.write(30).unwrap();
    assert_eq!(runs.get(), 3);
    assert_eq!(seen.get(), 30);
}

#[test]
fn batch_coalesces_multiple_writes_into_one_flush() {
    let graph = Graph::new();
    let a = graph.create_source(0).unwrap();
    let b = graph.create_source(0).unwrap();
    let sum = graph
        .create_computed({
            let a = a.clone();
            let b = b.clone();
            move || Ok(a.read() + b.read())
        })
        .unwrap();

    let runs = Rc::new(Cell::new(0));
    let (_effect, result) = graph
        .create_effect({
            let sum = sum.clone();
            let runs = runs.clone();
            move || {
                sum.read().map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;
                runs.set(runs.get() + 1);
                Ok(())
            }
        })
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(runs.get(), 1);

    let (_, flush_result) = graph.batch(|| {
        a.write(1).unwrap();
        a.write(2).unwrap();
        b.write(3).unwrap();
        b.write(4).unwrap();
    });
    assert!(flush_result.is_ok());
    assert_eq!(runs.get(), 2);
    assert_eq!(sum.read().unwrap(), 6);
}

#[test]
fn cleanup_runs_before_rerun_and_again_on_dispose() {
    let graph = Graph::new();
    let a = graph.create_source(0).unwrap();
    let log = Rc::new(RefCell::new(Vec::<&'static str>::new()));

    let (effect, result) = graph
        .create_effect({
            let a = a.clone();
            let log = log.clone();
            move || {
                let log_cleanup = log.clone();
                on_cleanup(move || log_cleanup.borrow_mut().push("cleanup"));
                a.read();
                log.borrow_mut().push("body");
                Ok(())
            }
        })
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(*log.borrow(), vec!["body"]);

    a.write(1).unwrap();
    assert_eq!(*log.borrow(), vec!["body", "cleanup", "body"]);

    log.borrow_mut().clear();
    effect.dispose();
    assert_eq!(*log.borrow(), vec!["cleanup"]);

    // Disposing again is a no-op; cleanup does not run twice.
    effect.dispose();
    assert_eq!(*log.borrow(), vec!["cleanup"]);
}

#[test]
fn exception_recovery_leaves_computed_dirty_until_it_succeeds_again() {
    let graph = Graph::new();
    let trigger = graph.create_source(false).unwrap();
    let c = graph
        .create_computed({
            let trigger = trigger.clone();
            move || {
                if trigger.read() {
                    Err(err("boom"))
                } else {
                    Ok(42)
                }
            }
        })
        .unwrap();

    assert_eq!(c.read().unwrap(), 42);
    assert!(!c.is_dirty());

    trigger.write(true).unwrap();
    assert!(c.read().is_err());
    assert!(c.is_dirty());

    trigger.write(false).unwrap();
    assert_eq!(c.read().unwrap(), 42);
    assert!(!c.is_dirty());
}

#[test]
fn dependency_and_subscriber_edges_stay_symmetric() {
    let graph = Graph::new();
    let a = graph.create_source(1).unwrap();
    let b = graph
        .create_computed({
            let a = a.clone();
            move || Ok(a.read() + 1)
        })
        .unwrap();
    assert_eq!(a.subscriber_count(), 0);
    b.read().unwrap();
    assert_eq!(a.subscriber_count(), 1);
    assert_eq!(b.dependency_count(), 1);

    a.write(2).unwrap();
    b.read().unwrap();
    assert_eq!(a.subscriber_count(), 1);
    assert_eq!(b.dependency_count(), 1);
}

#[test]
fn switching_dependency_drops_the_stale_edge() {
    let graph = Graph::new();
    let cond = graph.create_source(true).unwrap();
    let a = graph.create_source(1).unwrap();
    let b = graph.create_source(2).unwrap();
    let x = graph
        .create_computed({
            let cond = cond.clone();
            let a = a.clone();
            let b = b.clone();
            move || Ok(if cond.read() { a.read() } else { b.read() })
        })
        .unwrap();

    x.read().unwrap();
    assert_eq!(a.subscriber_count(), 1);
    assert_eq!(b.subscriber_count(), 0);

    cond.write(false).unwrap();
    x.read().unwrap();
    assert_eq!(a.subscriber_count(), 0);
    assert_eq!(b.subscriber_count(), 1);
}

#[test]
fn equal_value_write_is_a_no_op() {
    let graph = Graph::new();
    let a = graph.create_source(5).unwrap();
    let runs = Rc::new(Cell::new(0));
    let (_effect, _) = graph
        .create_effect({
            let a = a.clone();
            let runs = runs.clone();
            move || {
                a.read();
                runs.set(runs.get() + 1);
                Ok(())
            }
        })
        .unwrap();
    assert_eq!(runs.get(), 1);

    a.write(5).unwrap();
    assert_eq!(runs.get(), 1);

    a.write(6).unwrap();
    assert_eq!(runs.get(), 2);
}

#[test]
fn untracked_read_leaves_no_dependency() {
    let graph = Graph::new();
    let a = graph.create_source(1).unwrap();
    let b = graph
        .create_computed({
            let a = a.clone();
            let graph = graph.clone();
            move || Ok(graph.untrack(|| a.read()))
        })
        .unwrap();

    assert_eq!(b.read().unwrap(), 1);
    assert_eq!(a.subscriber_count(), 0);

    a.write(2).unwrap();
    // b never subscribed to a, so it stays clean and keeps returning the
    // value captured the one time it did recompute.
    assert!(!b.is_dirty());
    assert_eq!(peek(&b), Some(1));
}

#[test]
fn self_referencing_computed_reports_a_cycle() {
    let graph = Graph::new();
    let cell: Rc<RefCell<Option<reactive_graph::Computed<i32>>>> = Rc::new(RefCell::new(None));
    let a = graph
        .create_computed({
            let cell = cell.clone();
            move || {
                let b = cell.borrow().as_ref().unwrap().clone();
                b.read().map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
            }
        })
        .unwrap();
    let b = graph
        .create_computed({
            let a = a.clone();
            move || a.read().map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
        })
        .unwrap();
    *cell.borrow_mut() = Some(b.clone());

    match a.read() {
        Err(EngineError::CycleDetected { .. }) => {}
        other => panic!("expected CycleDetected, got {other:?}"),
    }
}

#[test]
fn dispose_is_idempotent_and_disposed_graph_keeps_returning_cached_values() {
    let graph = Graph::new();
    let a = graph.create_source(1).unwrap();
    let b = graph
        .create_computed({
            let a = a.clone();
            move || Ok(a.read() + 1)
        })
        .unwrap();
    assert_eq!(b.read().unwrap(), 2);

    graph.dispose();
    assert!(graph.is_disposed());
    graph.dispose();
    assert!(graph.is_disposed());

    assert_eq!(a.read(), 1);
    assert_eq!(b.read().unwrap(), 2);
}

#[test]
fn two_graphs_are_fully_isolated() {
    let g1 = Graph::new();
    let g2 = Graph::new();

    let a1 = g1.create_source(1).unwrap();
    let a2 = g2.create_source(100).unwrap();

    a1.write(2).unwrap();
    assert_eq!(a1.read(), 2);
    assert_eq!(a2.read(), 100);

    assert_eq!(g1.signal_count(), 1);
    assert_eq!(g2.signal_count(), 1);
}

#[test]
fn scope_disposal_tears_down_its_effects() {
    let graph = Graph::new();
    let a = graph.create_source(0).unwrap();
    let runs = Rc::new(Cell::new(0));

    let scope = graph.create_scope({
        let a = a.clone();
        let runs = runs.clone();
        let graph = graph.clone();
        move || {
            let (_effect, _) = graph
                .create_effect(move || {
                    a.read();
                    runs.set(runs.get() + 1);
                    Ok(())
                })
                .unwrap();
        }
    });
    assert_eq!(runs.get(), 1);
    assert_eq!(graph.effect_count(), 1);

    a.write(1).unwrap();
    assert_eq!(runs.get(), 2);

    scope.dispose();
    assert_eq!(graph.effect_count(), 0);

    a.write(2).unwrap();
    assert_eq!(runs.get(), 2);
}

#[test]
fn disposed_graph_refuses_new_nodes_but_writes_still_apply() {
    let graph = Graph::new();
    let a = graph.create_source(1).unwrap();
    graph.dispose();

    assert!(matches!(graph.create_source(2), Err(EngineError::GraphDisposed)));
    assert!(matches!(graph.create_computed(|| Ok(1)), Err(EngineError::GraphDisposed)));
    assert!(matches!(
        graph.create_effect(|| Ok(())),
        Err(EngineError::GraphDisposed)
    ));

    // Writes to already-live sources still apply; they just never propagate.
    a.write(5).unwrap();
    assert_eq!(a.read(), 5);
}

#[test]
fn effect_writing_an_unbatched_source_defers_its_subscriber() {
    let graph = Graph::new();
    let trigger = graph.create_source(0).unwrap();
    let downstream = graph.create_source(0).unwrap();

    let order = Rc::new(RefCell::new(Vec::<&'static str>::new()));
    let writer_active = Rc::new(Cell::new(false));
    let subscriber_saw_writer_active = Rc::new(Cell::new(false));

    let (_writer, result) = graph
        .create_effect({
            let trigger = trigger.clone();
            let downstream = downstream.clone();
            let order = order.clone();
            let writer_active = writer_active.clone();
            move || {
                trigger.read();
                writer_active.set(true);
                order.borrow_mut().push("writer");
                // Unbatched write from inside an effect; must not run
                // `downstream`'s own subscriber nested in this call.
                downstream.write(peek(&downstream) + 1).unwrap();
                writer_active.set(false);
                Ok(())
            }
        })
        .unwrap();
    assert!(result.is_ok());

    let (_subscriber, result) = graph
        .create_effect({
            let downstream = downstream.clone();
            let order = order.clone();
            let writer_active = writer_active.clone();
            let subscriber_saw_writer_active = subscriber_saw_writer_active.clone();
            move || {
                downstream.read();
                subscriber_saw_writer_active.set(writer_active.get());
                order.borrow_mut().push("subscriber");
                Ok(())
            }
        })
        .unwrap();
    assert!(result.is_ok());

    order.borrow_mut().clear();
    trigger.write(1).unwrap();

    assert!(!subscriber_saw_writer_active.get());
    assert_eq!(*order.borrow(), vec!["writer", "subscriber"]);
    assert_eq!(downstream.read(), 1);
}
