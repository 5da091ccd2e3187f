//! Combinatorial coverage of exhaustive search.
//!
//! `n` workers each run `m` steps separated by yields and log every step.
//! Exhaustive search must observe every order of the logged steps that
//! respects each worker's own sequence: `(n*m)! / (m!)^n` distinct logs.

use std::{cell::RefCell, collections::BTreeSet, rc::Rc};

use skein_core::{
    Context, ExplorationConfig, ExplorationReport, Explorer, Fault, OperationResult, StrategyKind,
};

type Log = Rc<RefCell<Vec<(usize, usize)>>>;

async fn worker(cx: Context, id: usize, steps: usize, log: Log) -> OperationResult {
    for step in 0..steps {
        log.borrow_mut().push((id, step));
        if step + 1 < steps {
            cx.yield_now().await;
        }
    }
    Ok(())
}

fn explore_all(workers: usize, steps: usize) -> (usize, ExplorationReport) {
    let seen = Rc::new(RefCell::new(BTreeSet::new()));
    let sink = Rc::clone(&seen);

    let entry = move |cx: Context| {
        let sink = Rc::clone(&sink);
        async move {
            let log: Log = Rc::new(RefCell::new(Vec::new()));
            let mut handles = Vec::new();
            for id in 0..workers {
                handles.push(cx.spawn(worker(cx.clone(), id, steps, Rc::clone(&log))).await);
            }
            for handle in handles {
                cx.join(handle).await;
            }
            sink.borrow_mut().insert(log.take());
            Ok::<(), Fault>(())
        }
    };

    let config = ExplorationConfig::default()
        .with_strategy(StrategyKind::Exhaustive)
        .with_iterations(1_000_000);
    let explorer = Explorer::new(config).expect("valid config");
    let report = explorer.explore(entry).expect("engine error");

    let distinct = seen.borrow().len();
    (distinct, report)
}

fn factorial(n: usize) -> usize {
    (1..=n).product()
}

fn expected_orders(workers: usize, steps: usize) -> usize {
    factorial(workers * steps) / factorial(steps).pow(u32::try_from(workers).expect("small"))
}

#[test]
fn two_workers_two_steps() {
    let (distinct, report) = explore_all(2, 2);

    assert!(report.is_clean(), "{report}");
    assert!(report.exhausted);
    assert_eq!(distinct, 6);
    assert_eq!(distinct, expected_orders(2, 2));
}

#[test]
fn three_workers_two_steps() {
    let (distinct, report) = explore_all(3, 2);

    assert!(report.exhausted);
    assert_eq!(distinct, 90);
}

#[test]
fn two_workers_three_steps() {
    let (distinct, report) = explore_all(2, 3);

    assert!(report.exhausted);
    assert_eq!(distinct, expected_orders(2, 3));
}

#[test]
fn single_worker_has_one_order() {
    let (distinct, report) = explore_all(1, 4);

    assert!(report.exhausted);
    assert_eq!(distinct, 1);
}
