//! The same `QuiesceContext`-generic code under the harness and under tokio.

use quiesce_sim::{run, QuiesceContext};
use quiesce_env::TokioContext;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// Spawns a fast worker, then logs after a slower sleep.
async fn staggered<C: QuiesceContext>(ctx: Rc<C>, log: Rc<RefCell<Vec<&'static str>>>) {
    let (worker_ctx, worker_log) = (ctx.clone(), log.clone());
    ctx.spawn("worker", async move {
        worker_ctx.sleep(Duration::from_millis(10)).await;
        worker_log.borrow_mut().push("worker");
    });
    ctx.sleep(Duration::from_millis(50)).await;
    log.borrow_mut().push("main");
}

#[test]
fn test_generic_code_under_harness() {
    let report = run(|sim| async move {
        let log = Rc::new(RefCell::new(Vec::new()));
        staggered(Rc::new(sim.clone()), log.clone()).await;
        assert_eq!(*log.borrow(), vec!["worker", "main"]);
        assert_eq!(sim.now(), Duration::from_millis(50));
    })
    .unwrap();

    assert_eq!(report.tasks_spawned, 2);
    assert_eq!(report.final_time, Duration::from_millis(50));
}

#[tokio::test]
async fn test_generic_code_under_tokio() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let log = Rc::new(RefCell::new(Vec::new()));
            staggered(TokioContext::shared(), log.clone()).await;
            assert_eq!(*log.borrow(), vec!["worker", "main"]);
        })
        .await;
}
