use std::sync::Arc;
use std::time::Duration;

use tradecouncil::error::ErrorKind;
use tradecouncil::lifecycle::{LifecycleStatus, LifecycleTracker, RunControl, WorkerHandle};
use tradecouncil::progress::{generate_steps, ProgressTracker, RunStatus, TrackerRegistry};
use tradecouncil::roles::RoleRegistry;
use tradecouncil::store::{KvStore, MemoryStore};

fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

async fn write_snapshot(store: &Arc<MemoryStore>, analysis_id: &str, terminal: Option<RunStatus>) {
    let registry = Arc::new(TrackerRegistry::new());
    let tracker = ProgressTracker::new(
        analysis_id,
        generate_steps(&["technical_analyst".to_string()], 1, &RoleRegistry::default()),
        60.0,
        store.clone() as Arc<dyn KvStore>,
        Duration::from_secs(3600),
        Arc::downgrade(&registry),
    );
    tracker.update("Validating stock symbol", Some(0)).await;
    match terminal {
        Some(RunStatus::Completed) => tracker.mark_completed("Analysis completed", None).await,
        Some(RunStatus::Failed) => tracker.mark_failed("boom").await,
        Some(RunStatus::Cancelled) => tracker.mark_cancelled("Analysis cancelled").await,
        _ => {}
    }
}

#[tokio::test]
async fn cancelled_control_fails_the_checkpoint() {
    let control = RunControl::new();
    assert!(control.checkpoint().await.is_ok());

    control.cancel();
    let err = control.checkpoint().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn paused_control_blocks_until_resumed() {
    let control = Arc::new(RunControl::new());
    control.pause();

    let waiting = {
        let control = Arc::clone(&control);
        tokio::spawn(async move { control.checkpoint().await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!waiting.is_finished());

    control.resume();
    assert!(waiting.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn cancel_wakes_a_backoff_sleep_early() {
    let control = Arc::new(RunControl::new());
    let sleeper = {
        let control = Arc::clone(&control);
        tokio::spawn(async move { control.sleep_cancellable(Duration::from_secs(60)).await })
    };
    tokio::time::sleep(Duration::from_millis(120)).await;
    control.cancel();
    assert!(sleeper.await.unwrap());
}

#[tokio::test]
async fn dead_workers_are_unregistered_on_liveness_checks() {
    let tracker = LifecycleTracker::new(store() as Arc<dyn KvStore>);
    let control = Arc::new(RunControl::new());
    let join = tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(30)).await;
    });
    tracker.register("a1", WorkerHandle::new(control, join));

    assert!(tracker.is_alive("a1"));
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!tracker.is_alive("a1"));
    // The dead handle is gone; pause and cancel become no-ops.
    assert!(!tracker.cancel("a1"));
    assert!(!tracker.pause("a1"));
}

#[tokio::test]
async fn status_reconciles_against_the_stored_snapshot() {
    let store = store();
    let tracker = LifecycleTracker::new(store.clone() as Arc<dyn KvStore>);

    // Never seen at all.
    assert_eq!(tracker.status("missing").await, LifecycleStatus::NotFound);

    // A snapshot still marked running with no live worker is an abnormal
    // termination.
    write_snapshot(&store, "crashed", None).await;
    assert_eq!(tracker.status("crashed").await, LifecycleStatus::Failed);

    write_snapshot(&store, "done", Some(RunStatus::Completed)).await;
    assert_eq!(tracker.status("done").await, LifecycleStatus::Completed);

    write_snapshot(&store, "stopped", Some(RunStatus::Cancelled)).await;
    assert_eq!(tracker.status("stopped").await, LifecycleStatus::Cancelled);
}

#[tokio::test]
async fn latest_analysis_id_orders_by_update_time() {
    let store = store();
    let tracker = LifecycleTracker::new(store.clone() as Arc<dyn KvStore>);

    write_snapshot(&store, "first", Some(RunStatus::Completed)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    write_snapshot(&store, "second", None).await;

    assert_eq!(tracker.latest_analysis_id().await.as_deref(), Some("second"));
    let listing = tracker.list_latest(10).await;
    assert_eq!(listing.len(), 2);
    assert_eq!(listing[0].0, "second");
    assert_eq!(listing[1].0, "first");
}
