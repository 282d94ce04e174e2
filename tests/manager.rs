//! Manager lifecycle tests

mod helper;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;

use helper::{FakeFactory, Fixture, folder, settle};
use python_ls_broker::activation::{Manager, ManagerError, Variant};

fn manager(f: &Fixture) -> Arc<Manager> {
    Arc::new(Manager::new(Arc::new(f.full.clone()), f.options_services()))
}

#[tokio::test(start_paused = true)]
async fn burst_of_option_changes_restarts_once() {
    let f = Fixture::new(vec![folder("file:///proj")]);
    let manager = manager(&f);
    manager
        .start(f.scope("file:///proj/a.py", Some("file:///proj")))
        .await
        .unwrap();
    assert_eq!(f.full.counters.started(), 1);

    for _ in 0..5 {
        f.events.runtime_changed();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    settle().await;

    assert_eq!(f.full.counters.disposed(), 1);
    assert_eq!(f.full.counters.started(), 2);
    assert!(manager.instance().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected() {
    let f = Fixture::new(vec![folder("file:///proj")]);
    let manager = manager(&f);
    let scope = f.scope("file:///proj/a.py", Some("file:///proj"));

    manager.start(scope.clone()).await.unwrap();
    let err = manager.start(scope).await.unwrap_err();

    assert!(matches!(err, ManagerError::AlreadyStarted));
    assert_eq!(f.full.counters.started(), 1);
}

#[tokio::test(start_paused = true)]
async fn dispose_during_start_disposes_the_new_instance() {
    let mut f = Fixture::new(vec![folder("file:///proj")]);
    f.full = f.full.clone().with_start_delay(Duration::from_secs(3));
    let manager = manager(&f);

    let starting = {
        let manager = manager.clone();
        let scope = f.scope("file:///proj/a.py", Some("file:///proj"));
        tokio::spawn(async move { manager.start(scope).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    manager.dispose().await;

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(ManagerError::Disposed)));
    assert_eq!(f.full.counters.started(), 1);
    assert_eq!(f.full.counters.disposed(), 1);
    assert!(manager.instance().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn start_after_dispose_is_rejected() {
    let f = Fixture::new(vec![folder("file:///proj")]);
    let manager = manager(&f);

    manager.dispose().await;
    let err = manager
        .start(f.scope("file:///proj/a.py", Some("file:///proj")))
        .await
        .unwrap_err();

    assert!(matches!(err, ManagerError::Disposed));
    assert_eq!(f.full.counters.created.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn dispose_is_idempotent_and_stops_restarts() {
    let f = Fixture::new(vec![folder("file:///proj")]);
    let manager = manager(&f);
    manager
        .start(f.scope("file:///proj/a.py", Some("file:///proj")))
        .await
        .unwrap();

    manager.dispose().await;
    manager.dispose().await;
    f.events.runtime_changed();
    settle().await;

    assert!(manager.is_disposed());
    assert_eq!(f.full.counters.disposed(), 1);
    assert_eq!(f.full.counters.started(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_restart_leaves_manager_usable() {
    let f = Fixture::new(vec![folder("file:///proj")]);
    let manager = manager(&f);
    manager
        .start(f.scope("file:///proj/a.py", Some("file:///proj")))
        .await
        .unwrap();

    f.full.set_failing(true);
    assert!(manager.restart_now().await.is_err());
    assert!(manager.instance().await.is_none());

    f.full.set_failing(false);
    manager.restart();
    settle().await;

    assert!(manager.instance().await.is_some());
    assert!(!manager.is_disposed());
}

#[tokio::test(start_paused = true)]
async fn restart_picks_up_new_options() {
    let mut f = Fixture::new(vec![folder("file:///proj")]);
    f.full = FakeFactory::new(Variant::FullA, f.telemetry.clone());
    let manager = manager(&f);
    manager
        .start(f.scope("file:///proj/a.py", Some("file:///proj")))
        .await
        .unwrap();

    f.settings.update(|s| s.extra_paths = vec!["/opt/lib".to_string()]);
    f.environment.set("PYTHONPATH", "/srv/shared");
    f.events.environment_changed();
    settle().await;

    assert_eq!(f.full.counters.started(), 2);
    let options = f.full.counters.last_options().unwrap();
    assert_eq!(
        options.initialization_options["searchPaths"],
        json!(["/opt/lib", "/srv/shared", "/usr/bin"])
    );
}

#[tokio::test(start_paused = true)]
async fn dispose_during_restart_disposes_the_replacement() {
    let mut f = Fixture::new(vec![folder("file:///proj")]);
    f.full = f.full.clone().with_start_delay(Duration::from_secs(3));
    let manager = manager(&f);
    manager
        .start(f.scope("file:///proj/a.py", Some("file:///proj")))
        .await
        .unwrap();

    // restart begins after the 1s debounce and takes 3s to start
    f.events.runtime_changed();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    manager.dispose().await;
    settle().await;

    assert_eq!(f.full.counters.created.load(Ordering::SeqCst), 2);
    assert_eq!(f.full.counters.started(), 2);
    assert_eq!(f.full.counters.disposed(), 2);
    assert!(manager.instance().await.is_none());
}
