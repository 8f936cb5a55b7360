//! Supervisor lifecycle and shutdown behavior against in-memory
//! collaborators.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal_macros::dec;

use common::{
    entry_only_params, strategy_row, user_row, MemoryStore, MockExchanger, MockFactory,
    MockNotifier,
};
use perp_common::{Mark, PositionStatus};
use perp_engine::supervisor::{Event, Supervisor};

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn mark_now(price: rust_decimal::Decimal) -> Mark {
    Mark::new(price, chrono::Utc::now())
}

#[tokio::test]
async fn test_boot_launches_enabled_strategies() {
    let store = MemoryStore::new();
    let user = user_row(100);
    let cs = strategy_row(user.uuid, "BTCUSDT", entry_only_params(dec!(47000)));
    let uuid = cs.uuid;
    store.insert_user(user);
    store.insert_strategy(cs);

    let supervisor = Supervisor::new(
        store.clone(),
        MockNotifier::new(),
        MockFactory::new(MockExchanger::new()),
    );
    supervisor.start().await.unwrap();

    assert_eq!(supervisor.runner_count(), 1);
    assert!(supervisor.exists(uuid));

    supervisor.stop_all().await;
    assert_eq!(supervisor.runner_count(), 0);
}

#[tokio::test]
async fn test_enable_then_disable_race() {
    let store = MemoryStore::new();
    let user = user_row(100);
    let mut cs = strategy_row(user.uuid, "BTCUSDT", entry_only_params(dec!(47000)));
    cs.enabled = 0;
    let uuid = cs.uuid;
    store.insert_user(user);
    store.insert_strategy(cs);

    let notifier = MockNotifier::new();
    let supervisor = Supervisor::new(
        store.clone(),
        notifier.clone(),
        MockFactory::new(MockExchanger::new()),
    );
    supervisor.start().await.unwrap();
    assert_eq!(supervisor.runner_count(), 0);

    supervisor.events().send(Event::Enable(uuid)).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || supervisor.exists(uuid)).await,
        "strategy never appeared in the index"
    );
    assert_eq!(store.strategy(uuid).unwrap().enabled, 1);

    supervisor.events().send(Event::Disable(uuid)).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || !supervisor.exists(uuid)).await,
        "strategy never left the index"
    );
    assert_eq!(store.strategy(uuid).unwrap().enabled, 0);
    assert_eq!(supervisor.runner_count(), 0);

    // A second disable for the same uuid is rejected without panic.
    supervisor.events().send(Event::Disable(uuid)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_enable_rejects_duplicate() {
    let store = MemoryStore::new();
    let user = user_row(100);
    let cs = strategy_row(user.uuid, "BTCUSDT", entry_only_params(dec!(47000)));
    let uuid = cs.uuid;
    store.insert_user(user);
    store.insert_strategy(cs);

    let supervisor = Supervisor::new(
        store.clone(),
        MockNotifier::new(),
        MockFactory::new(MockExchanger::new()),
    );
    supervisor.start().await.unwrap();
    assert_eq!(supervisor.runner_count(), 1);

    // Already indexed: the event is a no-op.
    supervisor.events().send(Event::Enable(uuid)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(supervisor.runner_count(), 1);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_double_stop_is_idempotent() {
    let store = MemoryStore::new();
    let user = user_row(100);
    let cs = strategy_row(user.uuid, "BTCUSDT", entry_only_params(dec!(47000)));
    let uuid = cs.uuid;
    store.insert_user(user);
    store.insert_strategy(cs);

    let supervisor = Supervisor::new(
        store.clone(),
        MockNotifier::new(),
        MockFactory::new(MockExchanger::new()),
    );
    supervisor.start().await.unwrap();

    let handle = supervisor.index().get(uuid).unwrap();
    handle.stop();
    handle.stop();

    assert!(
        wait_until(Duration::from_secs(2), || !supervisor.exists(uuid)).await,
        "runner never exited"
    );
    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_broadcast_never_blocks_on_stopping_runner() {
    let store = MemoryStore::new();
    let user = user_row(100);
    let cs = strategy_row(user.uuid, "BTCUSDT", entry_only_params(dec!(99999999)));
    let uuid = cs.uuid;
    store.insert_user(user);
    store.insert_strategy(cs);

    let supervisor = Supervisor::new(
        store.clone(),
        MockNotifier::new(),
        MockFactory::new(MockExchanger::new()),
    );
    supervisor.start().await.unwrap();

    let handle = supervisor.index().get(uuid).unwrap();
    handle.stop();

    // The runner is stopping and will never read its channel again;
    // the broadcast must still return immediately.
    let started = Instant::now();
    for _ in 0..1000 {
        supervisor.broadcast("BTCUSDT", mark_now(dec!(46000)));
    }
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "broadcast blocked on a stopping runner"
    );

    supervisor.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_shutdown_under_load() {
    let store = MemoryStore::new();
    // Slow exchange keeps entry flows in flight while we shut down.
    let exchanger = MockExchanger::with_latency(Duration::from_millis(100));
    let notifier = MockNotifier::new();

    let mut uuids = Vec::new();
    for i in 0..10 {
        let user = user_row(100 + i);
        // Distinct symbols: entries must not conflict across runners.
        let symbol = format!("SYM{i}USDT");
        let cs = strategy_row(user.uuid, &symbol, entry_only_params(dec!(47000)));
        uuids.push((cs.uuid, symbol));
        store.insert_user(user);
        store.insert_strategy(cs);
    }

    let supervisor = Supervisor::new(
        store.clone(),
        notifier.clone(),
        MockFactory::new(exchanger),
    );
    supervisor.start().await.unwrap();
    assert_eq!(supervisor.runner_count(), 10);

    // Fire every entry; each check_price is now mid-exchange-call.
    for (_, symbol) in &uuids {
        supervisor.broadcast(symbol, mark_now(dec!(47000)));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    supervisor.stop_all().await;
    let elapsed = started.elapsed();

    // Everything drained inside the ceiling, and no in-flight entry was
    // abandoned halfway: each strategy either never entered or is fully
    // opened with its order details persisted.
    assert!(
        elapsed < Duration::from_secs(30),
        "stop_all took {elapsed:?}"
    );
    assert_eq!(supervisor.runner_count(), 0);
    for (uuid, _) in &uuids {
        let cs = store.strategy(*uuid).unwrap();
        if cs.position_status == PositionStatus::Opened.as_i16() {
            assert!(
                cs.exchange_orders_details.get("entry_order").is_some(),
                "opened strategy lost its order details"
            );
        } else {
            assert_eq!(cs.position_status, PositionStatus::Closed.as_i16());
        }
    }
}

#[tokio::test]
async fn test_entry_conflict_resets_strategy() {
    let store = MemoryStore::new();
    let user = user_row(100);
    let user_uuid = user.uuid;
    store.insert_user(user);

    // An already-open strategy on the same user and symbol.
    let mut opened = strategy_row(user_uuid, "BTCUSDT", entry_only_params(dec!(90000)));
    opened.enabled = 0;
    opened.position_status = PositionStatus::Opened.as_i16();
    opened.exchange_orders_details =
        serde_json::json!({"entry_order": {"order_id": 7, "size": "0.02"}});
    store.insert_strategy(opened);

    let cs = strategy_row(user_uuid, "BTCUSDT", entry_only_params(dec!(47000)));
    let uuid = cs.uuid;
    store.insert_strategy(cs);

    let notifier = MockNotifier::new();
    let supervisor = Supervisor::new(
        store.clone(),
        notifier.clone(),
        MockFactory::new(MockExchanger::new()),
    );
    supervisor.start().await.unwrap();

    supervisor.broadcast("BTCUSDT", mark_now(dec!(47000)));

    // The conflicting entry halts the strategy and the reset event
    // disables it.
    assert!(
        wait_until(Duration::from_secs(2), || {
            store.strategy(uuid).unwrap().enabled == 0
        })
        .await,
        "conflicting strategy was never reset"
    );
    let cs = store.strategy(uuid).unwrap();
    assert_eq!(cs.position_status, PositionStatus::Closed.as_i16());
    assert!(
        wait_until(Duration::from_secs(2), || !supervisor.exists(uuid)).await,
        "reset strategy never left the index"
    );

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_out_of_sync_marks_status_unknown() {
    let store = MemoryStore::new();
    let user = user_row(100);
    let cs = strategy_row(user.uuid, "BTCUSDT", entry_only_params(dec!(47000)));
    let uuid = cs.uuid;
    store.insert_user(user);
    store.insert_strategy(cs);

    let supervisor = Supervisor::new(
        store.clone(),
        MockNotifier::new(),
        MockFactory::new(MockExchanger::new()),
    );
    supervisor.start().await.unwrap();

    supervisor.events().send(Event::OutOfSync(uuid)).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            store.strategy(uuid).unwrap().position_status
                == PositionStatus::Unknown.as_i16()
        })
        .await,
        "status never became Unknown"
    );

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_restart_rebuilds_runner_from_store() {
    let store = MemoryStore::new();
    let user = user_row(100);
    let cs = strategy_row(user.uuid, "BTCUSDT", entry_only_params(dec!(47000)));
    let uuid = cs.uuid;
    store.insert_user(user);
    store.insert_strategy(cs);

    let supervisor = Supervisor::new(
        store.clone(),
        MockNotifier::new(),
        MockFactory::new(MockExchanger::new()),
    );
    supervisor.start().await.unwrap();
    let old_handle = supervisor.index().get(uuid).unwrap();

    supervisor.events().send(Event::Restart(uuid)).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            supervisor
                .index()
                .get(uuid)
                .is_some_and(|h| !Arc::ptr_eq(&h, &old_handle))
        })
        .await,
        "runner was never rebuilt"
    );

    supervisor.stop_all().await;
}
