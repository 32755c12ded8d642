use super::*;
use async_trait::async_trait;
use serde_json::json;
use shared::{domain::UiIdentity, protocol::RegisterUi};
use storage::Storage;

async fn router() -> (EventRouter, Storage) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    (EventRouter::new(Arc::new(storage.clone())), storage)
}

fn drain(rx: &mut PeerReceiver) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn state(value: Value) -> RobotState {
    RobotState(fields(value))
}

fn register_robot(id: &str) -> InboundEvent {
    InboundEvent::RegisterRobot(RegisterRobot {
        robot_id: Some(RobotId::from(id)),
    })
}

fn register_ui(email: &str, robots: &[&str]) -> InboundEvent {
    InboundEvent::RegisterUi(RegisterUi {
        email: Some(UiIdentity::from(email)),
        robot_ids: robots.iter().map(|id| RobotId::from(*id)).collect(),
    })
}

fn command(robot: &str, command: &str) -> InboundEvent {
    InboundEvent::CommandToRobot(CommandToRobot {
        robot_id: Some(RobotId::from(robot)),
        command: Some(command.to_string()),
    })
}

#[tokio::test]
async fn robot_ui_status_and_disconnect_flow() {
    let (router, storage) = router().await;
    let (robot_conn, mut robot_rx) = router.connect().await;
    let (ui_conn, mut ui_rx) = router.connect().await;
    let r1 = RobotId::from("r1");

    router
        .handle(robot_conn, register_robot("r1"))
        .await
        .expect("register robot");
    let cached = storage.get(&r1).await.expect("get").expect("cached");
    assert_eq!(
        cached,
        state(json!({ "connection_status": 1, "connection": "connected" }))
    );
    // discovery broadcast reaches every peer, registered or not
    assert_eq!(drain(&mut robot_rx), vec![OutboundEvent::Status(cached.clone())]);
    assert_eq!(drain(&mut ui_rx), vec![OutboundEvent::Status(cached.clone())]);

    let outcome = router
        .handle(ui_conn, register_ui("u1@example.com", &["r1"]))
        .await
        .expect("register ui");
    assert_eq!(outcome, Outcome::Delivered(1));
    assert_eq!(drain(&mut ui_rx), vec![OutboundEvent::Status(cached)]);
    assert!(drain(&mut robot_rx).is_empty());

    router
        .handle(
            robot_conn,
            InboundEvent::StatusUpdate(fields(json!({ "robot_id": "r1", "battery": 80 }))),
        )
        .await
        .expect("status update");
    let expected = state(json!({ "robot_id": "r1", "battery": 80, "connection": "connected" }));
    assert_eq!(storage.get(&r1).await.expect("get"), Some(expected.clone()));
    assert_eq!(drain(&mut ui_rx), vec![OutboundEvent::Status(expected)]);
    assert!(drain(&mut robot_rx).is_empty());

    router.disconnect(robot_conn).await.expect("disconnect");
    let after = storage.get(&r1).await.expect("get").expect("cached");
    assert_eq!(after.connection_status(), Some(0));
    assert_eq!(after.connection(), Some("disconnected"));
    assert_eq!(after.get("battery"), Some(&json!(80)));
    assert_eq!(drain(&mut ui_rx), vec![OutboundEvent::Status(after)]);
    assert_eq!(router.connected_robots().await, 0);
}

#[tokio::test]
async fn command_reaches_only_the_robot_connection() {
    let (router, _storage) = router().await;
    let (robot_conn, mut robot_rx) = router.connect().await;
    let (ui_conn, mut ui_rx) = router.connect().await;

    router
        .handle(robot_conn, register_robot("r1"))
        .await
        .expect("register");
    router
        .handle(ui_conn, register_ui("u1@example.com", &["r1"]))
        .await
        .expect("register ui");
    drain(&mut robot_rx);
    drain(&mut ui_rx);

    let outcome = router
        .handle(ui_conn, command("r1", "dock"))
        .await
        .expect("command");
    assert_eq!(outcome, Outcome::Delivered(1));
    assert_eq!(
        drain(&mut robot_rx),
        vec![OutboundEvent::Command {
            command: "dock".into()
        }]
    );
    assert!(drain(&mut ui_rx).is_empty());
}

#[tokio::test]
async fn command_to_absent_robot_is_dropped_quietly() {
    let (router, _storage) = router().await;
    let (ui_conn, mut ui_rx) = router.connect().await;

    let outcome = router
        .handle(ui_conn, command("r1", "dock"))
        .await
        .expect("command");
    assert_eq!(
        outcome,
        Outcome::Dropped(DropReason::UnknownTarget(RobotId::from("r1")))
    );
    assert!(drain(&mut ui_rx).is_empty());
}

#[tokio::test]
async fn command_follows_latest_robot_binding() {
    let (router, _storage) = router().await;
    let (old_conn, mut old_rx) = router.connect().await;
    let (new_conn, mut new_rx) = router.connect().await;
    let (ui_conn, _ui_rx) = router.connect().await;

    router.handle(old_conn, register_robot("r1")).await.expect("old");
    router.handle(new_conn, register_robot("r1")).await.expect("new");
    drain(&mut old_rx);
    drain(&mut new_rx);

    router
        .handle(ui_conn, command("r1", "stop"))
        .await
        .expect("command");
    assert!(drain(&mut old_rx).is_empty());
    assert_eq!(drain(&mut new_rx).len(), 1);
}

#[tokio::test]
async fn orphaned_robot_close_does_not_mark_disconnected() {
    let (router, storage) = router().await;
    let (old_conn, _old_rx) = router.connect().await;
    let (new_conn, _new_rx) = router.connect().await;
    let (ui_conn, mut ui_rx) = router.connect().await;

    router.handle(old_conn, register_robot("r1")).await.expect("old");
    router.handle(new_conn, register_robot("r1")).await.expect("new");
    router
        .handle(ui_conn, register_ui("u1@example.com", &["r1"]))
        .await
        .expect("ui");
    drain(&mut ui_rx);

    let outcome = router.disconnect(old_conn).await.expect("disconnect");
    assert_eq!(outcome, Outcome::Delivered(0));
    assert!(drain(&mut ui_rx).is_empty());
    let cached = storage
        .get(&RobotId::from("r1"))
        .await
        .expect("get")
        .expect("cached");
    assert_eq!(cached.connection(), Some("connected"));
}

#[tokio::test]
async fn images_fan_out_to_subscribers_only_and_are_not_cached() {
    let (router, storage) = router().await;
    let (robot_conn, _robot_rx) = router.connect().await;
    let (follower, mut follower_rx) = router.connect().await;
    let (bystander, mut bystander_rx) = router.connect().await;

    router
        .handle(follower, register_ui("u1@example.com", &["r1"]))
        .await
        .expect("follower");
    router
        .handle(bystander, register_ui("u2@example.com", &["r2"]))
        .await
        .expect("bystander");

    let outcome = router
        .handle(
            robot_conn,
            InboundEvent::RobotImage(RobotImage {
                robot_id: Some(RobotId::from("r1")),
                image_base64: Some("aGVsbG8=".into()),
            }),
        )
        .await
        .expect("image");
    assert_eq!(outcome, Outcome::Delivered(1));

    let events = drain(&mut follower_rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_name(), "robot_image_r1");
    assert!(drain(&mut bystander_rx).is_empty());
    assert!(storage
        .get(&RobotId::from("r1"))
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn missing_fields_are_soft_dropped_without_side_effects() {
    let (router, storage) = router().await;
    let (conn, mut rx) = router.connect().await;

    let cases = [
        (
            InboundEvent::RegisterRobot(RegisterRobot { robot_id: None }),
            "robot_id",
        ),
        (
            InboundEvent::RegisterRobot(RegisterRobot {
                robot_id: Some(RobotId::from("")),
            }),
            "robot_id",
        ),
        (
            InboundEvent::RegisterUi(RegisterUi {
                email: None,
                robot_ids: vec![RobotId::from("r1")],
            }),
            "email",
        ),
        (
            InboundEvent::StatusUpdate(fields(json!({ "battery": 10 }))),
            "robot_id",
        ),
        (
            InboundEvent::RobotImage(RobotImage {
                robot_id: Some(RobotId::from("r1")),
                image_base64: None,
            }),
            "image_base64",
        ),
        (
            InboundEvent::CommandToRobot(CommandToRobot {
                robot_id: Some(RobotId::from("r1")),
                command: None,
            }),
            "command",
        ),
    ];

    for (event, field) in cases {
        let outcome = router.handle(conn, event).await.expect("soft drop");
        assert_eq!(outcome, Outcome::Dropped(DropReason::MissingField(field)));
    }

    assert!(drain(&mut rx).is_empty());
    assert_eq!(router.connected_robots().await, 0);
    assert!(storage
        .get(&RobotId::from("r1"))
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn ui_close_stops_delivery_to_that_tab_only() {
    let (router, _storage) = router().await;
    let (robot_conn, _robot_rx) = router.connect().await;
    let (laptop, mut laptop_rx) = router.connect().await;
    let (phone, mut phone_rx) = router.connect().await;

    router
        .handle(laptop, register_ui("u1@example.com", &["r1"]))
        .await
        .expect("laptop");
    router
        .handle(phone, register_ui("u1@example.com", &["r1"]))
        .await
        .expect("phone");
    let outcome = router.disconnect(laptop).await.expect("close laptop");
    assert_eq!(outcome, Outcome::Delivered(0));

    router
        .handle(
            robot_conn,
            InboundEvent::StatusUpdate(fields(json!({ "robot_id": "r1", "mode": "idle" }))),
        )
        .await
        .expect("status");
    assert!(drain(&mut laptop_rx).is_empty());
    assert_eq!(drain(&mut phone_rx).len(), 1);
    assert_eq!(router.peer_count().await, 2);
}

#[tokio::test]
async fn closing_unregistered_connection_is_noop() {
    let (router, _storage) = router().await;
    let (conn, _rx) = router.connect().await;
    let outcome = router.disconnect(conn).await.expect("disconnect");
    assert_eq!(outcome, Outcome::Delivered(0));
    assert_eq!(router.peer_count().await, 0);
}

struct FailingCache;

#[async_trait]
impl StateCache for FailingCache {
    async fn get(&self, _robot_id: &RobotId) -> anyhow::Result<Option<RobotState>> {
        Err(anyhow::anyhow!("cache unreachable"))
    }

    async fn set(&self, _robot_id: &RobotId, _state: &RobotState) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("cache unreachable"))
    }
}

struct StalledCache;

#[async_trait]
impl StateCache for StalledCache {
    async fn get(&self, _robot_id: &RobotId) -> anyhow::Result<Option<RobotState>> {
        std::future::pending().await
    }

    async fn set(&self, _robot_id: &RobotId, _state: &RobotState) -> anyhow::Result<()> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn cache_failure_surfaces_but_routing_table_stays_usable() {
    let router = EventRouter::new(Arc::new(FailingCache));
    let (robot_conn, _robot_rx) = router.connect().await;
    let (ui_conn, mut ui_rx) = router.connect().await;

    let err = router
        .handle(robot_conn, register_robot("r1"))
        .await
        .expect_err("cache down");
    assert!(matches!(err, RouterError::Cache { .. }));
    assert_eq!(router.connected_robots().await, 1);

    router
        .handle(ui_conn, register_ui("u1@example.com", &[]))
        .await
        .expect("ui without robots needs no cache");
    let outcome = router
        .handle(
            robot_conn,
            InboundEvent::RobotImage(RobotImage {
                robot_id: Some(RobotId::from("r1")),
                image_base64: Some("Zg==".into()),
            }),
        )
        .await
        .expect("images bypass the cache");
    assert_eq!(outcome, Outcome::Delivered(0));
    assert!(drain(&mut ui_rx).is_empty());

    let err = router.disconnect(robot_conn).await.expect_err("cache down");
    assert!(matches!(err, RouterError::Cache { .. }));
    assert_eq!(router.connected_robots().await, 0);
}

#[tokio::test]
async fn stalled_cache_times_out() {
    let router =
        EventRouter::new(Arc::new(StalledCache)).with_cache_timeout(Duration::from_millis(20));
    let (conn, _rx) = router.connect().await;

    let err = router
        .handle(conn, register_robot("r1"))
        .await
        .expect_err("timeout");
    assert!(matches!(err, RouterError::CacheTimeout { .. }));
}

/// Storage whose next `get` stalls once for `delay` after being armed.
struct SlowReadCache {
    inner: Storage,
    armed: std::sync::atomic::AtomicBool,
    delay: Duration,
}

#[async_trait]
impl StateCache for SlowReadCache {
    async fn get(&self, robot_id: &RobotId) -> anyhow::Result<Option<RobotState>> {
        if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.get(robot_id).await
    }

    async fn set(&self, robot_id: &RobotId, state: &RobotState) -> anyhow::Result<()> {
        self.inner.set(robot_id, state).await
    }
}

#[tokio::test]
async fn late_close_does_not_overwrite_reregistered_robot() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let cache = Arc::new(SlowReadCache {
        inner: storage.clone(),
        armed: std::sync::atomic::AtomicBool::new(false),
        delay: Duration::from_millis(100),
    });
    let router = Arc::new(EventRouter::new(cache.clone()));
    let r1 = RobotId::from("r1");

    let (ui_conn, mut ui_rx) = router.connect().await;
    router
        .handle(ui_conn, register_ui("u1@example.com", &["r1"]))
        .await
        .expect("register ui");
    let (old_conn, _old_rx) = router.connect().await;
    router
        .handle(old_conn, register_robot("r1"))
        .await
        .expect("first registration");
    drain(&mut ui_rx);

    cache
        .armed
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let closing = {
        let router = Arc::clone(&router);
        tokio::spawn(async move { router.disconnect(old_conn).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (new_conn, _new_rx) = router.connect().await;
    router
        .handle(new_conn, register_robot("r1"))
        .await
        .expect("re-registration");
    closing.await.expect("join").expect("disconnect");

    let cached = storage.get(&r1).await.expect("get").expect("cached");
    assert_eq!(cached.connection(), Some("connected"));
    assert_eq!(cached.connection_status(), Some(1));
    assert_eq!(router.connected_robots().await, 1);

    let seen: Vec<Option<String>> = drain(&mut ui_rx)
        .into_iter()
        .map(|event| match event {
            OutboundEvent::Status(state) => state.connection().map(str::to_string),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(seen.last(), Some(&Some("connected".to_string())));
}

#[tokio::test]
async fn close_after_rebind_skips_disconnect_write() {
    let (router, storage) = router().await;
    let (old_conn, _old_rx) = router.connect().await;
    let (ui_conn, mut ui_rx) = router.connect().await;
    router
        .handle(ui_conn, register_ui("u1@example.com", &["r1"]))
        .await
        .expect("register ui");
    router
        .handle(old_conn, register_robot("r1"))
        .await
        .expect("register robot");
    drain(&mut ui_rx);

    // registry already released the binding; a new robot connection claims it
    // before the close has written anything
    let removal = router.table.lock().await.registry.remove_connection(old_conn);
    assert_eq!(removal.freed_robots.len(), 1);
    let (new_conn, _new_rx) = router.connect().await;
    router
        .table
        .lock()
        .await
        .registry
        .register_robot(new_conn, RobotId::from("r1"));

    let sent = router
        .mark_disconnected(&RobotId::from("r1"), &[])
        .await
        .expect("mark");
    assert_eq!(sent, None);
    let cached = storage
        .get(&RobotId::from("r1"))
        .await
        .expect("get")
        .expect("cached");
    assert_eq!(cached.connection(), Some("connected"));
    assert!(drain(&mut ui_rx).is_empty());
}
