use super::*;
use serde_json::json;

fn state(value: Value) -> RobotState {
    serde_json::from_value(value).expect("state object")
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn cache_miss_is_none_not_error() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let cached = storage.get(&RobotId::from("ghost")).await.expect("get");
    assert!(cached.is_none());
}

#[tokio::test]
async fn cache_set_overwrites_whole_document() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let robot = RobotId::from("r1");

    storage
        .set(&robot, &state(json!({ "battery": 80, "mode": "auto" })))
        .await
        .expect("first set");
    storage
        .set(&robot, &state(json!({ "battery": 75 })))
        .await
        .expect("second set");

    let cached = storage.get(&robot).await.expect("get").expect("present");
    assert_eq!(cached, state(json!({ "battery": 75 })));
    assert!(cached.get("mode").is_none());
}

#[tokio::test]
async fn cache_keys_are_scoped_per_robot() {
    assert_eq!(state_key(&RobotId::from("r9")), "robot:r9:state");

    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .set(&RobotId::from("a"), &state(json!({ "n": 1 })))
        .await
        .expect("set a");
    assert!(storage
        .get(&RobotId::from("b"))
        .await
        .expect("get b")
        .is_none());
}

#[tokio::test]
async fn owned_robots_default_ui_type() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .assign_robot("ops@example.com", &RobotId::from("r2"), Some("adminA"))
        .await
        .expect("assign r2");
    storage
        .assign_robot("ops@example.com", &RobotId::from("r1"), None)
        .await
        .expect("assign r1");
    storage
        .assign_robot("other@example.com", &RobotId::from("r3"), None)
        .await
        .expect("assign r3");

    let robots = storage
        .robots_for_owner("ops@example.com")
        .await
        .expect("robots");
    assert_eq!(
        robots,
        vec![
            OwnedRobot {
                robot_id: RobotId::from("r1"),
                ui_type: DEFAULT_UI_TYPE.to_string(),
            },
            OwnedRobot {
                robot_id: RobotId::from("r2"),
                ui_type: "adminA".to_string(),
            },
        ]
    );

    assert!(storage
        .unassign_robot("ops@example.com", &RobotId::from("r2"))
        .await
        .expect("unassign"));
    assert_eq!(
        storage
            .robots_for_owner("ops@example.com")
            .await
            .expect("robots")
            .len(),
        1
    );
}

#[tokio::test]
async fn missions_replace_per_owner_and_robot() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let robot = RobotId::from("r1");

    assert!(storage
        .get_missions("ops@example.com", &robot)
        .await
        .expect("get")
        .is_none());

    storage
        .put_missions("ops@example.com", &robot, &[json!({ "waypoint": [1.5, 2.25] })])
        .await
        .expect("put");
    storage
        .put_missions(
            "ops@example.com",
            &robot,
            &[json!({ "name": "patrol" }), json!({ "name": "dock" })],
        )
        .await
        .expect("replace");

    let stored = storage
        .get_missions("ops@example.com", &robot)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(
        stored.missions,
        vec![json!({ "name": "patrol" }), json!({ "name": "dock" })]
    );

    assert!(storage
        .get_missions("someone@example.com", &robot)
        .await
        .expect("get other owner")
        .is_none());
}

#[test]
fn memory_urls_have_no_parent_dir() {
    assert!(sqlite_path("sqlite::memory:").is_none());
    assert_eq!(
        sqlite_path("sqlite://./data/relay.db?mode=rwc"),
        Some(PathBuf::from("./data/relay.db"))
    );
}
