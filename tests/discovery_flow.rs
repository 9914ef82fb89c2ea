use std::time::{Duration, Instant};

use sensorino::config::Config;
use sensorino::discovery::{DiscoveryAgent, DiscoveryTarget};
use sensorino::gateway::Gateway;
use sensorino::storage::StoreBuilder;
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn gateway() -> (tempfile::TempDir, Gateway, mpsc::UnboundedReceiver<String>) {
    let dir = tempfile::tempdir().unwrap();
    let store = StoreBuilder::new(dir.path().join("db")).open().unwrap();
    let config = Config::default();
    let discovery = DiscoveryAgent::with_seed(config.discovery.options(), 7);
    let mut gw = Gateway::with_parts(config, store, discovery);
    let (tx, rx) = mpsc::unbounded_channel();
    gw.register_base("radio", tx).unwrap();
    (dir, gw, rx)
}

fn sent(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .map(|line| serde_json::from_str(&line).unwrap())
        .collect()
}

/// Retry delays never exceed five seconds.
fn later(now: &mut Instant) -> Instant {
    *now += Duration::from_secs(5);
    *now
}

#[test]
fn unknown_node_is_discovered_then_left_alone() {
    let (_dir, mut gw, mut rx) = gateway();
    let mut now = Instant::now();

    gw.handle_base_object(
        "radio",
        r#"{"from": 7, "type": "publish", "serviceId": 1, "temperature": 21.5}"#,
        now,
    )
    .unwrap();
    assert!(gw.discovery().timer().is_some());
    let queued: Vec<_> = gw.discovery().queued().copied().collect();
    assert_eq!(
        queued,
        vec![DiscoveryTarget::Node(7), DiscoveryTarget::Service(7, 1)]
    );
    // Nothing goes out before the jittered retry fires
    assert!(sent(&mut rx).is_empty());

    gw.fire_due_timers(later(&mut now));
    assert_eq!(
        sent(&mut rx),
        vec![json!({"to": 7, "type": "request", "serviceId": 0})]
    );

    // Service manager answers with the services it has
    gw.handle_base_object(
        "radio",
        r#"{"from": 7, "type": "publish", "serviceId": [0, 1, 3]}"#,
        now,
    )
    .unwrap();
    assert!(gw.state_tree().node(7).unwrap().discovered);

    gw.fire_due_timers(later(&mut now));
    assert_eq!(
        sent(&mut rx),
        vec![json!({"to": 7, "type": "request", "serviceId": 1, "dataType": "dataType"})]
    );
    gw.handle_base_object(
        "radio",
        r#"{"from": 7, "type": "publish", "serviceId": 1, "dataType": "temperature"}"#,
        now,
    )
    .unwrap();

    gw.fire_due_timers(later(&mut now));
    assert_eq!(
        sent(&mut rx),
        vec![json!({"to": 7, "type": "request", "serviceId": 3, "dataType": "dataType"})]
    );
    gw.handle_base_object(
        "radio",
        r#"{"from": 7, "type": "publish", "serviceId": 3, "dataType": ["switch"], "count": [0, 1]}"#,
        now,
    )
    .unwrap();

    // Everything known: more traffic asks for nothing
    gw.handle_base_object(
        "radio",
        r#"{"from": 7, "type": "publish", "serviceId": 1, "temperature": 22.5}"#,
        now,
    )
    .unwrap();
    for _ in 0..3 {
        gw.fire_due_timers(later(&mut now));
    }
    assert!(sent(&mut rx).is_empty());
    assert_eq!(gw.discovery().queued().count(), 0);
}

#[test]
fn busy_node_waits_for_its_transaction() {
    let (_dir, mut gw, mut rx) = gateway();
    let mut now = Instant::now();

    gw.handle_base_object(
        "radio",
        r#"{"from": 9, "type": "publish", "serviceId": 1, "presence": true}"#,
        now,
    )
    .unwrap();
    gw.submit_command(r#"{"to": 9, "type": "request", "serviceId": 1}"#, None, now)
        .unwrap();
    assert_eq!(sent(&mut rx).len(), 1);

    gw.fire_due_timers(later(&mut now));
    assert!(sent(&mut rx).is_empty());
    assert!(!gw.tracker().queue_empty(9));

    // The request times out, then discovery gets its turn
    now += Duration::from_secs(15);
    gw.fire_due_timers(now);
    assert!(gw.tracker().queue_empty(9));
    gw.fire_due_timers(later(&mut now));
    assert_eq!(
        sent(&mut rx),
        vec![json!({"to": 9, "type": "request", "serviceId": 0})]
    );
}

#[test]
fn busy_node_resumes_after_error_reply() {
    let (_dir, mut gw, mut rx) = gateway();
    let mut now = Instant::now();

    gw.handle_base_object(
        "radio",
        r#"{"from": 9, "type": "publish", "serviceId": 1, "presence": true}"#,
        now,
    )
    .unwrap();
    gw.submit_command(r#"{"to": 9, "type": "request", "serviceId": 1}"#, None, now)
        .unwrap();
    assert_eq!(sent(&mut rx).len(), 1);

    // Retry fires while the node is busy and is not re-armed
    gw.fire_due_timers(later(&mut now));
    assert!(sent(&mut rx).is_empty());
    assert!(gw.discovery().timer().is_none());

    gw.handle_base_object("radio", r#"{"from": 9, "type": "err"}"#, now)
        .unwrap();
    assert!(gw.tracker().queue_empty(9));
    assert!(gw.discovery().timer().is_some());

    gw.fire_due_timers(later(&mut now));
    assert_eq!(
        sent(&mut rx),
        vec![json!({"to": 9, "type": "request", "serviceId": 0})]
    );
}

#[test]
fn disabled_discovery_stays_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let store = StoreBuilder::new(dir.path().join("db")).open().unwrap();
    let mut config = Config::default();
    config.discovery.enabled = false;
    let mut gw = Gateway::with_store(config, store);
    let (tx, mut rx) = mpsc::unbounded_channel();
    gw.register_base("radio", tx).unwrap();

    let now = Instant::now();
    gw.handle_base_object(
        "radio",
        r#"{"from": 7, "type": "publish", "serviceId": 1, "temperature": 21.5}"#,
        now,
    )
    .unwrap();
    assert!(gw.discovery().timer().is_none());
    gw.fire_due_timers(now + Duration::from_secs(60));
    assert!(sent(&mut rx).is_empty());
}
