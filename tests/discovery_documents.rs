//! Integration tests for device installation and Home Assistant discovery.
//!
//! These tests verify that:
//! 1. Installing a device publishes the documented discovery topics, retained
//! 2. The retained initial snapshot translates Status and mirrors Charging
//! 3. Command topics are subscribed exactly for switch/number entities
//! 4. A wrong Status pin disables the charging switch
//! 5. Removal blanks every discovery topic including the legacy spelling

use eviqo2mqtt::{Bridge, BridgeConfig, InMemoryPublisher, WidgetUpdate};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};

const DEVICE_RECORD: &str = r#"{
    "deviceId": 51627,
    "name": "Garage",
    "productName": "Eviqo 48A",
    "hardwareInfo": {"version": "1.4", "build": "220"}
}"#;

const DEVICE_PAGE: &str = r#"{
    "dashboard": {
        "widgets": [
            {"modules": [{"displayDataStreams": [
                {"id": 101, "pin": "5", "name": "Voltage", "units": "V",
                 "visualization": {"value": "241.29"}},
                {"id": 102, "pin": "3", "name": "Current", "units": "A",
                 "visualization": {"value": "16"}},
                {"id": 103, "pin": "7", "name": "Current max",
                 "visualization": {"value": "40"}},
                {"id": 105, "pin": "9", "name": "Debug counter",
                 "visualization": {"value": "77"}}
            ]}]},
            {"modules": [{"displayDataStreams": [
                {"id": 104, "pin": "15", "name": "Status",
                 "visualization": {"value": "2"}}
            ]}]}
        ]
    }
}"#;

/// Same page but Status reports an unexpected pin.
const DEVICE_PAGE_WRONG_PIN: &str = r#"{
    "dashboard": {
        "widgets": [
            {"modules": [{"displayDataStreams": [
                {"id": 104, "pin": "12", "name": "Status",
                 "visualization": {"value": "1"}}
            ]}]}
        ]
    }
}"#;

fn test_config() -> BridgeConfig {
    let env: HashMap<&str, &str> = [
        ("EVIQO_EMAIL", "user@example.com"),
        ("EVIQO_PASSWORD", "hunter2"),
        ("EVIQO_MQTT_URL", "mqtt://broker.local:1883"),
    ]
    .into_iter()
    .collect();
    BridgeConfig::from_lookup(&|key| env.get(key).map(|v| v.to_string())).expect("config")
}

fn install(page_json: &str, publisher: Arc<InMemoryPublisher>) -> Bridge {
    let (_tx, rx) = mpsc::channel();
    let mut bridge = Bridge::new(
        test_config(),
        publisher,
        rx,
        Arc::new(AtomicBool::new(false)),
    );
    let device = serde_json::from_str(DEVICE_RECORD).expect("device record");
    let page = serde_json::from_str(page_json).expect("device page");
    bridge.install_device(device, &page).expect("install");
    bridge
}

#[test]
fn install_publishes_retained_discovery_documents() {
    let publisher = Arc::new(InMemoryPublisher::new());
    install(DEVICE_PAGE, Arc::clone(&publisher));

    for topic in [
        "homeassistant/sensor/eviqo_51627/voltage/config",
        "homeassistant/sensor/eviqo_51627/current/config",
        "homeassistant/sensor/eviqo_51627/current_max/config",
        "homeassistant/sensor/eviqo_51627/status/config",
        "homeassistant/number/eviqo_51627/current/config",
        "homeassistant/switch/eviqo_51627/charging/config",
        "homeassistant/binary_sensor/eviqo_51627/connectivity/config",
    ] {
        let record = publisher
            .last_on(topic)
            .unwrap_or_else(|| panic!("missing discovery doc on {}", topic));
        assert!(record.retain, "{} must be retained", topic);
        let doc: Value = serde_json::from_slice(&record.payload).expect("json doc");
        assert_eq!(doc["device"]["identifiers"][0], "eviqo_51627");
        assert_eq!(doc["availability_topic"], "eviqo/51627/status");
    }

    // Unmapped widgets stay off MQTT entirely.
    assert!(publisher
        .last_on("homeassistant/sensor/eviqo_51627/debug_counter/config")
        .is_none());
}

#[test]
fn initial_snapshot_is_retained_and_translated() {
    let publisher = Arc::new(InMemoryPublisher::new());
    install(DEVICE_PAGE, Arc::clone(&publisher));

    let voltage = publisher.last_on("eviqo/51627/voltage/state").expect("voltage");
    assert_eq!(voltage.payload, b"241.29");
    assert!(voltage.retain);

    let status = publisher.last_on("eviqo/51627/status/state").expect("status");
    assert_eq!(status.payload, b"charging");
    assert!(status.retain);

    let charging = publisher
        .last_on("eviqo/51627/charging/state")
        .expect("charging mirror");
    assert_eq!(charging.payload, b"ON");

    let availability = publisher.last_on("eviqo/51627/status").expect("availability");
    assert_eq!(availability.payload, b"online");
    assert!(availability.retain);

    let connectivity = publisher
        .last_on("eviqo/51627/connectivity/state")
        .expect("connectivity");
    assert_eq!(connectivity.payload, b"ON");
    assert!(connectivity.retain);
}

#[test]
fn command_topics_are_subscribed() {
    let publisher = Arc::new(InMemoryPublisher::new());
    install(DEVICE_PAGE, Arc::clone(&publisher));

    let subs = publisher.subscriptions();
    assert!(subs.contains(&"eviqo/51627/current/set".to_string()));
    assert!(subs.contains(&"eviqo/51627/charging/set".to_string()));
    assert_eq!(subs.len(), 2);
}

#[test]
fn live_updates_are_not_retained() {
    let publisher = Arc::new(InMemoryPublisher::new());
    let mut bridge = install(DEVICE_PAGE, Arc::clone(&publisher));
    publisher.clear();

    bridge.apply_widget_update(&WidgetUpdate {
        device_id: "51627".to_string(),
        widget_id: "5".to_string(),
        widget_value: "239.80".to_string(),
    });

    let voltage = publisher.last_on("eviqo/51627/voltage/state").expect("voltage");
    assert_eq!(voltage.payload, b"239.80");
    assert!(!voltage.retain);
}

#[test]
fn status_update_mirrors_switch_state() {
    let publisher = Arc::new(InMemoryPublisher::new());
    let mut bridge = install(DEVICE_PAGE, Arc::clone(&publisher));
    publisher.clear();

    bridge.apply_widget_update(&WidgetUpdate {
        device_id: "51627".to_string(),
        widget_id: "15".to_string(),
        widget_value: "1".to_string(),
    });

    assert_eq!(
        publisher.last_on("eviqo/51627/status/state").expect("status").payload,
        b"plugged"
    );
    assert_eq!(
        publisher
            .last_on("eviqo/51627/charging/state")
            .expect("mirror")
            .payload,
        b"OFF"
    );
}

#[test]
fn wrong_status_pin_disables_charging_switch() {
    let publisher = Arc::new(InMemoryPublisher::new());
    install(DEVICE_PAGE_WRONG_PIN, Arc::clone(&publisher));

    assert!(publisher
        .last_on("homeassistant/switch/eviqo_51627/charging/config")
        .is_none());
    assert!(publisher.subscriptions().is_empty());
    // The Status sensor itself still works.
    assert!(publisher
        .last_on("homeassistant/sensor/eviqo_51627/status/config")
        .is_some());
}

#[test]
fn updates_on_unknown_pins_publish_nothing() {
    let publisher = Arc::new(InMemoryPublisher::new());
    let mut bridge = install(DEVICE_PAGE, Arc::clone(&publisher));
    publisher.clear();

    bridge.apply_widget_update(&WidgetUpdate {
        device_id: "51627".to_string(),
        widget_id: "42".to_string(),
        widget_value: "1".to_string(),
    });
    bridge.apply_widget_update(&WidgetUpdate {
        device_id: "99999".to_string(),
        widget_id: "5".to_string(),
        widget_value: "1".to_string(),
    });

    assert!(publisher.records().is_empty());
}
