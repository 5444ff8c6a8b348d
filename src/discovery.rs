//! Home Assistant discovery publishing.
//!
//! Translates a device page into retained MQTT discovery documents and the
//! retained initial state snapshot. Topic shapes:
//!
//! - discovery: `<discoveryPrefix>/<component>/eviqo_<deviceId>/<entityId>/config`
//! - state:     `<topicPrefix>/<deviceId>/<entityId>/state`
//! - command:   `<topicPrefix>/<deviceId>/<entityId>/set` (switch/number only)
//! - availability: `<topicPrefix>/<deviceId>/status` (`online`/`offline`)
//!
//! Discovery documents, availability, and initial snapshots are retained;
//! live widget updates and command echoes are not. Publish failures are
//! logged and dropped; the broker connection carries on.

use crate::device::Device;
use crate::mappings::{
    entity_id, is_controllable, mapping_for, translate_status, CURRENT_MAX_WIDGET,
    DEFAULT_CURRENT_MAX, STATUS_CHARGING, STATUS_WIDGET, WIDGET_MAPPINGS,
};
use crate::registry::WidgetRegistry;
use crate::transport::MqttPublisher;
use anyhow::Result;
use serde::Serialize;

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";
pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";

pub const CHARGING_ENTITY: &str = "charging";
pub const CONNECTIVITY_ENTITY: &str = "connectivity";

// -------------------- Topics --------------------

#[derive(Debug, Clone)]
pub struct TopicScheme {
    pub discovery_prefix: String,
    pub topic_prefix: String,
}

impl TopicScheme {
    pub fn new(discovery_prefix: &str, topic_prefix: &str) -> Self {
        Self {
            discovery_prefix: discovery_prefix.to_string(),
            topic_prefix: topic_prefix.to_string(),
        }
    }

    pub fn discovery(&self, component: &str, device_id: i64, entity: &str) -> String {
        format!(
            "{}/{}/eviqo_{}/{}/config",
            self.discovery_prefix, component, device_id, entity
        )
    }

    pub fn state(&self, device_id: i64, entity: &str) -> String {
        format!("{}/{}/{}/state", self.topic_prefix, device_id, entity)
    }

    pub fn command(&self, device_id: i64, entity: &str) -> String {
        format!("{}/{}/{}/set", self.topic_prefix, device_id, entity)
    }

    pub fn availability(&self, device_id: i64) -> String {
        format!("{}/{}/status", self.topic_prefix, device_id)
    }

    /// Process-level availability; carries the MQTT Last Will.
    pub fn bridge_availability(&self) -> String {
        format!("{}/bridge/status", self.topic_prefix)
    }
}

// -------------------- Discovery documents --------------------

#[derive(Clone, Serialize)]
pub struct HaDeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
}

impl HaDeviceInfo {
    pub fn for_device(device: &Device) -> Self {
        let hardware = device.hardware_info.clone().unwrap_or_default();
        let sw_version = match (hardware.version, hardware.build) {
            (Some(version), Some(build)) => format!("{} ({})", version, build),
            (Some(version), None) => version,
            (None, Some(build)) => build,
            (None, None) => env!("CARGO_PKG_VERSION").to_string(),
        };
        Self {
            identifiers: vec![format!("eviqo_{}", device.device_id)],
            name: device.name.clone(),
            manufacturer: "Eviqo".to_string(),
            model: device
                .product_name
                .clone()
                .unwrap_or_else(|| "EV Charger".to_string()),
            sw_version,
        }
    }
}

#[derive(Serialize)]
struct HaSensorConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
    availability_topic: String,
    payload_available: String,
    payload_not_available: String,
    device: HaDeviceInfo,
}

#[derive(Serialize)]
struct HaBinarySensorConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    device_class: String,
    availability_topic: String,
    payload_available: String,
    payload_not_available: String,
    device: HaDeviceInfo,
}

#[derive(Serialize)]
struct HaSwitchConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    command_topic: String,
    payload_on: String,
    payload_off: String,
    icon: String,
    availability_topic: String,
    payload_available: String,
    payload_not_available: String,
    device: HaDeviceInfo,
}

#[derive(Serialize)]
struct HaNumberConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    command_topic: String,
    min: f64,
    max: f64,
    step: f64,
    mode: String,
    unit_of_measurement: String,
    device_class: String,
    availability_topic: String,
    payload_available: String,
    payload_not_available: String,
    device: HaDeviceInfo,
}

/// What the bridge needs to wire after discovery is published: command
/// topics and their pins, plus the echo targets for optimistic state.
#[derive(Debug, Default, Clone)]
pub struct EntityPlan {
    /// `(command topic, pin)` for direct widget controls.
    pub command_routes: Vec<(String, String)>,
    /// `(pin, state topic)` for command echoes.
    pub echo_routes: Vec<(String, String)>,
    /// Present only when the charging switch was wired for this device.
    pub charging_command_topic: Option<String>,
    pub charging_state_topic: String,
}

// -------------------- Publisher --------------------

pub struct DiscoveryPublisher<'a> {
    topics: &'a TopicScheme,
    publisher: &'a dyn MqttPublisher,
}

impl<'a> DiscoveryPublisher<'a> {
    pub fn new(topics: &'a TopicScheme, publisher: &'a dyn MqttPublisher) -> Self {
        Self { topics, publisher }
    }

    /// Publish every discovery document for one device. `charging_ok` gates
    /// the charging switch; it is false when the Status stream's pin does
    /// not match the known charging-control pin.
    pub fn publish_device(
        &self,
        device: &Device,
        registry: &WidgetRegistry,
        charging_ok: bool,
    ) -> EntityPlan {
        let device_id = device.device_id;
        let info = HaDeviceInfo::for_device(device);
        let availability = self.topics.availability(device_id);
        let mut plan = EntityPlan {
            charging_state_topic: self.topics.state(device_id, CHARGING_ENTITY),
            ..EntityPlan::default()
        };

        for stream in registry.streams() {
            let Some(mapping) = mapping_for(&stream.name) else {
                continue;
            };
            let entity = entity_id(&stream.name);
            let state_topic = self.topics.state(device_id, &entity);

            let config = HaSensorConfig {
                name: format!("{} {}", device.name, stream.name),
                unique_id: format!("eviqo_{}_{}", device_id, entity),
                state_topic: state_topic.clone(),
                device_class: mapping.device_class.map(str::to_string),
                state_class: mapping.state_class.map(str::to_string),
                unit_of_measurement: mapping.unit.map(str::to_string),
                icon: mapping.icon.map(str::to_string),
                availability_topic: availability.clone(),
                payload_available: PAYLOAD_ONLINE.to_string(),
                payload_not_available: PAYLOAD_OFFLINE.to_string(),
                device: info.clone(),
            };
            self.publish_config(
                &self.topics.discovery("sensor", device_id, &entity),
                &config,
            );

            if is_controllable(&stream.name) {
                // The number entity shares the sensor's state topic; the
                // discovery component keeps the config paths apart.
                let command_topic = self.topics.command(device_id, &entity);
                let number = HaNumberConfig {
                    name: format!("{} {} limit", device.name, stream.name),
                    unique_id: format!("eviqo_{}_{}_limit", device_id, entity),
                    state_topic: state_topic.clone(),
                    command_topic: command_topic.clone(),
                    min: 0.0,
                    max: current_max(registry),
                    step: 1.0,
                    mode: "slider".to_string(),
                    unit_of_measurement: "A".to_string(),
                    device_class: "current".to_string(),
                    availability_topic: availability.clone(),
                    payload_available: PAYLOAD_ONLINE.to_string(),
                    payload_not_available: PAYLOAD_OFFLINE.to_string(),
                    device: info.clone(),
                };
                self.publish_config(
                    &self.topics.discovery("number", device_id, &entity),
                    &number,
                );
                plan.command_routes
                    .push((command_topic, stream.pin.clone()));
                plan.echo_routes.push((stream.pin.clone(), state_topic));
            }
        }

        let connectivity = HaBinarySensorConfig {
            name: format!("{} Connectivity", device.name),
            unique_id: format!("eviqo_{}_{}", device_id, CONNECTIVITY_ENTITY),
            state_topic: self.topics.state(device_id, CONNECTIVITY_ENTITY),
            device_class: "connectivity".to_string(),
            availability_topic: availability.clone(),
            payload_available: PAYLOAD_ONLINE.to_string(),
            payload_not_available: PAYLOAD_OFFLINE.to_string(),
            device: info.clone(),
        };
        self.publish_config(
            &self
                .topics
                .discovery("binary_sensor", device_id, CONNECTIVITY_ENTITY),
            &connectivity,
        );

        if charging_ok {
            let command_topic = self.topics.command(device_id, CHARGING_ENTITY);
            let switch = HaSwitchConfig {
                name: format!("{} Charging", device.name),
                unique_id: format!("eviqo_{}_{}", device_id, CHARGING_ENTITY),
                state_topic: plan.charging_state_topic.clone(),
                command_topic: command_topic.clone(),
                payload_on: PAYLOAD_ON.to_string(),
                payload_off: PAYLOAD_OFF.to_string(),
                icon: "mdi:ev-station".to_string(),
                availability_topic: availability,
                payload_available: PAYLOAD_ONLINE.to_string(),
                payload_not_available: PAYLOAD_OFFLINE.to_string(),
                device: info,
            };
            self.publish_config(
                &self.topics.discovery("switch", device_id, CHARGING_ENTITY),
                &switch,
            );
            plan.charging_command_topic = Some(command_topic);
        }

        plan
    }

    /// Retained snapshot of the page's current values plus availability.
    /// Returns the raw Status value so the bridge can seed its status map.
    pub fn publish_initial_state(
        &self,
        device_id: i64,
        registry: &WidgetRegistry,
    ) -> Option<String> {
        let mut seeded_status = None;
        for stream in registry.streams() {
            if mapping_for(&stream.name).is_none() {
                continue;
            }
            let Some(raw) = stream.current_value() else {
                continue;
            };
            self.publish_value(device_id, &stream.name, raw, true);
            if stream.name == STATUS_WIDGET {
                seeded_status = Some(raw.to_string());
            }
        }
        self.lossy_publish(
            &self.topics.availability(device_id),
            PAYLOAD_ONLINE.as_bytes(),
            true,
        );
        self.lossy_publish(
            &self.topics.state(device_id, CONNECTIVITY_ENTITY),
            PAYLOAD_ON.as_bytes(),
            true,
        );
        seeded_status
    }

    /// Publish one widget value to its state topic, applying the Status
    /// translation and mirroring the Charging switch state. Unmapped widgets
    /// are ignored.
    pub fn publish_value(&self, device_id: i64, stream_name: &str, raw: &str, retain: bool) {
        if mapping_for(stream_name).is_none() {
            log::debug!("no mapping for widget {:?}, skipping", stream_name);
            return;
        }
        let entity = entity_id(stream_name);
        let topic = self.topics.state(device_id, &entity);

        if stream_name == STATUS_WIDGET {
            let human = match translate_status(raw) {
                Some(human) => human,
                None => {
                    log::warn!("unknown status value {:?} from device {}", raw, device_id);
                    raw
                }
            };
            self.lossy_publish(&topic, human.as_bytes(), retain);
            let charging = if raw == STATUS_CHARGING {
                PAYLOAD_ON
            } else {
                PAYLOAD_OFF
            };
            self.lossy_publish(
                &self.topics.state(device_id, CHARGING_ENTITY),
                charging.as_bytes(),
                retain,
            );
        } else {
            self.lossy_publish(&topic, raw.as_bytes(), retain);
        }
    }

    /// Availability down, connectivity OFF. Both retained so Home Assistant
    /// keeps showing last-known values while the session is gone.
    pub fn publish_offline(&self, device_id: i64) {
        self.lossy_publish(
            &self.topics.availability(device_id),
            PAYLOAD_OFFLINE.as_bytes(),
            true,
        );
        self.lossy_publish(
            &self.topics.state(device_id, CONNECTIVITY_ENTITY),
            PAYLOAD_OFF.as_bytes(),
            true,
        );
    }

    /// Every discovery topic this bridge (or an earlier version of it) may
    /// have published for a device, including the pre-switch binary_sensor
    /// spelling of Charging.
    pub fn removal_topics(&self, device_id: i64) -> Vec<String> {
        let mut topics = Vec::new();
        for mapping in WIDGET_MAPPINGS {
            let entity = entity_id(mapping.widget_name);
            topics.push(self.topics.discovery("sensor", device_id, &entity));
            if is_controllable(mapping.widget_name) {
                topics.push(self.topics.discovery("number", device_id, &entity));
            }
        }
        topics.push(
            self.topics
                .discovery("binary_sensor", device_id, CONNECTIVITY_ENTITY),
        );
        topics.push(self.topics.discovery("switch", device_id, CHARGING_ENTITY));
        // Legacy spelling from before Charging became a switch.
        topics.push(
            self.topics
                .discovery("binary_sensor", device_id, CHARGING_ENTITY),
        );
        topics
    }

    /// Retract discovery for one device with empty retained payloads.
    pub fn remove_device_discovery(&self, device_id: i64) {
        for topic in self.removal_topics(device_id) {
            self.lossy_publish(&topic, b"", true);
        }
    }

    fn publish_config<C: Serialize>(&self, topic: &str, config: &C) {
        match serde_json::to_vec(config) {
            Ok(payload) => self.lossy_publish(topic, &payload, true),
            Err(e) => log::warn!("discovery config for {} did not serialize: {}", topic, e),
        }
    }

    fn lossy_publish(&self, topic: &str, payload: &[u8], retain: bool) {
        if let Err(e) = self.publisher.publish(topic, payload, retain) {
            log::warn!("mqtt publish to {} failed, dropping: {}", topic, e);
        }
    }
}

/// Slider ceiling: the device's `Current max` widget when present and
/// positive, else the model default.
fn current_max(registry: &WidgetRegistry) -> f64 {
    registry
        .by_name(CURRENT_MAX_WIDGET)
        .and_then(|stream| stream.current_value())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|max| *max > 0.0)
        .unwrap_or(DEFAULT_CURRENT_MAX)
}

/// Check whether the Status stream reports the pin the charging protocol
/// writes to. A mismatch means the charging switch must not be wired.
pub fn charging_pin_matches(registry: &WidgetRegistry) -> bool {
    registry
        .by_name(STATUS_WIDGET)
        .map(|stream| stream.pin == crate::mappings::CHARGING_PIN)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DevicePage;
    use crate::transport::InMemoryPublisher;
    use serde_json::{json, Value};

    fn device() -> Device {
        serde_json::from_value(json!({
            "deviceId": 51627,
            "name": "Garage",
            "productName": "Eviqo 48A",
            "hardwareInfo": {"version": "1.4", "build": "220"}
        }))
        .expect("device")
    }

    fn registry(streams: Value) -> WidgetRegistry {
        let page = DevicePage::from_response(&json!({
            "dashboard": {"widgets": [{"modules": [{"displayDataStreams": streams}]}]}
        }))
        .expect("page");
        WidgetRegistry::from_page(&page)
    }

    fn full_registry() -> WidgetRegistry {
        registry(json!([
            {"id": 1, "pin": "5", "name": "Voltage", "visualization": {"value": "241.29"}},
            {"id": 2, "pin": "3", "name": "Current", "visualization": {"value": "16"}},
            {"id": 3, "pin": "15", "name": "Status", "visualization": {"value": "2"}},
            {"id": 4, "pin": "7", "name": "Current max", "visualization": {"value": "40"}}
        ]))
    }

    #[test]
    fn discovery_topics_have_the_documented_shape() {
        let topics = TopicScheme::new("homeassistant", "eviqo");
        assert_eq!(
            topics.discovery("sensor", 51627, "voltage"),
            "homeassistant/sensor/eviqo_51627/voltage/config"
        );
        assert_eq!(topics.state(51627, "voltage"), "eviqo/51627/voltage/state");
        assert_eq!(topics.command(51627, "charging"), "eviqo/51627/charging/set");
        assert_eq!(topics.availability(51627), "eviqo/51627/status");
    }

    #[test]
    fn publish_device_emits_docs_and_routes() {
        let topics = TopicScheme::new("homeassistant", "eviqo");
        let publisher = InMemoryPublisher::new();
        let discovery = DiscoveryPublisher::new(&topics, &publisher);

        let plan = discovery.publish_device(&device(), &full_registry(), true);

        assert_eq!(plan.command_routes.len(), 1);
        assert_eq!(plan.command_routes[0].0, "eviqo/51627/current/set");
        assert_eq!(plan.command_routes[0].1, "3");
        assert_eq!(plan.echo_routes[0].1, "eviqo/51627/current/state");
        assert_eq!(
            plan.charging_command_topic.as_deref(),
            Some("eviqo/51627/charging/set")
        );

        let sensor = publisher
            .last_on("homeassistant/sensor/eviqo_51627/voltage/config")
            .expect("voltage discovery doc");
        assert!(sensor.retain);
        let doc: Value = serde_json::from_slice(&sensor.payload).expect("json");
        assert_eq!(doc["device_class"], "voltage");
        assert_eq!(doc["state_topic"], "eviqo/51627/voltage/state");
        assert_eq!(doc["availability_topic"], "eviqo/51627/status");
        assert_eq!(doc["device"]["identifiers"][0], "eviqo_51627");
        assert_eq!(doc["device"]["sw_version"], "1.4 (220)");

        let switch = publisher
            .last_on("homeassistant/switch/eviqo_51627/charging/config")
            .expect("charging switch doc");
        let doc: Value = serde_json::from_slice(&switch.payload).expect("json");
        assert_eq!(doc["command_topic"], "eviqo/51627/charging/set");
        assert_eq!(doc["payload_on"], "ON");
    }

    #[test]
    fn number_entity_reads_max_from_current_max_widget() {
        let topics = TopicScheme::new("homeassistant", "eviqo");
        let publisher = InMemoryPublisher::new();
        let discovery = DiscoveryPublisher::new(&topics, &publisher);

        discovery.publish_device(&device(), &full_registry(), true);
        let number = publisher
            .last_on("homeassistant/number/eviqo_51627/current/config")
            .expect("number doc");
        let doc: Value = serde_json::from_slice(&number.payload).expect("json");
        assert_eq!(doc["state_topic"], "eviqo/51627/current/state");
        assert_eq!(doc["min"], 0.0);
        assert_eq!(doc["max"], 40.0);
        assert_eq!(doc["step"], 1.0);
        assert_eq!(doc["mode"], "slider");
        assert_eq!(doc["unit_of_measurement"], "A");
        assert_eq!(doc["device_class"], "current");
    }

    #[test]
    fn number_max_falls_back_when_current_max_missing_or_zero() {
        let with_zero = registry(json!([
            {"id": 2, "pin": "3", "name": "Current"},
            {"id": 4, "pin": "7", "name": "Current max", "visualization": {"value": "0"}}
        ]));
        assert_eq!(current_max(&with_zero), DEFAULT_CURRENT_MAX);

        let without = registry(json!([{"id": 2, "pin": "3", "name": "Current"}]));
        assert_eq!(current_max(&without), DEFAULT_CURRENT_MAX);
    }

    #[test]
    fn charging_switch_skipped_when_status_pin_is_wrong() {
        let wrong_pin = registry(json!([
            {"id": 3, "pin": "12", "name": "Status", "visualization": {"value": "1"}}
        ]));
        assert!(!charging_pin_matches(&wrong_pin));
        assert!(charging_pin_matches(&full_registry()));

        let topics = TopicScheme::new("homeassistant", "eviqo");
        let publisher = InMemoryPublisher::new();
        let discovery = DiscoveryPublisher::new(&topics, &publisher);
        let plan = discovery.publish_device(&device(), &wrong_pin, false);
        assert!(plan.charging_command_topic.is_none());
        assert!(publisher
            .last_on("homeassistant/switch/eviqo_51627/charging/config")
            .is_none());
    }

    #[test]
    fn initial_state_translates_status_and_mirrors_charging() {
        let topics = TopicScheme::new("homeassistant", "eviqo");
        let publisher = InMemoryPublisher::new();
        let discovery = DiscoveryPublisher::new(&topics, &publisher);

        let seeded = discovery.publish_initial_state(51627, &full_registry());
        assert_eq!(seeded.as_deref(), Some("2"));

        let status = publisher.last_on("eviqo/51627/status/state").expect("status");
        assert_eq!(status.payload, b"charging");
        assert!(status.retain);

        let charging = publisher
            .last_on("eviqo/51627/charging/state")
            .expect("charging mirror");
        assert_eq!(charging.payload, b"ON");
        assert!(charging.retain);

        let availability = publisher.last_on("eviqo/51627/status").expect("availability");
        assert_eq!(availability.payload, b"online");
        assert!(availability.retain);
    }

    #[test]
    fn live_status_plugged_publishes_plugged_and_off() {
        let topics = TopicScheme::new("homeassistant", "eviqo");
        let publisher = InMemoryPublisher::new();
        let discovery = DiscoveryPublisher::new(&topics, &publisher);

        discovery.publish_value(51627, "Status", "1", false);
        let status = publisher.last_on("eviqo/51627/status/state").expect("status");
        assert_eq!(status.payload, b"plugged");
        assert!(!status.retain);
        let charging = publisher
            .last_on("eviqo/51627/charging/state")
            .expect("mirror");
        assert_eq!(charging.payload, b"OFF");
    }

    #[test]
    fn removal_covers_legacy_charging_binary_sensor() {
        let topics = TopicScheme::new("homeassistant", "eviqo");
        let publisher = InMemoryPublisher::new();
        let discovery = DiscoveryPublisher::new(&topics, &publisher);

        discovery.remove_device_discovery(51627);
        let records = publisher.records();
        assert!(records.iter().all(|r| r.retain && r.payload.is_empty()));
        let topics: Vec<&str> = records.iter().map(|r| r.topic.as_str()).collect();
        assert!(topics.contains(&"homeassistant/binary_sensor/eviqo_51627/charging/config"));
        assert!(topics.contains(&"homeassistant/switch/eviqo_51627/charging/config"));
        assert!(topics.contains(&"homeassistant/sensor/eviqo_51627/status/config"));
        assert!(topics.contains(&"homeassistant/number/eviqo_51627/current/config"));
    }
}
