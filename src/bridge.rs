//! Bridge supervisor.
//!
//! Composes everything: opens the vendor session, builds per-device
//! registries, publishes discovery, wires command routing, then pumps the
//! supervised loop. On any unrecoverable session error the session is torn
//! down and rebuilt after a fixed 30 s delay; the MQTT connection is never
//! touched. Authentication failures are fatal — wrong credentials do not
//! improve with retries.

use crate::codec::WidgetUpdate;
use crate::config::BridgeConfig;
use crate::device::{Device, DevicePage};
use crate::discovery::{
    charging_pin_matches, DiscoveryPublisher, TopicScheme, CHARGING_ENTITY, PAYLOAD_OFF,
    PAYLOAD_OFFLINE, PAYLOAD_ON, PAYLOAD_ONLINE,
};
use crate::mappings::{translate_status, CHARGING_PIN, STATUS_WIDGET};
use crate::registry::WidgetRegistry;
use crate::session::{open_vendor_session, Session, SessionError};
use crate::transport::{CommandMessage, FrameTransport, MqttPublisher, WsTransport};
use anyhow::Result;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

/// Fixed reconnect backoff; the vendor service tolerates eager clients.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// Socket read slice inside the supervised loop; keeps keepalive and MQTT
/// command latency bounded.
const LISTEN_SLICE: Duration = Duration::from_secs(1);
/// The vendor firmware needs this much settling time mid-sequence.
pub const CHARGE_SEQUENCE_GAP: Duration = Duration::from_millis(250);

// -------------------- Command sink --------------------

/// Where charging sequences and direct widget commands are written. The
/// production implementation is the session; tests record calls. Device ids
/// travel as ASCII, matching the wire records.
pub trait CommandSink {
    fn send_command(&mut self, device_id: &str, pin: &str, value: &str) -> Result<()>;
}

impl<T: FrameTransport> CommandSink for Session<T> {
    fn send_command(&mut self, device_id: &str, pin: &str, value: &str) -> Result<()> {
        Session::<T>::send_command(self, device_id, pin, value)
    }
}

// -------------------- Charging protocol --------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchTarget {
    On,
    Off,
}

impl SwitchTarget {
    pub fn parse(payload: &str) -> Option<Self> {
        match payload.trim() {
            "ON" => Some(SwitchTarget::On),
            "OFF" => Some(SwitchTarget::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStep {
    Send(&'static str),
    Pause(Duration),
}

/// A charging command the current charger state cannot honor. Logged at
/// warn; nothing is written to the charger or back to MQTT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRejected {
    pub reason: String,
}

impl fmt::Display for CommandRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command rejected: {}", self.reason)
    }
}

impl std::error::Error for CommandRejected {}

fn rejected(reason: impl Into<String>) -> CommandRejected {
    CommandRejected {
        reason: reason.into(),
    }
}

/// The multi-step switch protocol on the charging-control pin, keyed by the
/// last observed raw Status. An empty plan is a no-op, not a rejection.
pub fn charging_plan(
    target: SwitchTarget,
    status: Option<&str>,
) -> Result<Vec<ChargeStep>, CommandRejected> {
    use ChargeStep::{Pause, Send};
    match (target, status) {
        (SwitchTarget::Off, Some("2")) => Ok(vec![Send("3"), Send("0")]),
        (SwitchTarget::Off, status) => Err(rejected(format!(
            "cannot stop: charger is not charging (status {:?})",
            status
        ))),
        (SwitchTarget::On, Some("0")) => Err(rejected("cannot start: vehicle is unplugged")),
        (SwitchTarget::On, Some("2")) => Ok(Vec::new()),
        (SwitchTarget::On, Some("1")) => Ok(vec![Send("2"), Send("0")]),
        (SwitchTarget::On, Some("3")) => Ok(vec![
            Send("1"),
            Send("0"),
            Pause(CHARGE_SEQUENCE_GAP),
            Send("2"),
            Send("0"),
        ]),
        (SwitchTarget::On, status) => Err(rejected(format!(
            "cannot start: charger status unknown ({:?})",
            status
        ))),
    }
}

// -------------------- Bridge --------------------

/// How one session ended without an error.
enum ServeEnd {
    Shutdown,
    Recycle,
}

pub struct Bridge {
    config: BridgeConfig,
    topics: TopicScheme,
    publisher: Arc<dyn MqttPublisher>,
    commands: mpsc::Receiver<CommandMessage>,
    shutdown: Arc<AtomicBool>,

    devices: Vec<Device>,
    registries: HashMap<i64, WidgetRegistry>,
    device_status: HashMap<i64, String>,
    /// command topic → (device, pin), for direct widget controls.
    command_routes: HashMap<String, (i64, String)>,
    /// (device, pin) → state topic, for optimistic command echoes.
    echo_topics: HashMap<(i64, String), String>,
    /// charging command topic → device.
    charging_routes: HashMap<String, i64>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        publisher: Arc<dyn MqttPublisher>,
        commands: mpsc::Receiver<CommandMessage>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let topics = TopicScheme::new(&config.discovery_prefix, &config.topic_prefix);
        Self {
            config,
            topics,
            publisher,
            commands,
            shutdown,
            devices: Vec::new(),
            registries: HashMap::new(),
            device_status: HashMap::new(),
            command_routes: HashMap::new(),
            echo_topics: HashMap::new(),
            charging_routes: HashMap::new(),
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Supervisor: connect, serve, reconnect on failure until shutdown.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.shutdown_requested() {
                break;
            }
            match self.connect_and_serve() {
                Ok(ServeEnd::Shutdown) => break,
                Ok(ServeEnd::Recycle) => {
                    log::info!("session recycle due, reconnecting immediately");
                    continue;
                }
                Err(e) => {
                    self.mark_all_offline();
                    if matches!(
                        e.downcast_ref::<SessionError>(),
                        Some(SessionError::AuthFailed)
                    ) {
                        return Err(e);
                    }
                    log::warn!(
                        "session lost: {:#}; reconnecting in {}s",
                        e,
                        RECONNECT_DELAY.as_secs()
                    );
                    self.wait_before_reconnect();
                }
            }
        }
        self.mark_all_offline();
        log::info!("bridge stopped");
        Ok(())
    }

    fn connect_and_serve(&mut self) -> Result<ServeEnd> {
        log::info!("connecting to vendor service");
        let mut session = open_vendor_session()?;
        session.login(&self.config.email, &self.config.password)?;
        let devices = session.query_devices()?;
        log::info!("enumerated {} device(s)", devices.len());

        self.reset_wiring();
        for device in devices {
            let page = session.fetch_device_page(device.device_id)?;
            self.install_device(device, &page)?;
        }
        self.lossy_publish(
            &self.topics.bridge_availability(),
            PAYLOAD_ONLINE.as_bytes(),
            true,
        );

        let end = self.supervise(&mut session);
        session.close();
        end
    }

    fn reset_wiring(&mut self) {
        self.devices.clear();
        self.registries.clear();
        self.command_routes.clear();
        self.echo_topics.clear();
        self.charging_routes.clear();
        // device_status survives: it reflects the charger, not the session.
    }

    /// Register one device: registry, discovery documents, retained initial
    /// state, command subscriptions, routing maps.
    pub fn install_device(&mut self, device: Device, page: &DevicePage) -> Result<()> {
        let device_id = device.device_id;
        let registry = WidgetRegistry::from_page(page);
        if registry.is_empty() {
            log::warn!("device {} page has no data streams", device_id);
        }
        let charging_ok = charging_pin_matches(&registry);
        if !charging_ok {
            log::warn!(
                "device {} does not report the charging-control pin {}; charging switch disabled",
                device_id,
                CHARGING_PIN
            );
        }

        let topics = self.topics.clone();
        let publisher = Arc::clone(&self.publisher);
        let discovery = DiscoveryPublisher::new(&topics, publisher.as_ref());

        let plan = discovery.publish_device(&device, &registry, charging_ok);
        if let Some(raw_status) = discovery.publish_initial_state(device_id, &registry) {
            self.record_status(device_id, &raw_status);
        }

        // Routes go in before the subscription so every subscribed topic is
        // resolvable the moment a publish arrives.
        for (topic, pin) in &plan.command_routes {
            self.command_routes
                .insert(topic.clone(), (device_id, pin.clone()));
        }
        for (pin, state_topic) in &plan.echo_routes {
            self.echo_topics
                .insert((device_id, pin.clone()), state_topic.clone());
        }
        if let Some(charging_topic) = &plan.charging_command_topic {
            self.charging_routes.insert(charging_topic.clone(), device_id);
        }
        for (topic, _) in &plan.command_routes {
            self.publisher.subscribe(topic)?;
        }
        if let Some(charging_topic) = &plan.charging_command_topic {
            self.publisher.subscribe(charging_topic)?;
        }

        log::info!(
            "device {} ({}) online: {} streams, charging switch {}",
            device_id,
            device.name,
            registry.len(),
            if charging_ok { "wired" } else { "disabled" }
        );
        self.devices.push(device);
        self.registries.insert(device_id, registry);
        Ok(())
    }

    fn supervise(&mut self, session: &mut Session<WsTransport>) -> Result<ServeEnd> {
        let mut last_poll = Instant::now();
        loop {
            if self.shutdown_requested() {
                return Ok(ServeEnd::Shutdown);
            }
            if let Some(max_age) = self.config.ws_reconnect_interval {
                if session.age() >= max_age {
                    return Ok(ServeEnd::Recycle);
                }
            }
            session.maybe_keepalive()?;
            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(session, &command);
            }
            if let Some(update) = session.listen(LISTEN_SLICE)? {
                self.apply_widget_update(&update);
            }
            if last_poll.elapsed() >= self.config.poll_interval {
                self.refresh_pages(session)?;
                last_poll = Instant::now();
            }
        }
    }

    /// Route one inbound MQTT publish to the vendor session.
    pub fn handle_command(&mut self, sink: &mut dyn CommandSink, command: &CommandMessage) {
        let payload = String::from_utf8_lossy(&command.payload).into_owned();

        if let Some(&device_id) = self.charging_routes.get(&command.topic) {
            let Some(target) = SwitchTarget::parse(&payload) else {
                log::warn!(
                    "charging command for device {} has bad payload {:?}",
                    device_id,
                    payload
                );
                return;
            };
            self.handle_charging_command(sink, device_id, target);
            return;
        }

        if let Some((device_id, pin)) = self.command_routes.get(&command.topic).cloned() {
            let value = payload.trim();
            match sink.send_command(&device_id.to_string(), &pin, value) {
                Ok(()) => self.on_command_sent(device_id, &pin, value),
                Err(e) => log::warn!(
                    "command to device {} pin {} failed: {:#}",
                    device_id,
                    pin,
                    e
                ),
            }
            return;
        }

        log::debug!("publish on unrouted topic {}", command.topic);
    }

    fn handle_charging_command(
        &mut self,
        sink: &mut dyn CommandSink,
        device_id: i64,
        target: SwitchTarget,
    ) {
        let status = self.device_status.get(&device_id).map(String::as_str);
        let plan = match charging_plan(target, status) {
            Ok(plan) => plan,
            Err(rejection) => {
                log::warn!("device {}: {}", device_id, rejection);
                return;
            }
        };
        if plan.is_empty() {
            log::debug!("device {} already in requested charging state", device_id);
            return;
        }
        // The sequence must run uninterrupted; other commands wait in the
        // channel until it completes.
        for step in &plan {
            match step {
                ChargeStep::Send(value) => {
                    if let Err(e) = sink.send_command(&device_id.to_string(), CHARGING_PIN, value) {
                        log::warn!("charging sequence aborted for {}: {:#}", device_id, e);
                        return;
                    }
                    self.on_command_sent(device_id, CHARGING_PIN, value);
                }
                ChargeStep::Pause(gap) => std::thread::sleep(*gap),
            }
        }
        // Optimistic switch state until the vendor echoes a Status change.
        let state = match target {
            SwitchTarget::On => PAYLOAD_ON,
            SwitchTarget::Off => PAYLOAD_OFF,
        };
        let topic = self.topics.state(device_id, CHARGING_ENTITY);
        self.lossy_publish(&topic, state.as_bytes(), false);
    }

    /// Echo a sent command value to its state topic so Home Assistant
    /// reflects the write before the vendor confirms it.
    fn on_command_sent(&self, device_id: i64, pin: &str, value: &str) {
        if let Some(topic) = self.echo_topics.get(&(device_id, pin.to_string())) {
            self.lossy_publish(topic, value.as_bytes(), false);
        }
    }

    /// Fan one inbound widget update out to MQTT and track Status.
    pub fn apply_widget_update(&mut self, update: &WidgetUpdate) {
        let device_id: i64 = match update.device_id.parse() {
            Ok(id) => id,
            Err(_) => {
                log::warn!("widget update with non-numeric device id {:?}", update.device_id);
                return;
            }
        };
        let Some(registry) = self.registries.get(&device_id) else {
            log::debug!("widget update for unknown device {}", device_id);
            return;
        };
        let Some(stream) = registry.by_pin(&update.widget_id) else {
            log::debug!(
                "device {} update on unregistered pin {}",
                device_id,
                update.widget_id
            );
            return;
        };
        let stream_name = stream.name.clone();
        if stream_name == STATUS_WIDGET {
            self.record_status(device_id, &update.widget_value);
        }

        let topics = self.topics.clone();
        let publisher = Arc::clone(&self.publisher);
        DiscoveryPublisher::new(&topics, publisher.as_ref()).publish_value(
            device_id,
            &stream_name,
            &update.widget_value,
            false,
        );
    }

    fn record_status(&mut self, device_id: i64, raw: &str) {
        if translate_status(raw).is_some() {
            self.device_status.insert(device_id, raw.to_string());
        } else {
            log::warn!("device {} reported unknown status {:?}", device_id, raw);
        }
    }

    /// Re-fetch device pages and refresh the retained snapshot; heals missed
    /// updates and reseeds status.
    fn refresh_pages(&mut self, session: &mut Session<WsTransport>) -> Result<()> {
        let ids: Vec<i64> = self.devices.iter().map(|device| device.device_id).collect();
        for device_id in ids {
            let page = session.fetch_device_page(device_id)?;
            let registry = WidgetRegistry::from_page(&page);

            let topics = self.topics.clone();
            let publisher = Arc::clone(&self.publisher);
            let discovery = DiscoveryPublisher::new(&topics, publisher.as_ref());
            if let Some(raw_status) = discovery.publish_initial_state(device_id, &registry) {
                self.record_status(device_id, &raw_status);
            }
            self.registries.insert(device_id, registry);
        }
        Ok(())
    }

    fn mark_all_offline(&self) {
        let topics = self.topics.clone();
        let publisher = Arc::clone(&self.publisher);
        let discovery = DiscoveryPublisher::new(&topics, publisher.as_ref());
        for device in &self.devices {
            discovery.publish_offline(device.device_id);
        }
        self.lossy_publish(
            &self.topics.bridge_availability(),
            PAYLOAD_OFFLINE.as_bytes(),
            true,
        );
    }

    /// Fixed 30 s backoff, interruptible by shutdown.
    fn wait_before_reconnect(&self) {
        let deadline = Instant::now() + RECONNECT_DELAY;
        while Instant::now() < deadline {
            if self.shutdown_requested() {
                return;
            }
            std::thread::sleep(Duration::from_millis(250));
        }
    }

    /// `--remove-discovery`: retract every discovery document this bridge
    /// ever published, then return.
    pub fn remove_discovery(&mut self) -> Result<()> {
        let mut session = open_vendor_session()?;
        session.login(&self.config.email, &self.config.password)?;
        let devices = session.query_devices()?;
        let topics = self.topics.clone();
        let publisher = Arc::clone(&self.publisher);
        let discovery = DiscoveryPublisher::new(&topics, publisher.as_ref());
        for device in &devices {
            discovery.remove_device_discovery(device.device_id);
        }
        session.close();
        log::info!("discovery retracted for {} device(s)", devices.len());
        Ok(())
    }

    fn lossy_publish(&self, topic: &str, payload: &[u8], retain: bool) {
        if let Err(e) = self.publisher.publish(topic, payload, retain) {
            log::warn!("mqtt publish to {} failed, dropping: {}", topic, e);
        }
    }
}
