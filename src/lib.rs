//! eviqo2mqtt
//!
//! Bridges Eviqo EV chargers to a local MQTT broker with Home Assistant
//! auto-discovery. Chargers are reached through the vendor's dashboard
//! WebSocket, which speaks a small binary framing with JSON/ASCII payloads.
//!
//! # Architecture
//!
//! - `codec`: the 3-byte frame codec and `vw` record payloads
//! - `session`: one WebSocket session — handshake, requests, telemetry,
//!   keepalive
//! - `device` / `registry`: the vendor's device documents and the per-device
//!   pin/name/id indexes built from them
//! - `mappings` / `discovery`: which widgets become Home Assistant entities,
//!   and the retained discovery/state documents that announce them
//! - `bridge`: composition and lifecycle — supervised loop, command routing,
//!   the multi-step charging protocol, reconnection
//! - `transport`: the WebSocket and MQTT endpoints behind testable traits
//! - `config`: environment-driven settings
//!
//! The session owns the socket and its read loop; the bridge owns the MQTT
//! client and the routing maps. They meet only through method calls and the
//! command channel.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod device;
pub mod discovery;
pub mod mappings;
pub mod registry;
pub mod session;
pub mod transport;

pub use bridge::{charging_plan, Bridge, ChargeStep, CommandSink, SwitchTarget};
pub use codec::{
    decode_frame, encode_command, encode_frame, parse_widget_update, CodecError, Frame,
    FrameHeader, MsgCounter, RequestBody, ResponseBody, WidgetUpdate,
};
pub use config::BridgeConfig;
pub use device::{DataStream, Device, DevicePage};
pub use discovery::{DiscoveryPublisher, EntityPlan, TopicScheme};
pub use registry::WidgetRegistry;
pub use session::{login_hash, open_vendor_session, Session, SessionError, SessionState};
pub use transport::{
    parse_mqtt_url, CommandMessage, FrameTransport, InMemoryPublisher, MqttPublisher, MqttRuntime,
    MqttUrl, PublishRecord,
};
