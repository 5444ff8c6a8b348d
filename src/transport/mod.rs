//! Transport layer: the vendor WebSocket endpoint and the local MQTT broker.
//!
//! Both sides sit behind small traits (`FrameTransport`, `MqttPublisher`) so
//! the session and bridge logic can be exercised against in-memory fakes.

mod mqtt;
mod ws;

pub use mqtt::{
    parse_mqtt_url, CommandMessage, InMemoryPublisher, MqttPublisher, MqttRuntime, MqttUrl,
    PublishRecord, RumqttcPublisher,
};
pub use ws::{
    fetch_login_cookies, FrameTransport, WsTransport, LOGIN_PAGE_URL, ORIGIN, USER_AGENT, WS_URL,
};
