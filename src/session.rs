//! Vendor session client.
//!
//! Owns one WebSocket connection from handshake to close. The handshake runs
//! cookie capture → socket open → LOGIN → DEVICE_QUERY, then the bridge
//! fetches one page per device. After that the session is `Ready`: inbound
//! widget updates surface through [`Session::listen`], requests go through
//! [`Session::send_await`], and command writes through
//! [`Session::send_command`].
//!
//! A keepalive frame goes out 15 s after the last successful send of any
//! kind. Two missed keepalive windows without a single inbound frame mark
//! the link dead.

use crate::codec::{
    decode_frame, encode_command, encode_frame, Frame, MsgCounter, RequestBody, ResponseBody,
    WidgetUpdate, OP_DEVICE_NUMBER, OP_DEVICE_PAGE, OP_DEVICE_QUERY, OP_INIT, OP_KEEPALIVE,
    OP_LOGIN,
};
use crate::device::{Device, DevicePage};
use crate::transport::{fetch_login_cookies, FrameTransport, WsTransport, LOGIN_PAGE_URL, WS_URL};
use anyhow::{anyhow, Result};
use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// Default `send_await` timeout.
pub const AWAIT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_MISS_LIMIT: u32 = 2;

const CLIENT_TYPE: &str = "web";
const CLIENT_VERSION: &str = "0.98.2";
const CLIENT_LOCALE: &str = "en_US";
/// Fixed dashboard page id the vendor app requests for every device.
const DEVICE_PAGE_ID: &str = "17948";

// -------------------- Errors --------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Cookie capture or WebSocket open failed.
    ConnectFailed(String),
    /// LOGIN produced no user record. Not retried; the credentials are wrong.
    AuthFailed,
    /// `send_await` saw no response frame within its deadline.
    Timeout { opcode: u8 },
    /// Two keepalive windows elapsed without any inbound frame.
    KeepaliveLost,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::ConnectFailed(detail) => write!(f, "session connect failed: {}", detail),
            SessionError::AuthFailed => write!(f, "login rejected: no user record in response"),
            SessionError::Timeout { opcode } => {
                write!(f, "no response to opcode 0x{:02x} within deadline", opcode)
            }
            SessionError::KeepaliveLost => {
                write!(f, "no inbound frames for two keepalive windows")
            }
        }
    }
}

impl std::error::Error for SessionError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Error,
}

// -------------------- Login hash --------------------

/// The salted credential digest the LOGIN payload carries:
/// `base64(SHA-256(lowercase(email) || password))`.
pub fn login_hash(email: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.to_lowercase().as_bytes());
    hasher.update(password.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

// -------------------- Session --------------------

pub struct Session<T: FrameTransport> {
    transport: T,
    counter: MsgCounter,
    state: SessionState,
    last_send: Instant,
    last_inbound: Instant,
    opened_at: Instant,
    /// Telemetry that arrived while a `send_await` was pending.
    pending_updates: VecDeque<WidgetUpdate>,
}

/// Run the cookie capture and socket open against the production endpoints.
pub fn open_vendor_session() -> Result<Session<WsTransport>> {
    let cookies = fetch_login_cookies(LOGIN_PAGE_URL)
        .map_err(|e| SessionError::ConnectFailed(format!("{:#}", e)))?;
    log::debug!("captured {} login cookie(s)", cookies.split("; ").count());
    let transport = WsTransport::connect(WS_URL, &cookies)
        .map_err(|e| SessionError::ConnectFailed(format!("{:#}", e)))?;
    Ok(Session::new(transport))
}

impl<T: FrameTransport> Session<T> {
    pub fn new(transport: T) -> Self {
        let now = Instant::now();
        Self {
            transport,
            counter: MsgCounter::new(),
            state: SessionState::Handshaking,
            last_send: now,
            last_inbound: now,
            opened_at: now,
            pending_updates: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Time since the socket was opened; drives planned session recycling.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Optional client announcement. The official web client skips this and
    /// the service behaves identically either way.
    pub fn init(&mut self) -> Result<()> {
        let body = json!({
            "clientType": CLIENT_TYPE,
            "version": CLIENT_VERSION,
            "locale": CLIENT_LOCALE,
        });
        self.send_await(OP_INIT, RequestBody::Json(body), AWAIT_TIMEOUT)?;
        Ok(())
    }

    /// LOGIN with the salted hash. Returns the user record. Any outcome
    /// without a user record is `AuthFailed` and must not be retried.
    pub fn login(&mut self, email: &str, password: &str) -> Result<Value> {
        self.state = SessionState::Handshaking;
        let body = json!({
            "email": email,
            "hash": login_hash(email, password),
            "clientType": CLIENT_TYPE,
            "version": CLIENT_VERSION,
            "locale": CLIENT_LOCALE,
        });
        let frame = match self.send_await(OP_LOGIN, RequestBody::Json(body), AWAIT_TIMEOUT) {
            Ok(frame) => frame,
            Err(e) => {
                if matches!(
                    e.downcast_ref::<SessionError>(),
                    Some(SessionError::Timeout { .. })
                ) {
                    self.state = SessionState::Error;
                    return Err(SessionError::AuthFailed.into());
                }
                self.state = SessionState::Error;
                return Err(e);
            }
        };
        match frame.body {
            ResponseBody::Json(user) => {
                self.state = SessionState::Ready;
                log::info!("logged in as {}", email);
                Ok(user)
            }
            _ => {
                self.state = SessionState::Error;
                Err(SessionError::AuthFailed.into())
            }
        }
    }

    /// DEVICE_QUERY with the fixed filter block the vendor app sends.
    pub fn query_devices(&mut self) -> Result<Vec<Device>> {
        let filter = json!({
            "docType": "DEVICE",
            "mode": "MATCH_ALL",
            "viewType": "LIST",
            "filters": [{
                "type": "SUB_SEGMENT",
                "filters": [],
                "mode": "MATCH_ANY",
                "isCurrent": true,
            }],
            "offset": 0,
            "limit": 17,
            "order": "ASC",
            "sortBy": "Name",
        });
        let frame = self.send_await(OP_DEVICE_QUERY, RequestBody::Json(filter), AWAIT_TIMEOUT)?;
        match frame.body {
            ResponseBody::Json(value) => Device::list_from_response(&value),
            other => Err(anyhow!("unexpected device query response: {:?}", other)),
        }
    }

    /// DEVICE_NUMBER (opaque acknowledgement) followed by DEVICE_PAGE.
    pub fn fetch_device_page(&mut self, device_id: i64) -> Result<DevicePage> {
        self.send_await(
            OP_DEVICE_NUMBER,
            RequestBody::Text(device_id.to_string()),
            AWAIT_TIMEOUT,
        )?;
        let params = json!({
            "pageId": DEVICE_PAGE_ID,
            "deviceId": device_id.to_string(),
            "dashboardPageId": Value::Null,
        });
        let frame = self.send_await(OP_DEVICE_PAGE, RequestBody::Json(params), AWAIT_TIMEOUT)?;
        match frame.body {
            ResponseBody::Json(value) => DevicePage::from_response(&value),
            other => Err(anyhow!("unexpected device page response: {:?}", other)),
        }
    }

    /// Send a request and wait for the next inbound frame that is not a
    /// widget update. Telemetry arriving in the meantime is queued for
    /// [`Session::listen`].
    pub fn send_await(
        &mut self,
        opcode: u8,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<Frame> {
        let msg_id = self.counter.next_id();
        self.send_raw(&encode_frame(opcode, msg_id, &body))?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::Timeout { opcode }.into());
            }
            match self.transport.recv(remaining)? {
                None => return Err(SessionError::Timeout { opcode }.into()),
                Some(bytes) => {
                    self.last_inbound = Instant::now();
                    match decode_frame(&bytes) {
                        Ok(frame) => match frame.body {
                            ResponseBody::WidgetUpdate(update) => {
                                self.pending_updates.push_back(update);
                            }
                            _ => return Ok(frame),
                        },
                        Err(e) => log::warn!("dropping malformed frame: {}", e),
                    }
                }
            }
        }
    }

    /// Send without waiting for a response.
    pub fn send_fire(&mut self, opcode: u8, body: RequestBody) -> Result<()> {
        let msg_id = self.counter.next_id();
        self.send_raw(&encode_frame(opcode, msg_id, &body))
    }

    /// Emit a command write. The server never acknowledges these with a
    /// distinguishable frame; callers echo the value to MQTT themselves.
    pub fn send_command(&mut self, device_id: &str, pin: &str, value: &str) -> Result<()> {
        let msg_id = self.counter.next_id();
        self.send_raw(&encode_command(device_id, pin, value, msg_id))?;
        log::debug!("command sent: device={} pin={} value={}", device_id, pin, value);
        Ok(())
    }

    /// Wait up to `timeout` for a widget update. Non-telemetry frames
    /// (keepalive acks, stray responses) refresh the link watchdog and
    /// return `None`; so does a timeout while the link is still live.
    pub fn listen(&mut self, timeout: Duration) -> Result<Option<WidgetUpdate>> {
        if let Some(update) = self.pending_updates.pop_front() {
            return Ok(Some(update));
        }
        match self.transport.recv(timeout) {
            Err(e) => {
                self.state = SessionState::Error;
                Err(e)
            }
            Ok(None) => {
                if self.last_inbound.elapsed() > KEEPALIVE_INTERVAL * KEEPALIVE_MISS_LIMIT {
                    self.state = SessionState::Error;
                    return Err(SessionError::KeepaliveLost.into());
                }
                Ok(None)
            }
            Ok(Some(bytes)) => {
                self.last_inbound = Instant::now();
                match decode_frame(&bytes) {
                    Ok(frame) => match frame.body {
                        ResponseBody::WidgetUpdate(update) => Ok(Some(update)),
                        _ => Ok(None),
                    },
                    Err(e) => {
                        log::warn!("dropping malformed frame: {}", e);
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Send a keepalive if 15 s have passed since the last successful send.
    /// Any outbound traffic resets the window.
    pub fn maybe_keepalive(&mut self) -> Result<()> {
        if self.last_send.elapsed() >= KEEPALIVE_INTERVAL {
            let msg_id = self.counter.next_id();
            self.send_raw(&encode_frame(OP_KEEPALIVE, msg_id, &RequestBody::Empty))?;
            log::trace!("keepalive sent");
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closing;
        self.transport.close();
        self.state = SessionState::Disconnected;
    }

    fn send_raw(&mut self, frame: &[u8]) -> Result<()> {
        self.transport.send(frame)?;
        self.last_send = Instant::now();
        Ok(())
    }

    #[cfg(test)]
    fn backdate_last_send(&mut self, by: Duration) {
        self.last_send -= by;
    }

    #[cfg(test)]
    fn backdate_last_inbound(&mut self, by: Duration) {
        self.last_inbound -= by;
    }

    #[cfg(test)]
    fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameHeader, HEADER_LEN, OP_WIDGET_WRITE};

    /// Scripted transport: pops pre-loaded inbound frames, records sends.
    #[derive(Default)]
    struct ScriptTransport {
        inbound: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        closed: bool,
    }

    impl ScriptTransport {
        fn push_json(&mut self, opcode: u8, msg_id: u16, value: Value) {
            self.inbound
                .push_back(encode_frame(opcode, msg_id, &RequestBody::Json(value)));
        }

        fn push_update(&mut self, device_id: &str, pin: &str, value: &str) {
            self.inbound
                .push_back(encode_command(device_id, pin, value, 0));
        }

        fn sent_headers(&self) -> Vec<FrameHeader> {
            self.sent
                .iter()
                .map(|frame| decode_frame(frame).expect("sent frame decodes").header)
                .collect()
        }
    }

    impl FrameTransport for ScriptTransport {
        fn send(&mut self, frame: &[u8]) -> Result<()> {
            self.sent.push(frame.to_vec());
            Ok(())
        }

        fn recv(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>> {
            Ok(self.inbound.pop_front())
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    #[test]
    fn login_hash_golden_vector() {
        // sha256("user@example.comhunter2"), base64
        assert_eq!(
            login_hash("user@example.com", "hunter2"),
            "ToY0drbakxQZZEFqeYWp8DW7nDVeo3kYKbxEFf0vp4s="
        );
    }

    #[test]
    fn login_hash_lowercases_email_only() {
        assert_eq!(
            login_hash("User@Example.COM", "hunter2"),
            login_hash("user@example.com", "hunter2")
        );
        assert_ne!(
            login_hash("user@example.com", "Hunter2"),
            login_hash("user@example.com", "hunter2")
        );
    }

    #[test]
    fn login_returns_user_record_and_readies_session() {
        let mut transport = ScriptTransport::default();
        transport.push_json(OP_LOGIN, 1, json!({"id": 7, "email": "user@example.com"}));
        let mut session = Session::new(transport);
        let user = session.login("User@Example.com", "pw").expect("login");
        assert_eq!(user["id"], 7);
        assert_eq!(session.state(), SessionState::Ready);

        let sent = session.transport_mut().sent.remove(0);
        let payload: Value =
            serde_json::from_slice(&sent[HEADER_LEN..]).expect("login payload is json");
        assert_eq!(payload["email"], "User@Example.com");
        assert_eq!(payload["hash"], login_hash("User@Example.com", "pw"));
        assert_eq!(payload["clientType"], "web");
    }

    #[test]
    fn login_without_response_is_auth_failed() {
        let mut session = Session::new(ScriptTransport::default());
        let err = session.login("user@example.com", "pw").unwrap_err();
        assert_eq!(
            err.downcast_ref::<SessionError>(),
            Some(&SessionError::AuthFailed)
        );
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn telemetry_during_await_is_queued_not_lost() {
        let mut transport = ScriptTransport::default();
        transport.push_update("51627", "5", "241.29");
        transport.push_json(OP_DEVICE_QUERY, 2, json!([{"deviceId": 51627, "name": "Garage"}]));
        let mut session = Session::new(transport);

        let devices = session.query_devices().expect("devices");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id, 51627);

        let update = session
            .listen(Duration::from_millis(1))
            .expect("listen")
            .expect("queued update");
        assert_eq!(update.widget_id, "5");
        assert_eq!(update.widget_value, "241.29");
    }

    #[test]
    fn device_page_runs_number_then_page_request() {
        let mut transport = ScriptTransport::default();
        transport.push_json(OP_DEVICE_NUMBER, 1, json!({}));
        transport.push_json(
            OP_DEVICE_PAGE,
            2,
            json!({"dashboard": {"widgets": [{"modules": [{"displayDataStreams": [
                {"id": 9, "pin": "15", "name": "Status", "visualization": {"value": "1"}}
            ]}]}]}}),
        );
        let mut session = Session::new(transport);
        let page = session.fetch_device_page(51627).expect("page");
        assert_eq!(page.streams().count(), 1);

        let sent = &session.transport_mut().sent;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0][0], OP_DEVICE_NUMBER);
        assert_eq!(&sent[0][HEADER_LEN..], b"51627");
        let page_params: Value = serde_json::from_slice(&sent[1][HEADER_LEN..]).expect("json");
        assert_eq!(page_params["pageId"], "17948");
        assert_eq!(page_params["deviceId"], "51627");
        assert_eq!(page_params["dashboardPageId"], Value::Null);
    }

    #[test]
    fn outbound_message_ids_are_strictly_increasing() {
        let mut session = Session::new(ScriptTransport::default());
        session.send_command("51627", "15", "2").unwrap();
        session.send_fire(OP_KEEPALIVE, RequestBody::Empty).unwrap();
        session.send_command("51627", "15", "0").unwrap();
        let _ = session.send_await(OP_INIT, RequestBody::Empty, Duration::from_millis(1));

        let headers = session.transport_mut().sent_headers();
        assert_eq!(headers.len(), 4);
        for pair in headers.windows(2) {
            assert!(pair[1].msg_id > pair[0].msg_id);
        }
        assert_eq!(headers[0].opcode, OP_WIDGET_WRITE);
    }

    #[test]
    fn keepalive_fires_only_after_interval() {
        let mut session = Session::new(ScriptTransport::default());
        session.maybe_keepalive().unwrap();
        assert!(session.transport_mut().sent.is_empty());

        session.backdate_last_send(KEEPALIVE_INTERVAL);
        session.maybe_keepalive().unwrap();
        let sent = &session.transport_mut().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], OP_KEEPALIVE);
        assert_eq!(sent[0].len(), HEADER_LEN);
    }

    #[test]
    fn silence_past_two_keepalive_windows_is_an_error() {
        let mut session = Session::new(ScriptTransport::default());
        assert!(session.listen(Duration::from_millis(1)).expect("live").is_none());

        session.backdate_last_inbound(KEEPALIVE_INTERVAL * 2 + Duration::from_secs(1));
        let err = session.listen(Duration::from_millis(1)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<SessionError>(),
            Some(&SessionError::KeepaliveLost)
        );
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn malformed_inbound_frame_is_dropped_not_fatal() {
        let mut transport = ScriptTransport::default();
        let mut bad = vec![OP_WIDGET_WRITE, 0, 1];
        bad.extend_from_slice(b"no separators here");
        transport.inbound.push_back(bad);
        transport.push_update("51627", "15", "2");

        let mut session = Session::new(transport);
        assert!(session.listen(Duration::from_millis(1)).expect("ok").is_none());
        let update = session
            .listen(Duration::from_millis(1))
            .expect("ok")
            .expect("good frame after bad");
        assert_eq!(update.widget_value, "2");
    }
}
