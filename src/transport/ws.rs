//! Vendor WebSocket transport.
//!
//! The dashboard service authenticates WebSocket upgrades by session cookie:
//! an HTTPS GET against the login page first collects `Set-Cookie` values,
//! then the upgrade request presents them alongside a browser-shaped
//! `User-Agent` and the app `Origin`.

use anyhow::{anyhow, Context, Result};
use std::io::ErrorKind;
use std::net::TcpStream;
use std::time::Duration;
use tungstenite::client::IntoClientRequest;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

pub const WS_URL: &str = "wss://app.eviqo.io/dashws";
pub const LOGIN_PAGE_URL: &str = "https://app.eviqo.io/dashboard/login";
pub const ORIGIN: &str = "https://app.eviqo.io";
pub const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Byte-frame transport the session drives. `recv` returns `Ok(None)` on
/// timeout so callers can interleave keepalives and command handling.
pub trait FrameTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()>;
    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
    fn close(&mut self);
}

/// Fetch the vendor login page and concatenate its `Set-Cookie` values into
/// a single `Cookie` header value. Redirects are not followed so cookies set
/// on a 3xx are kept.
pub fn fetch_login_cookies(url: &str) -> Result<String> {
    let agent = ureq::AgentBuilder::new()
        .redirects(0)
        .timeout(Duration::from_secs(15))
        .build();
    let response = match agent.get(url).call() {
        Ok(response) => response,
        // The service has served cookies on error statuses as well.
        Err(ureq::Error::Status(_, response)) => response,
        Err(e) => return Err(e).context("fetch vendor login page"),
    };
    let cookies: Vec<String> = response
        .all("set-cookie")
        .iter()
        .filter_map(|header| header.split(';').next())
        .map(|cookie| cookie.trim().to_string())
        .filter(|cookie| !cookie.is_empty())
        .collect();
    Ok(cookies.join("; "))
}

pub struct WsTransport {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    /// Open the WebSocket with the captured cookie header.
    pub fn connect(url: &str, cookie: &str) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .context("build websocket request")?;
        let headers = request.headers_mut();
        if !cookie.is_empty() {
            headers.insert("Cookie", cookie.parse().context("cookie header value")?);
        }
        headers.insert("User-Agent", USER_AGENT.parse().expect("static header"));
        headers.insert("Origin", ORIGIN.parse().expect("static header"));

        let (socket, _response) =
            tungstenite::connect(request).context("websocket connect")?;
        Ok(Self { socket })
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        let timeout = Some(timeout.max(Duration::from_millis(1)));
        match self.socket.get_ref() {
            MaybeTlsStream::Plain(stream) => stream.set_read_timeout(timeout)?,
            MaybeTlsStream::Rustls(stream) => stream.get_ref().set_read_timeout(timeout)?,
            _ => {}
        }
        Ok(())
    }
}

impl FrameTransport for WsTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.socket
            .send(Message::Binary(frame.to_vec()))
            .context("websocket send")
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.set_read_timeout(timeout)?;
        loop {
            match self.socket.read() {
                Ok(Message::Binary(bytes)) => return Ok(Some(bytes)),
                Ok(Message::Text(text)) => return Ok(Some(text.into_bytes())),
                Ok(Message::Close(_)) => return Err(anyhow!("websocket closed by peer")),
                Ok(_) => continue,
                Err(tungstenite::Error::Io(e))
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => {
                    return Err(anyhow!("websocket connection closed"));
                }
                Err(e) => return Err(e).context("websocket read"),
            }
        }
    }

    fn close(&mut self) {
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }
}
