//! Streaming session to the host.
//!
//! Owns one transport at a time. Every control/query call goes through
//! [`Session::exchange`], which on a connection-class failure drops the transport,
//! reconnects to the same endpoint and retries the call exactly once.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use relay_proto::{CommandMap, Frame, FormatId, HEADER_LEN, ProtoError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpSocket;
use tokio::sync::Mutex;

const KEY_CONNECT: &str = "Connect";
const KEY_INTERFACE: &str = "Interface";
const KEY_PLAY: &str = "Play";
const KEY_PAUSE: &str = "Pause";
const KEY_SEEK: &str = "Seek";
const KEY_REQUEST: &str = "Request";
const KEY_STATUS: &str = "Status";
const KEY_LAST_TIME: &str = "LastTime";
const KEY_TAG: &str = "Tag";

const SEEK_QUIT: &str = "Quit";
const SEEK_FRONT: &str = "Front";

/// Byte-stream transport to the host.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Opens transports to one fixed endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<Box<dyn Transport>>;
    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;
}

/// TCP connector, optionally bound to a network interface.
pub struct TcpConnector {
    addr: SocketAddr,
    interface: Option<String>,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr, interface: Option<String>, timeout: Duration) -> Self {
        Self {
            addr,
            interface,
            timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<Box<dyn Transport>> {
        let socket = if self.addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(interface) = self.interface.as_deref() {
            bind_interface(&socket, interface)?;
        }
        let stream = tokio::time::timeout(self.timeout, socket.connect(self.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        match self.interface.as_deref() {
            Some(interface) => format!("{}%{}", self.addr, interface),
            None => self.addr.to_string(),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_interface(socket: &TcpSocket, interface: &str) -> io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_interface(_socket: &TcpSocket, interface: &str) -> io::Result<()> {
    tracing::warn!(interface, "binding to an interface is not supported on this platform");
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connection(io::Error),
    #[error("transport error: {0}")]
    Transport(io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),
    #[error("unexpected {key} value {value:?}")]
    BadValue { key: &'static str, value: String },
    #[error("session is not connected")]
    NotConnected,
    #[error("connection error: {original}; reconnect failed: {reconnect}")]
    Reconnect {
        original: io::Error,
        reconnect: io::Error,
    },
}

impl SessionError {
    /// Classify a transport I/O error.
    fn from_io(err: io::Error) -> Self {
        if is_connection_error(&err) {
            SessionError::Connection(err)
        } else {
            SessionError::Transport(err)
        }
    }
}

fn is_connection_error(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | BrokenPipe
            | UnexpectedEof
            | TimedOut
            | AddrNotAvailable
            | HostUnreachable
            | NetworkUnreachable
            | NetworkDown
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
}

/// Play state reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayStatus {
    Disconnected,
    Playing,
    Paused,
}

/// Response windows for status queries.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub connect: Duration,
    pub status: Duration,
    pub time: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(3000),
            status: Duration::from_millis(500),
            time: Duration::from_millis(1500),
        }
    }
}

/// Frame reader over a transport.
///
/// Bytes are buffered across reads, so abandoning a read on timeout never
/// desynchronises framing.
pub(crate) struct Conn {
    io: Box<dyn Transport>,
    buf: Vec<u8>,
}

impl Conn {
    pub(crate) fn new(io: Box<dyn Transport>) -> Self {
        Self {
            io,
            buf: Vec::new(),
        }
    }

    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.io.write_all(bytes).await?;
        self.io.flush().await
    }

    pub(crate) async fn next_frame(&mut self) -> Result<Frame, SessionError> {
        loop {
            if self.buf.len() >= HEADER_LEN {
                let header = relay_proto::decode_frame_header(&self.buf)?;
                let total = HEADER_LEN + header.length as usize;
                if self.buf.len() >= total {
                    let frame = relay_proto::decode_frame_body(&header, &self.buf[HEADER_LEN..total])?;
                    self.buf.drain(..total);
                    return Ok(frame);
                }
            }
            let mut chunk = [0u8; 4096];
            let n = self.io.read(&mut chunk).await.map_err(SessionError::from_io)?;
            if n == 0 {
                return Err(SessionError::Connection(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "host closed the connection",
                )));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// What to collect after writing a request.
#[derive(Debug, Clone, Copy)]
enum Collect {
    Nothing,
    Status,
    Time,
    Tags,
}

impl Collect {
    /// True once `response` ends the collection window.
    fn is_done(self, response: &CommandMap) -> bool {
        match self {
            Collect::Nothing => true,
            Collect::Status => response.contains_key(KEY_STATUS),
            Collect::Time => {
                response.contains_key(KEY_LAST_TIME)
                    || matches!(
                        response.get(KEY_STATUS).map(String::as_str),
                        Some("Disconnect") | Some("Pause")
                    )
            }
            Collect::Tags => response.keys().any(|k| k != KEY_TAG),
        }
    }
}

async fn perform(
    conn: &mut Conn,
    request: &[u8],
    collect: Collect,
    window: Duration,
) -> Result<Vec<CommandMap>, SessionError> {
    conn.write_all(request).await.map_err(SessionError::from_io)?;
    if matches!(collect, Collect::Nothing) {
        return Ok(Vec::new());
    }

    let mut responses = Vec::new();
    let gather = async {
        loop {
            let frame = conn.next_frame().await?;
            let response = relay_proto::command_from_frame(&frame)?;
            let done = collect.is_done(&response);
            responses.push(response);
            if done {
                return Ok::<(), SessionError>(());
            }
        }
    };
    match tokio::time::timeout(window, gather).await {
        Ok(result) => result?,
        // The tag window simply closes; status queries need an answer.
        Err(_) if matches!(collect, Collect::Tags) => {}
        Err(_) => {
            return Err(SessionError::Connection(io::Error::new(
                io::ErrorKind::TimedOut,
                "no response from host",
            )));
        }
    }
    Ok(responses)
}

pub struct Session {
    connector: Arc<dyn Connector>,
    timeouts: SessionTimeouts,
    conn: Mutex<Option<Conn>>,
    connected: AtomicBool,
    closed: AtomicBool,
    next_id: AtomicU32,
}

impl Session {
    /// Open the transport. The session starts connected.
    pub async fn create(
        connector: Arc<dyn Connector>,
        timeouts: SessionTimeouts,
    ) -> Result<Self, SessionError> {
        let io = connector.connect().await.map_err(SessionError::Connection)?;
        tracing::info!(host = %connector.describe(), "session connected");
        Ok(Self {
            connector,
            timeouts,
            conn: Mutex::new(Some(Conn::new(io))),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn state(&self) -> SessionState {
        if self.connected.load(Ordering::Acquire) {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        }
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn command<I, K, V>(&self, pairs: I) -> Result<Vec<u8>, SessionError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Ok(Frame::command(self.next_id(), pairs).encode()?)
    }

    /// Send `request`, collect responses, and reconnect + retry once on a
    /// connection-class failure.
    async fn exchange(
        &self,
        request: &[u8],
        collect: Collect,
        window: Duration,
    ) -> Result<Vec<CommandMap>, SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::NotConnected);
        }
        let mut guard = self.conn.lock().await;
        let first = match guard.as_mut() {
            Some(conn) => perform(conn, request, collect, window).await,
            None => Err(SessionError::Connection(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport dropped",
            ))),
        };
        let original = match first {
            Err(SessionError::Connection(err)) => err,
            other => return other,
        };

        tracing::warn!(
            host = %self.connector.describe(),
            error = %original,
            "session connection lost; reconnecting"
        );
        *guard = None;
        self.connected.store(false, Ordering::Release);
        let io = match self.connector.connect().await {
            Ok(io) => io,
            Err(reconnect) => {
                tracing::warn!(error = %reconnect, "session reconnect failed");
                return Err(SessionError::Reconnect {
                    original,
                    reconnect,
                });
            }
        };
        self.connected.store(true, Ordering::Release);
        tracing::info!(host = %self.connector.describe(), "session reconnected");

        let conn = guard.insert(Conn::new(io));
        let retried = perform(conn, request, collect, window).await;
        if matches!(retried, Err(SessionError::Connection(_))) {
            *guard = None;
            self.connected.store(false, Ordering::Release);
        }
        retried
    }

    async fn send(&self, request: Vec<u8>) -> Result<(), SessionError> {
        self.exchange(&request, Collect::Nothing, Duration::ZERO)
            .await
            .map(|_| ())
    }

    /// Ask the host to start streaming previously uploaded audio to `target`.
    pub async fn connect_target(
        &self,
        target: &str,
        interface: Option<&str>,
    ) -> Result<(), SessionError> {
        let mut pairs = vec![(KEY_CONNECT, target)];
        if let Some(interface) = interface {
            pairs.push((KEY_INTERFACE, interface));
        }
        let request = self.command(pairs)?;
        self.send(request).await
    }

    pub async fn play(&self) -> Result<(), SessionError> {
        let request = self.command([(KEY_PLAY, "1")])?;
        self.send(request).await
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        let request = self.command([(KEY_PAUSE, "1")])?;
        self.send(request).await
    }

    /// Seek by a signed offset in seconds.
    pub async fn seek_relative(&self, offset_secs: i64) -> Result<(), SessionError> {
        let request = self.command([(KEY_SEEK, format!("{offset_secs:+}"))])?;
        self.send(request).await
    }

    /// Seek to an absolute position in seconds. Position 0 uses the seek-to-start sentinel.
    pub async fn seek_absolute(&self, position_secs: u64) -> Result<(), SessionError> {
        let value = if position_secs == 0 {
            SEEK_FRONT.to_string()
        } else {
            position_secs.to_string()
        };
        let request = self.command([(KEY_SEEK, value)])?;
        self.send(request).await
    }

    /// Stop playback on the target.
    pub async fn quit(&self) -> Result<(), SessionError> {
        let request = self.command([(KEY_SEEK, SEEK_QUIT)])?;
        self.send(request).await
    }

    /// Upload a title tag for the next track.
    pub async fn send_tag(&self, title: &str) -> Result<(), SessionError> {
        let request = Frame::tag(self.next_id(), title).encode()?;
        self.send(request).await
    }

    /// Upload one chunk of PCM described by `format`.
    pub async fn send_audio(&self, format: &FormatId, pcm: &[u8]) -> Result<(), SessionError> {
        let request = Frame::data(self.next_id(), format, pcm).encode()?;
        self.send(request).await
    }

    pub async fn get_play_status(&self) -> Result<PlayStatus, SessionError> {
        let request = self.command([(KEY_REQUEST, KEY_STATUS)])?;
        let responses = self
            .exchange(&request, Collect::Status, self.timeouts.status)
            .await?;
        let value = responses
            .iter()
            .rev()
            .find_map(|r| r.get(KEY_STATUS))
            .map(String::as_str)
            .unwrap_or_default();
        match value {
            "Play" => Ok(PlayStatus::Playing),
            "Pause" => Ok(PlayStatus::Paused),
            "Disconnect" => Ok(PlayStatus::Disconnected),
            other => Err(SessionError::BadValue {
                key: KEY_STATUS,
                value: other.to_string(),
            }),
        }
    }

    /// Seconds remaining in the current track.
    ///
    /// -1 means no track is advancing: either it finished or the target is not
    /// connected. Use [`Session::get_play_status`] to tell the two apart.
    pub async fn get_current_time(&self) -> Result<i64, SessionError> {
        let request = self.command([(KEY_REQUEST, KEY_STATUS)])?;
        let responses = self
            .exchange(&request, Collect::Time, self.timeouts.time)
            .await?;
        match responses.iter().rev().find_map(|r| r.get(KEY_LAST_TIME)) {
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| SessionError::BadValue {
                key: KEY_LAST_TIME,
                value: raw.clone(),
            }),
            None => Ok(-1),
        }
    }

    /// Tags reported by the host in one response window.
    pub async fn get_tag_list(&self) -> Result<Vec<String>, SessionError> {
        let request = self.command([(KEY_REQUEST, KEY_TAG)])?;
        let responses = self
            .exchange(&request, Collect::Tags, self.timeouts.status)
            .await?;
        Ok(responses
            .iter()
            .filter_map(|r| r.get(KEY_TAG).cloned())
            .collect())
    }

    /// Drop the transport. Later calls fail with [`SessionError::NotConnected`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut guard = self.conn.lock().await;
        if let Some(mut conn) = guard.take() {
            let _ = conn.io.shutdown().await;
        }
        self.connected.store(false, Ordering::Release);
        tracing::info!(host = %self.connector.describe(), "session closed");
    }
}
