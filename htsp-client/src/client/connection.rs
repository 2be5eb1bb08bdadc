//! TCP session management for the HTSP client.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use htsp_protocol::{
    decode_inbound, decode_length, decode_message, encode_message, ClientError, Inbound, Message,
    ProtocolError, HTSP_PROTO_VERSION, LENGTH_PREFIX_SIZE,
};

use crate::client::correlator::{Transport, DEFAULT_RESPONSE_TIMEOUT};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Handshake done, reader not started yet.
    Handshaken,
    Connected,
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub htsp_port: u16,
    /// Port of the HTTP interface, used for recording URLs.
    pub http_port: u16,
    pub username: String,
    pub password: String,
    /// Name announced in `hello` and recorded as timer creator.
    pub client_name: String,
    pub connect_timeout: Duration,
    /// Upper bound for a single round trip.
    pub response_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            htsp_port: 9982,
            http_port: 9981,
            username: String::new(),
            password: String::new(),
            client_name: "htsp-client".to_string(),
            connect_timeout: Duration::from_secs(10),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.htsp_port)
    }
}

/// What the server told us in its `hello` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub protocol_version: u32,
    pub server_name: String,
    pub server_version: String,
    pub challenge: Vec<u8>,
}

/// Receiver of decoded inbound frames, driven by the reader task.
pub trait FrameHandler: Send + Sync {
    /// Called for every frame, in receive order.
    fn on_frame(&self, inbound: Inbound);

    /// Called once the session is gone. May be called more than once.
    fn on_closed(&self);
}

/// Stream and read-ahead left over from the handshake.
struct Handshake {
    stream: TcpStream,
    read_buf: BytesMut,
}

/// Manages the TCP connection to the HTSP server.
pub struct Connection {
    /// Configuration.
    config: ConnectionConfig,
    /// Current state, shared with the reader task.
    state: Arc<Mutex<ConnectionState>>,
    /// Tokio runtime driving the socket; its single worker is the reader thread.
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    /// Socket between handshake and start.
    handshake: Mutex<Option<Handshake>>,
    /// Channel for outbound frames.
    request_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    /// Stops the reader task.
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Handler installed by `start`.
    handler: Mutex<Option<Arc<dyn FrameHandler>>>,
    /// Server details from the handshake.
    server: Mutex<Option<ServerInfo>>,
}

impl Connection {
    /// Create a new connection.
    pub fn new(config: ConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            runtime: Mutex::new(None),
            handshake: Mutex::new(None),
            request_tx: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            handler: Mutex::new(None),
            server: Mutex::new(None),
        })
    }

    /// Get the current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server.lock().clone()
    }

    /// Connect to the server and exchange `hello`.
    ///
    /// Returns the server's details including the negotiated protocol
    /// version. Rejecting old versions is up to the caller.
    pub fn connect(&self) -> Result<ServerInfo, ClientError> {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Disconnected {
                warn!("connect: Already connected or connecting, state = {:?}", *state);
                return Err(ClientError::ConnectionFailed(
                    "connection already in use".to_string(),
                ));
            }
            *state = ConnectionState::Connecting;
        }

        match self.establish() {
            Ok(info) => {
                *self.state.lock() = ConnectionState::Handshaken;
                Ok(info)
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", self.config.server_addr(), e);
                *self.state.lock() = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    fn establish(&self) -> Result<ServerInfo, ClientError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("htsp-reader")
            .enable_all()
            .build()
            .map_err(|e| ClientError::ConnectionFailed(format!("runtime: {}", e)))?;

        let (handshake, info) = runtime.block_on(handshake(&self.config))?;
        info!(
            "Connected to {} {} at {}, protocol version {}",
            info.server_name,
            info.server_version,
            self.config.server_addr(),
            info.protocol_version
        );

        *self.handshake.lock() = Some(handshake);
        *self.server.lock() = Some(info.clone());
        *self.runtime.lock() = Some(runtime);
        Ok(info)
    }

    /// Authenticate with the challenge from `hello`.
    ///
    /// Must be called between `connect` and `start`. A denied login is
    /// reported but leaves the connection open.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<(), ClientError> {
        let challenge = self
            .server
            .lock()
            .as_ref()
            .map(|s| s.challenge.clone())
            .unwrap_or_default();

        let msg = Message::method("authenticate")
            .with_str("username", username)
            .with_bin("digest", auth_digest(password, &challenge));

        let reply = self.handshake_exchange(&msg)?;
        if reply.opt_u32("noaccess")?.unwrap_or(0) != 0 {
            warn!("Server denied access for user '{}'", username);
            return Err(ClientError::AuthenticationFailed(username.to_string()));
        }

        debug!("Authenticated as '{}'", username);
        Ok(())
    }

    fn handshake_exchange(&self, msg: &Message) -> Result<Message, ClientError> {
        let mut handshake = self.handshake.lock();
        let handshake = handshake.as_mut().ok_or(ClientError::NotConnected)?;
        let runtime = self.runtime.lock();
        let runtime = runtime.as_ref().ok_or(ClientError::NotConnected)?;

        runtime.block_on(exchange(
            &mut handshake.stream,
            &mut handshake.read_buf,
            msg,
            self.config.response_timeout,
        ))
    }

    /// Hand the socket to the reader task. Every inbound frame from now on
    /// goes to `handler`.
    pub fn start(&self, handler: Arc<dyn FrameHandler>) -> Result<(), ClientError> {
        let handshake = self
            .handshake
            .lock()
            .take()
            .ok_or(ClientError::NotConnected)?;
        let runtime = self.runtime.lock();
        let runtime = runtime.as_ref().ok_or(ClientError::NotConnected)?;

        let (req_tx, req_rx) = mpsc::unbounded_channel::<Bytes>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        *self.request_tx.lock() = Some(req_tx);
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        *self.handler.lock() = Some(Arc::clone(&handler));
        *self.state.lock() = ConnectionState::Connected;

        let state = Arc::clone(&self.state);
        let Handshake { stream, read_buf } = handshake;
        let (reader, writer) = stream.into_split();

        runtime.spawn(async move {
            debug!("Reader task started");
            if let Err(e) =
                connection_loop(reader, writer, read_buf, req_rx, shutdown_rx, handler.as_ref())
                    .await
            {
                error!("Connection loop error: {}", e);
            }
            *state.lock() = ConnectionState::Disconnected;
            handler.on_closed();
            debug!("Reader task exiting");
        });

        Ok(())
    }

    /// Queue a frame for sending.
    pub fn send(&self, msg: &Message) -> Result<(), ClientError> {
        let frame = encode_message(msg)?;
        let tx = self.request_tx.lock();
        let tx = tx.as_ref().ok_or(ClientError::ConnectionClosed)?;
        tx.send(frame).map_err(|_| {
            debug!("Send on a finished connection");
            ClientError::ConnectionClosed
        })
    }

    /// Close the connection. Safe to call repeatedly and from any thread
    /// outside the runtime.
    pub fn close(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        *self.request_tx.lock() = None;
        *self.handshake.lock() = None;

        let runtime = self.runtime.lock().take();
        if let Some(rt) = runtime {
            rt.shutdown_timeout(Duration::from_secs(1));
        }

        let handler = self.handler.lock().take();
        if let Some(handler) = handler {
            handler.on_closed();
        }

        *self.state.lock() = ConnectionState::Disconnected;
    }
}

impl Transport for Connection {
    fn send(&self, message: &Message) -> Result<(), ClientError> {
        Connection::send(self, message)
    }

    fn reset(&self) {
        warn!("Resetting connection to {}", self.config.server_addr());
        self.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// SHA-1 over password followed by the server challenge.
pub fn auth_digest(password: &str, challenge: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.update(challenge);
    hasher.finalize().to_vec()
}

async fn handshake(config: &ConnectionConfig) -> Result<(Handshake, ServerInfo), ClientError> {
    let addr = config.server_addr();
    debug!("Connecting to {} (timeout {:?})", addr, config.connect_timeout);

    let mut stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
        .await
    {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(ClientError::ConnectionFailed(format!("{}: {}", addr, e))),
        Err(_) => {
            return Err(ClientError::ConnectionFailed(format!(
                "{}: connect timed out",
                addr
            )))
        }
    };
    stream
        .set_nodelay(true)
        .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

    let hello = Message::method("hello")
        .with_u32("htspversion", HTSP_PROTO_VERSION)
        .with_str("clientname", config.client_name.as_str());

    let mut read_buf = BytesMut::with_capacity(65536);
    let reply = exchange(&mut stream, &mut read_buf, &hello, config.response_timeout).await?;

    let info = ServerInfo {
        protocol_version: reply.u32("htspversion")?,
        server_name: reply.opt_str("servername")?.unwrap_or_default().to_string(),
        server_version: reply.opt_str("serverversion")?.unwrap_or_default().to_string(),
        challenge: match reply.get("challenge") {
            Some(_) => reply.bin("challenge")?.to_vec(),
            None => Vec::new(),
        },
    };

    Ok((Handshake { stream, read_buf }, info))
}

/// Write one frame and read one frame back, outside of the reader task.
async fn exchange(
    stream: &mut TcpStream,
    read_buf: &mut BytesMut,
    msg: &Message,
    timeout: Duration,
) -> Result<Message, ClientError> {
    let frame = encode_message(msg)?;
    stream
        .write_all(&frame)
        .await
        .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

    match tokio::time::timeout(timeout, read_message(stream, read_buf)).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout),
    }
}

async fn read_message<R>(reader: &mut R, read_buf: &mut BytesMut) -> Result<Message, ClientError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(body) = take_frame(read_buf)? {
            return Ok(decode_message(body)?);
        }
        let n = reader
            .read_buf(read_buf)
            .await
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
    }
}

/// Split one complete frame body off the front of the buffer.
fn take_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    match decode_length(buf)? {
        Some(body_len) if buf.len() >= LENGTH_PREFIX_SIZE + body_len => {
            buf.advance(LENGTH_PREFIX_SIZE);
            Ok(Some(buf.split_to(body_len).freeze()))
        }
        _ => Ok(None), // Need more data
    }
}

/// Hand every complete frame in the buffer to the handler, in order.
fn dispatch_frames(buf: &mut BytesMut, handler: &dyn FrameHandler) -> Result<(), ProtocolError> {
    let result = (|| -> Result<(), ProtocolError> {
        while let Some(body) = take_frame(buf)? {
            handler.on_frame(decode_inbound(body)?);
        }
        Ok(())
    })();
    if let Err(e) = &result {
        if e.is_malformed() {
            error!("Corrupt frame from server, dropping connection: {}", e);
        } else {
            warn!("Undecodable frame from server: {}", e);
        }
    }
    result
}

/// Main connection loop: writes queued requests, reads and dispatches frames.
///
/// Returns when the peer closes, on the first IO or decode error, or when
/// shutdown is requested.
async fn connection_loop<R, W>(
    mut reader: R,
    mut writer: W,
    mut read_buf: BytesMut,
    mut req_rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown_rx: oneshot::Receiver<()>,
    handler: &dyn FrameHandler,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Frames read during the handshake.
    dispatch_frames(&mut read_buf, handler)?;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("Shutdown requested");
                break;
            }

            // Handle outgoing requests
            Some(frame) = req_rx.recv() => {
                trace!("Sending frame of {} bytes", frame.len());
                writer.write_all(&frame).await?;
            }

            // Handle incoming data
            result = reader.read_buf(&mut read_buf) => {
                let n = result?;
                if n == 0 {
                    info!("Connection closed by server");
                    break;
                }

                dispatch_frames(&mut read_buf, handler)?;
            }
        }
    }

    Ok(())
}
