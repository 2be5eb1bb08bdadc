//! In-process HTSP server for tests.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;

use htsp_protocol::{decode_message, encode_message, Message, ProtocolError, LENGTH_PREFIX_SIZE};

use crate::client::connection::{auth_digest, ConnectionConfig};

pub(crate) const CHALLENGE: &[u8] = b"0123456789abcdef0123456789abcdef";

type Handler = Arc<dyn Fn(&Message) -> Vec<Message> + Send + Sync>;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Empty reply echoing the request's `seq`.
pub(crate) fn reply_to(request: &Message) -> Message {
    match request.seq() {
        Some(seq) => Message::new().with_u32("seq", seq),
        None => Message::new(),
    }
}

pub(crate) struct FakeServerBuilder {
    protocol_version: u32,
    password: Option<String>,
    initial: Vec<Message>,
    sync_completed: bool,
    handler: Option<Handler>,
}

impl FakeServerBuilder {
    pub(crate) fn protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Require this password in `authenticate`.
    pub(crate) fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    /// Push sent during the initial sync.
    pub(crate) fn initial(mut self, push: Message) -> Self {
        self.initial.push(push);
        self
    }

    /// Never send `initialSyncCompleted`.
    pub(crate) fn without_sync_completed(mut self) -> Self {
        self.sync_completed = false;
        self
    }

    /// Answer every other request with whatever `handler` returns.
    pub(crate) fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Message) -> Vec<Message> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub(crate) fn start(self) -> FakeServer {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake server");
        let port = listener.local_addr().expect("local addr").port();

        let shared = Arc::new(Shared {
            settings: self,
            requests: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        let accept_shared = Arc::clone(&shared);
        thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_shared.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(stream) = stream else { continue };
                let shared = Arc::clone(&accept_shared);
                thread::spawn(move || serve(stream, shared));
            }
        });

        FakeServer { port, shared }
    }
}

struct Shared {
    settings: FakeServerBuilder,
    requests: Mutex<Vec<Message>>,
    clients: Mutex<Vec<Arc<Mutex<TcpStream>>>>,
    stopped: AtomicBool,
}

pub(crate) struct FakeServer {
    port: u16,
    shared: Arc<Shared>,
}

impl FakeServer {
    pub(crate) fn builder() -> FakeServerBuilder {
        FakeServerBuilder {
            protocol_version: 5,
            password: None,
            initial: Vec::new(),
            sync_completed: true,
            handler: None,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: "127.0.0.1".to_string(),
            htsp_port: self.port,
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Every request received so far, across connections.
    pub(crate) fn requests(&self) -> Vec<Message> {
        self.shared.requests.lock().clone()
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        self.shared
            .requests
            .lock()
            .iter()
            .filter(|m| m.method_name() == Some(method))
            .count()
    }

    /// Block until `method` has been received `n` times in total.
    pub(crate) fn wait_for(&self, method: &str, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.count(method) < n {
            assert!(Instant::now() < deadline, "never received '{}'", method);
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Send a frame to every connected client.
    pub(crate) fn push(&self, msg: &Message) {
        for client in self.shared.clients.lock().iter() {
            let _ = write_frame(&mut client.lock(), msg);
        }
    }

    /// Write raw bytes to every connected client.
    pub(crate) fn push_raw(&self, bytes: &[u8]) {
        for client in self.shared.clients.lock().iter() {
            let _ = client.lock().write_all(bytes);
        }
    }

    /// Drop every client connection.
    pub(crate) fn disconnect(&self) {
        for client in self.shared.clients.lock().drain(..) {
            let _ = client.lock().shutdown(Shutdown::Both);
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.disconnect();
        // Wake the accept loop.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
    }
}

fn io_error(e: ProtocolError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

fn write_frame(stream: &mut TcpStream, msg: &Message) -> std::io::Result<()> {
    let frame = encode_message(msg).map_err(io_error)?;
    stream.write_all(&frame)
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Message> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    stream.read_exact(&mut prefix)?;
    let mut body = vec![0u8; u32::from_be_bytes(prefix) as usize];
    stream.read_exact(&mut body)?;
    decode_message(Bytes::from(body)).map_err(io_error)
}

fn serve(stream: TcpStream, shared: Arc<Shared>) {
    let mut reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(_) => return,
    };
    let writer = Arc::new(Mutex::new(stream));
    shared.clients.lock().push(Arc::clone(&writer));

    while let Ok(request) = read_frame(&mut reader) {
        shared.requests.lock().push(request.clone());
        let settings = &shared.settings;

        let replies = match request.method_name().unwrap_or_default() {
            "hello" => vec![reply_to(&request)
                .with_u32("htspversion", settings.protocol_version)
                .with_str("servername", "fake-tvheadend")
                .with_str("serverversion", "0.0.1")
                .with_bin("challenge", CHALLENGE)],
            "authenticate" => {
                let granted = match &settings.password {
                    Some(password) => {
                        request.bin("digest").ok() == Some(&auth_digest(password, CHALLENGE)[..])
                    }
                    None => true,
                };
                let reply = reply_to(&request);
                vec![if granted {
                    reply
                } else {
                    reply.with_u32("noaccess", 1)
                }]
            }
            "enableAsyncMetadata" => {
                let mut replies = vec![reply_to(&request)];
                replies.extend(settings.initial.iter().cloned());
                if settings.sync_completed {
                    replies.push(Message::method("initialSyncCompleted"));
                }
                replies
            }
            _ => match &settings.handler {
                Some(handler) => handler(&request),
                None => Vec::new(),
            },
        };

        let mut writer = writer.lock();
        for reply in &replies {
            if write_frame(&mut writer, reply).is_err() {
                return;
            }
        }
    }
    debug!("Fake server connection closed");
}
