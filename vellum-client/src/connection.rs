//! Connection management and request correlation.
//!
//! A [`Connection`] owns one stream, split into halves: requests are
//! written under a writer lock, replies are pulled off the reader by a
//! single [`Connection::read_loop`] and matched to waiters by the
//! `response_to` field. Sending and reading a reply are separate steps
//! ([`Connection::send`] hands back the request id,
//! [`Connection::read_one`] claims the reply), so callers may pipeline
//! requests and collect replies in any order.

use crate::error::ClientError;
use crate::handshake::{self, ServerDescription};
use crate::stream::ClientStream;
use crate::tls::{insecure_tls_connector, tls_connector};
use bytes::BytesMut;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use vellum_bson::{Document, UuidRepresentation};
use vellum_wire::{Compressor, Message, MessageBody, OpMsg, Section};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// TLS settings for client connections.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// PEM-encoded CA certificate(s) for server verification. Bundled
    /// webpki roots are used when unset.
    pub ca_cert_path: Option<PathBuf>,
    /// PEM-encoded client certificate (for mutual TLS).
    pub client_cert_path: Option<PathBuf>,
    /// PEM-encoded client private key (for mutual TLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification. Development only.
    pub insecure: bool,
    /// Server name for SNI. Defaults to the host part of the address.
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self.enabled = true;
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self.enabled = true;
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self.enabled = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Per-request reply timeout.
    pub request_timeout: Duration,
    /// Application name reported in the handshake.
    pub app_name: Option<String>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Compressors offered during the handshake, in preference order.
    pub compressors: Vec<Compressor>,
    /// Append a CRC32C to every outbound command message.
    pub checksums: bool,
    /// Byte order callers should use when encoding UUID values.
    pub uuid_representation: UuidRepresentation,
    /// TLS settings (optional).
    pub tls: Option<TlsConfig>,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            app_name: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            compressors: vec![Compressor::Zstd, Compressor::Snappy, Compressor::Zlib],
            checksums: false,
            uuid_representation: UuidRepresentation::Standard,
            tls: None,
        }
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    /// Replaces the offered compressor list. An empty list disables
    /// compression entirely.
    pub fn with_compressors(mut self, compressors: Vec<Compressor>) -> Self {
        self.compressors = compressors;
        self
    }

    pub fn with_checksums(mut self) -> Self {
        self.checksums = true;
        self
    }

    pub fn with_uuid_representation(mut self, representation: UuidRepresentation) -> Self {
        self.uuid_representation = representation;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

type ReplySender = oneshot::Sender<Result<Message, ClientError>>;
type ReplyReceiver = oneshot::Receiver<Result<Message, ClientError>>;

/// A connection to a server, generic over the transport so tests can run
/// it over in-memory pipes.
#[derive(Debug)]
pub struct Connection<S> {
    config: ConnectionConfig,
    /// Write half of the stream (for sending requests).
    writer: Mutex<Option<WriteHalf<S>>>,
    /// Read half of the stream (owned by the read loop).
    reader: Mutex<Option<ReadHalf<S>>>,
    /// Bytes read but not yet framed.
    read_buf: Mutex<BytesMut>,
    /// Reply slots the read loop completes, keyed by request id.
    pending: DashMap<i32, ReplySender>,
    /// Unclaimed reply receivers, keyed by request id.
    replies: DashMap<i32, ReplyReceiver>,
    /// Next request id; wraps on overflow.
    next_id: AtomicI32,
    connected: AtomicBool,
    /// Compressor negotiated in the handshake, if any.
    compressor: parking_lot::Mutex<Option<Compressor>>,
    /// Description the server sent in its hello reply.
    server: parking_lot::Mutex<Option<ServerDescription>>,
}

impl Connection<ClientStream> {
    /// Dials the configured address, upgrades to TLS when configured, and
    /// performs the handshake.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        tracing::debug!("connecting to {}", config.addr);
        let tcp = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(ClientError::Io)?;
        tcp.set_nodelay(true).ok();

        let stream = match config.tls {
            Some(ref tls) if tls.enabled => {
                let host = config.addr.ip().to_string();
                let (connector, server_name) = if tls.insecure {
                    tracing::warn!("TLS certificate verification is disabled");
                    insecure_tls_connector(tls, &host)?
                } else {
                    tls_connector(tls, &host)?
                };
                let tls_stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
                tracing::debug!("TLS handshake complete");
                ClientStream::Tls { stream: tls_stream }
            }
            _ => ClientStream::Plain { stream: tcp },
        };

        let connection = Self::from_stream(config, stream);
        connection.handshake().await?;
        Ok(connection)
    }
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    /// Wraps an already-established stream. No handshake is performed;
    /// call [`Connection::handshake`] for that.
    pub fn from_stream(config: ConnectionConfig, stream: S) -> Self {
        let read_buffer_size = config.read_buffer_size;
        let (read_half, write_half) = tokio::io::split(stream);
        Connection {
            config,
            writer: Mutex::new(Some(write_half)),
            reader: Mutex::new(Some(read_half)),
            read_buf: Mutex::new(BytesMut::with_capacity(read_buffer_size)),
            pending: DashMap::new(),
            replies: DashMap::new(),
            next_id: AtomicI32::new(1),
            connected: AtomicBool::new(true),
            compressor: parking_lot::Mutex::new(None),
            server: parking_lot::Mutex::new(None),
        }
    }

    /// Sends `hello`, validates the reply, and adopts the negotiated
    /// compressor for all subsequent traffic. Must run before the read
    /// loop is spawned: the reply is read directly off the stream.
    pub async fn handshake(&self) -> Result<ServerDescription, ClientError> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let hello = handshake::build_hello(&self.config);
        // Never compressed or checksummed; the peer's capabilities are not
        // known yet.
        let encoded = Message::msg(request_id, OpMsg::new(hello)).encode()?;
        tracing::debug!("sending hello (request {})", request_id);
        self.write_message(&encoded).await?;

        let reply = loop {
            let message = self.read_direct().await?;
            if message.response_to == request_id {
                break message;
            }
            tracing::warn!(
                "unsolicited message during handshake (response_to {})",
                message.response_to
            );
        };
        let body = take_reply_document(reply)?;
        if !handshake::command_ok(&body) {
            return Err(ClientError::from_command_failure(&body));
        }
        let description = ServerDescription::from_hello(&body);
        description.check_wire_version()?;

        let negotiated =
            handshake::negotiate_compressor(&self.config.compressors, &description.compression);
        match negotiated {
            Some(compressor) => tracing::debug!("negotiated {} compression", compressor.name()),
            None => tracing::debug!("no mutual compressor, traffic stays uncompressed"),
        }
        *self.compressor.lock() = negotiated;
        *self.server.lock() = Some(description.clone());
        Ok(description)
    }

    /// Sends a command message and returns its request id. A reply slot is
    /// registered before the first byte is written, so the reply cannot
    /// slip past the read loop. Claim it with [`Connection::read_one`].
    pub async fn send(&self, body: OpMsg) -> Result<i32, ClientError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        let body = if self.config.checksums {
            body.with_checksum()
        } else {
            body
        };
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = Message::msg(request_id, body);
        let encoded = match self.compressor() {
            Some(compressor) => message.encode_compressed(compressor)?,
            None => message.encode()?,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        self.replies.insert(request_id, rx);

        if let Err(err) = self.write_message(&encoded).await {
            self.pending.remove(&request_id);
            self.replies.remove(&request_id);
            return Err(err);
        }
        tracing::debug!("request {} sent ({} bytes)", request_id, encoded.len());
        Ok(request_id)
    }

    /// Sends a notification nobody will wait for. The more-to-come flag is
    /// set so the server does not produce a reply.
    pub async fn fire_and_forget(&self, body: OpMsg) -> Result<i32, ClientError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        let body = if self.config.checksums {
            body.with_checksum()
        } else {
            body
        };
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = Message::msg(request_id, body.with_more_to_come());
        let encoded = match self.compressor() {
            Some(compressor) => message.encode_compressed(compressor)?,
            None => message.encode()?,
        };
        self.write_message(&encoded).await?;
        tracing::debug!("notification {} sent ({} bytes)", request_id, encoded.len());
        Ok(request_id)
    }

    /// Awaits the reply to an earlier [`Connection::send`], under the
    /// request timeout.
    pub async fn read_one(&self, request_id: i32) -> Result<Message, ClientError> {
        let (_, rx) = self
            .replies
            .remove(&request_id)
            .ok_or(ClientError::UnknownRequest { request_id })?;
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("request {} timed out", request_id);
                self.pending.remove(&request_id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Reads and dispatches replies. Run this in a background task; it
    /// returns with the error that ended the stream.
    ///
    /// A reply that fails to parse fails only the request it answers. A
    /// frame that cannot even be split off the stream, and any socket
    /// error or EOF, fails every outstanding request.
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        let mut chunk = vec![0u8; self.config.read_buffer_size];
        loop {
            let n = {
                let mut reader_guard = self.reader.lock().await;
                let reader = reader_guard.as_mut().ok_or(ClientError::NotConnected)?;
                match reader.read(&mut chunk).await {
                    Ok(n) => n,
                    Err(err) => {
                        drop(reader_guard);
                        tracing::debug!("read loop socket error: {}", err);
                        self.connected.store(false, Ordering::SeqCst);
                        self.fail_all_pending();
                        return Err(ClientError::Io(err));
                    }
                }
            };
            if n == 0 {
                tracing::debug!("read loop got EOF");
                self.connected.store(false, Ordering::SeqCst);
                self.fail_all_pending();
                return Err(ClientError::ConnectionClosed);
            }

            let mut buf = self.read_buf.lock().await;
            buf.extend_from_slice(&chunk[..n]);
            loop {
                let raw = match Message::split_frame(&mut buf) {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break,
                    Err(err) => {
                        // The stream cannot be realigned past a bad length
                        // prefix.
                        drop(buf);
                        tracing::debug!("unrecoverable framing error: {}", err);
                        self.connected.store(false, Ordering::SeqCst);
                        self.fail_all_pending();
                        return Err(err.into());
                    }
                };
                match raw.parse() {
                    Ok(message) => {
                        let response_to = message.response_to;
                        match self.pending.remove(&response_to) {
                            Some((_, tx)) => {
                                let _ = tx.send(Ok(message));
                            }
                            None => {
                                tracing::warn!("reply for unknown request {}", response_to)
                            }
                        }
                    }
                    Err(err) => match self.pending.remove(&raw.response_to()) {
                        Some((_, tx)) => {
                            let _ = tx.send(Err(err.into()));
                        }
                        None => tracing::warn!(
                            "malformed reply for unknown request {}: {}",
                            raw.response_to(),
                            err
                        ),
                    },
                }
            }
        }
    }

    /// Reads one message straight off the stream. Only used before the
    /// read loop exists (handshake).
    async fn read_direct(&self) -> Result<Message, ClientError> {
        tokio::time::timeout(self.config.request_timeout, async {
            let mut chunk = vec![0u8; self.config.read_buffer_size];
            loop {
                {
                    let mut buf = self.read_buf.lock().await;
                    if let Some(raw) = Message::split_frame(&mut buf)? {
                        return raw.parse().map_err(ClientError::from);
                    }
                }
                let n = {
                    let mut reader_guard = self.reader.lock().await;
                    let reader = reader_guard.as_mut().ok_or(ClientError::NotConnected)?;
                    reader.read(&mut chunk).await.map_err(ClientError::Io)?
                };
                if n == 0 {
                    return Err(ClientError::ConnectionClosed);
                }
                self.read_buf.lock().await.extend_from_slice(&chunk[..n]);
            }
        })
        .await
        .map_err(|_| ClientError::Timeout)?
    }

    async fn write_message(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(bytes).await.map_err(ClientError::Io)?;
        writer.flush().await.map_err(ClientError::Io)?;
        Ok(())
    }

    /// Drops every reply slot; their waiters see the connection as closed.
    fn fail_all_pending(&self) {
        let outstanding = self.pending.len();
        if outstanding > 0 {
            tracing::debug!("failing {} outstanding requests", outstanding);
        }
        self.pending.clear();
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns the number of requests whose replies have not arrived.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The compressor negotiated in the handshake, if any.
    pub fn compressor(&self) -> Option<Compressor> {
        *self.compressor.lock()
    }

    /// The server description from the handshake, if one has run.
    pub fn server_description(&self) -> Option<ServerDescription> {
        self.server.lock().clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Closes the connection and cancels all outstanding requests.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let _ = self.reader.lock().await.take();
        self.fail_all_pending();
        self.replies.clear();
        tracing::debug!("connection closed");
        Ok(())
    }
}

/// Pulls the command reply document out of a message: the body section of
/// a multi-section reply, or the first document of a legacy reply. Legacy
/// error flags become typed errors here.
pub(crate) fn take_reply_document(message: Message) -> Result<Document, ClientError> {
    match message.body {
        MessageBody::Msg(msg) => msg
            .sections
            .into_iter()
            .find_map(|section| match section {
                Section::Body(doc) => Some(doc),
                Section::Sequence(_) => None,
            })
            .ok_or_else(|| ClientError::UnexpectedReply("reply carries no body section".into())),
        MessageBody::Reply(reply) => {
            if reply.flags.has_cursor_not_found() {
                return Err(ClientError::CursorNotFound {
                    cursor_id: reply.cursor_id,
                });
            }
            let failed = reply.flags.has_query_failure();
            let doc = reply.documents.into_iter().next().ok_or_else(|| {
                ClientError::UnexpectedReply("legacy reply carries no documents".into())
            })?;
            if failed {
                return Err(ClientError::ServerError {
                    code: doc.get_integer("code").unwrap_or(0) as i32,
                    code_name: String::new(),
                    message: doc.get_str("$err").unwrap_or("query failure").to_string(),
                });
            }
            Ok(doc)
        }
        other => Err(ClientError::UnexpectedReply(format!(
            "unexpected {:?} reply",
            other.op_code()
        ))),
    }
}
