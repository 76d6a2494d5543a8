//! High-level client API.

use crate::connection::{take_reply_document, Connection, ConnectionConfig};
use crate::cursor::Cursor;
use crate::error::ClientError;
use crate::handshake::{self, ServerDescription};
use crate::stream::ClientStream;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use vellum_bson::{doc, Document, ObjectId, ObjectIdGenerator};
use vellum_wire::OpMsg;

/// High-level client: commands, cursors, and object id generation over
/// one connection. The reply-dispatching read loop is spawned on
/// creation and stopped by [`Client::close`].
pub struct Client<S = ClientStream> {
    connection: Arc<Connection<S>>,
    generator: Arc<ObjectIdGenerator>,
    read_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Client<ClientStream> {
    /// Connects, performs the handshake, and starts the read loop.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let connection = Arc::new(Connection::connect(config).await?);
        Ok(Self::from_connection(connection))
    }
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> Client<S> {
    /// Wraps an established connection and spawns its read loop. The
    /// handshake, if wanted, must already have run.
    pub fn from_connection(connection: Arc<Connection<S>>) -> Self {
        let loop_connection = connection.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = loop_connection.read_loop().await {
                tracing::debug!("read loop ended: {}", err);
            }
        });
        Client {
            connection,
            generator: Arc::new(ObjectIdGenerator::new()),
            read_task: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Runs a command against a database and returns the reply document.
    /// A reply with `ok` absent or zero becomes a
    /// [`ClientError::ServerError`].
    pub async fn command(&self, db: &str, mut command: Document) -> Result<Document, ClientError> {
        if !command.contains_key("$db") {
            command.insert("$db", db);
        }
        let request_id = self.connection.send(OpMsg::new(command)).await?;
        let reply = self.connection.read_one(request_id).await?;
        let body = take_reply_document(reply)?;
        if !handshake::command_ok(&body) {
            return Err(ClientError::from_command_failure(&body));
        }
        Ok(body)
    }

    /// Runs a cursor-producing command (`find`, `aggregate`, and
    /// friends) and returns a [`Cursor`] over its results.
    pub async fn command_cursor(
        &self,
        db: &str,
        command: Document,
        batch_size: Option<i32>,
    ) -> Result<Cursor<S>, ClientError> {
        let reply = self.command(db, command).await?;
        Cursor::from_command_reply(self.connection.clone(), &reply, batch_size)
    }

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.command("admin", doc! { "ping" => 1 }).await?;
        Ok(())
    }

    /// Generates a fresh object id from the client's process-wide
    /// generator state.
    pub fn new_object_id(&self) -> ObjectId {
        self.generator.generate()
    }

    /// The server description captured during the handshake, if one ran.
    pub fn server_description(&self) -> Option<ServerDescription> {
        self.connection.server_description()
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection<S>> {
        self.connection.clone()
    }

    /// Stops the read loop and closes the connection. Outstanding
    /// requests fail with [`ClientError::ConnectionClosed`].
    pub async fn close(&self) -> Result<(), ClientError> {
        if let Some(handle) = self.read_task.lock().take() {
            handle.abort();
        }
        self.connection.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_test::assert_ok;
    use vellum_wire::{Message, MessageBody};

    fn test_client() -> (Client<DuplexStream>, DuplexStream) {
        let config = ConnectionConfig::new("127.0.0.1:7501".parse().unwrap())
            .with_request_timeout(Duration::from_secs(2));
        let (client_end, server_end) = duplex(64 * 1024);
        let connection = Arc::new(Connection::from_stream(config, client_end));
        (Client::from_connection(connection), server_end)
    }

    async fn read_request(stream: &mut DuplexStream, buf: &mut BytesMut) -> Message {
        loop {
            if let Some(message) = Message::decode(buf).unwrap() {
                return message;
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed while a request was expected");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn reply_to(request_id: i32, body: Document) -> BytesMut {
        Message::new(0, request_id, MessageBody::Msg(OpMsg::new(body)))
            .encode()
            .unwrap()
    }

    fn request_body(message: &Message) -> Document {
        match &message.body {
            MessageBody::Msg(msg) => msg.body().unwrap().clone(),
            other => panic!("expected command message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let (client, mut server) = test_client();

        let server_task = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            let request = read_request(&mut server, &mut buf).await;
            let body = request_body(&request);
            assert_eq!(body.get_i32("ping"), Some(1));
            assert_eq!(body.get_str("$db"), Some("admin"));
            server
                .write_all(&reply_to(request.request_id, doc! { "ok" => 1.0 }))
                .await
                .unwrap();
        });

        tokio_test::assert_ok!(client.ping().await);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_command_preserves_explicit_db() {
        let (client, mut server) = test_client();

        let server_task = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            let request = read_request(&mut server, &mut buf).await;
            let body = request_body(&request);
            assert_eq!(body.get_str("$db"), Some("inventory"));
            server
                .write_all(&reply_to(request.request_id, doc! { "ok" => 1.0 }))
                .await
                .unwrap();
        });

        let command = doc! { "count" => "items", "$db" => "inventory" };
        tokio_test::assert_ok!(client.command("other", command).await);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_command_server_error() {
        let (client, mut server) = test_client();

        tokio::spawn(async move {
            let mut buf = BytesMut::new();
            let request = read_request(&mut server, &mut buf).await;
            let reply = doc! {
                "ok" => 0.0,
                "errmsg" => "ns not found",
                "code" => 26,
                "codeName" => "NamespaceNotFound",
            };
            server
                .write_all(&reply_to(request.request_id, reply))
                .await
                .unwrap();
        });

        let err = client
            .command("db", doc! { "drop" => "missing" })
            .await
            .unwrap_err();
        match err {
            ClientError::ServerError {
                code,
                code_name,
                message,
            } => {
                assert_eq!(code, 26);
                assert_eq!(code_name, "NamespaceNotFound");
                assert_eq!(message, "ns not found");
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_command_cursor_walks_batches() {
        let (client, mut server) = test_client();

        let server_task = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            let find = read_request(&mut server, &mut buf).await;
            assert_eq!(request_body(&find).get_str("find"), Some("items"));
            let first = doc! {
                "ok" => 1.0,
                "cursor" => doc! {
                    "id" => 42i64,
                    "ns" => "db.items",
                    "firstBatch" => vec![doc! { "n" => 1 }, doc! { "n" => 2 }],
                },
            };
            server
                .write_all(&reply_to(find.request_id, first))
                .await
                .unwrap();

            let get_more = read_request(&mut server, &mut buf).await;
            let body = request_body(&get_more);
            assert_eq!(body.get_i64("getMore"), Some(42));
            assert_eq!(body.get_i32("batchSize"), Some(2));
            let second = doc! {
                "ok" => 1.0,
                "cursor" => doc! {
                    "id" => 0i64,
                    "ns" => "db.items",
                    "nextBatch" => vec![doc! { "n" => 3 }],
                },
            };
            server
                .write_all(&reply_to(get_more.request_id, second))
                .await
                .unwrap();
        });

        let mut cursor = client
            .command_cursor("db", doc! { "find" => "items" }, Some(2))
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(doc) = cursor.next().await.unwrap() {
            seen.push(doc.get_i32("n").unwrap());
        }
        assert_eq!(seen, [1, 2, 3]);
        assert!(cursor.is_exhausted());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_rejects_further_commands() {
        let (client, _server) = test_client();
        client.close().await.unwrap();
        assert!(!client.is_connected());
        let err = client.command("db", doc! { "ping" => 1 }).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_new_object_ids_are_distinct() {
        let (client, _server) = test_client();
        let ids: HashSet<ObjectId> = (0..100).map(|_| client.new_object_id()).collect();
        assert_eq!(ids.len(), 100);
    }
}
