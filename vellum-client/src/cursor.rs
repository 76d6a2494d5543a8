//! Batched iteration over server-side cursors.
//!
//! A [`Cursor`] holds one batch of documents at a time. [`Cursor::next`]
//! walks the batch and fetches the next one from the server when the
//! current batch runs dry; [`Cursor::ahead`] and [`Cursor::back`] move
//! the position within the held batch without touching the network.

use crate::connection::{take_reply_document, Connection};
use crate::error::ClientError;
use crate::handshake;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use vellum_bson::{doc, Document, Value};
use vellum_wire::{OpMsg, Reply};

/// Where the cursor stands relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    /// The server holds more results; get-more requests are allowed.
    Active,
    /// The server already sent everything; the held batch is the rest.
    SingleBatch,
    /// Fully drained or closed.
    Exhausted,
}

/// A batched result cursor tied to one connection.
#[derive(Debug)]
pub struct Cursor<S> {
    connection: Arc<Connection<S>>,
    db: String,
    collection: String,
    cursor_id: i64,
    batch: Vec<Document>,
    pos: usize,
    batch_size: Option<i32>,
    state: CursorState,
}

impl<S: AsyncRead + AsyncWrite> Cursor<S> {
    /// Seeds a cursor from a command reply of the shape
    /// `{ cursor: { id, ns, firstBatch } }`.
    pub(crate) fn from_command_reply(
        connection: Arc<Connection<S>>,
        reply: &Document,
        batch_size: Option<i32>,
    ) -> Result<Self, ClientError> {
        let cursor = reply
            .get_document("cursor")
            .ok_or_else(|| ClientError::UnexpectedReply("reply carries no cursor".into()))?;
        let cursor_id = cursor
            .get_i64("id")
            .ok_or_else(|| ClientError::UnexpectedReply("cursor is missing its id".into()))?;
        let namespace = cursor
            .get_str("ns")
            .ok_or_else(|| ClientError::UnexpectedReply("cursor is missing its namespace".into()))?;
        let (db, collection) = split_namespace(namespace)?;
        let batch = cursor
            .get_array("firstBatch")
            .map(batch_documents)
            .transpose()?
            .unwrap_or_default();

        Ok(Cursor {
            connection,
            db,
            collection,
            cursor_id,
            batch,
            pos: 0,
            batch_size,
            state: initial_state(cursor_id),
        })
    }

    /// Seeds a cursor from a legacy reply. The namespace comes from the
    /// query that produced it; legacy replies do not echo it back.
    pub(crate) fn from_legacy_reply(
        connection: Arc<Connection<S>>,
        namespace: &str,
        reply: Reply,
        batch_size: Option<i32>,
    ) -> Result<Self, ClientError> {
        if reply.flags.has_cursor_not_found() {
            return Err(ClientError::CursorNotFound {
                cursor_id: reply.cursor_id,
            });
        }
        if reply.flags.has_query_failure() {
            let doc = reply.documents.into_iter().next();
            return Err(ClientError::ServerError {
                code: doc.as_ref().and_then(|d| d.get_integer("code")).unwrap_or(0) as i32,
                code_name: String::new(),
                message: doc
                    .as_ref()
                    .and_then(|d| d.get_str("$err"))
                    .unwrap_or("query failure")
                    .to_string(),
            });
        }
        let (db, collection) = split_namespace(namespace)?;

        Ok(Cursor {
            connection,
            db,
            collection,
            cursor_id: reply.cursor_id,
            batch: reply.documents,
            pos: 0,
            batch_size,
            state: initial_state(reply.cursor_id),
        })
    }

    /// Returns the next document, fetching another batch when the held
    /// one is drained. `Ok(None)` marks the end of the result set.
    pub async fn next(&mut self) -> Result<Option<Document>, ClientError> {
        loop {
            if self.pos < self.batch.len() {
                let doc = self.batch[self.pos].clone();
                self.pos += 1;
                return Ok(Some(doc));
            }
            match self.state {
                CursorState::Active => self.get_more().await?,
                CursorState::SingleBatch | CursorState::Exhausted => {
                    self.state = CursorState::Exhausted;
                    return Ok(None);
                }
            }
        }
    }

    /// Moves forward `n` documents within the held batch.
    pub fn ahead(&mut self, n: usize) -> Result<(), ClientError> {
        let available = self.batch.len() - self.pos;
        if n > available {
            return Err(ClientError::CursorPosition {
                requested: n,
                available,
            });
        }
        self.pos += n;
        Ok(())
    }

    /// Moves back `n` documents within the held batch.
    pub fn back(&mut self, n: usize) -> Result<(), ClientError> {
        if n > self.pos {
            return Err(ClientError::CursorPosition {
                requested: n,
                available: self.pos,
            });
        }
        self.pos -= n;
        Ok(())
    }

    async fn get_more(&mut self) -> Result<(), ClientError> {
        let mut command = doc! {
            "getMore" => self.cursor_id,
            "collection" => self.collection.as_str(),
            "$db" => self.db.as_str(),
        };
        if let Some(size) = self.batch_size {
            command.insert("batchSize", size);
        }

        // A failed write never reached the server, so one resend is
        // safe. A failure after the write is not: the get-more may have
        // advanced the cursor already.
        let request_id = match self.connection.send(OpMsg::new(command.clone())).await {
            Ok(id) => id,
            Err(err) if err.is_retryable() => {
                tracing::debug!("resending get-more after send failure: {}", err);
                self.connection.send(OpMsg::new(command)).await?
            }
            Err(err) => return Err(err),
        };
        let reply = self.connection.read_one(request_id).await?;
        let body = take_reply_document(reply)?;
        if !handshake::command_ok(&body) {
            return Err(ClientError::from_command_failure(&body));
        }

        let cursor = body
            .get_document("cursor")
            .ok_or_else(|| ClientError::UnexpectedReply("get-more reply carries no cursor".into()))?;
        let cursor_id = cursor
            .get_i64("id")
            .ok_or_else(|| ClientError::UnexpectedReply("cursor is missing its id".into()))?;
        self.batch = cursor
            .get_array("nextBatch")
            .map(batch_documents)
            .transpose()?
            .unwrap_or_default();
        self.pos = 0;
        self.cursor_id = cursor_id;
        if cursor_id == 0 {
            self.state = CursorState::SingleBatch;
        }
        Ok(())
    }

    /// Releases the server-side cursor. Best effort: the kill request is
    /// sent as a notification and failures are only logged.
    pub async fn close(&mut self) {
        if self.state == CursorState::Active && self.cursor_id != 0 {
            let command = doc! {
                "killCursors" => self.collection.as_str(),
                "cursors" => vec![self.cursor_id],
                "$db" => self.db.as_str(),
            };
            if let Err(err) = self.connection.fire_and_forget(OpMsg::new(command)).await {
                tracing::debug!("kill cursors for {} failed: {}", self.cursor_id, err);
            }
        }
        self.state = CursorState::Exhausted;
        self.batch.clear();
        self.pos = 0;
    }

    /// The server-side cursor id; zero once the server is drained.
    pub fn id(&self) -> i64 {
        self.cursor_id
    }

    /// The `db.collection` namespace the cursor reads from.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.db, self.collection)
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == CursorState::Exhausted
    }

    /// Documents still held locally, ahead of the current position.
    pub fn buffered(&self) -> usize {
        self.batch.len() - self.pos
    }
}

fn initial_state(cursor_id: i64) -> CursorState {
    if cursor_id == 0 {
        CursorState::SingleBatch
    } else {
        CursorState::Active
    }
}

fn split_namespace(namespace: &str) -> Result<(String, String), ClientError> {
    match namespace.split_once('.') {
        Some((db, collection)) if !db.is_empty() && !collection.is_empty() => {
            Ok((db.to_string(), collection.to_string()))
        }
        _ => Err(ClientError::UnexpectedReply(format!(
            "malformed namespace {namespace:?}"
        ))),
    }
}

fn batch_documents(values: &[Value]) -> Result<Vec<Document>, ClientError> {
    values
        .iter()
        .map(|value| match value {
            Value::Document(doc) => Ok(doc.clone()),
            _ => Err(ClientError::UnexpectedReply(
                "cursor batch holds a non-document".into(),
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use vellum_bson::doc;
    use vellum_wire::{Message, MessageBody, ReplyFlags};

    fn test_config() -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1:7501".parse().unwrap())
            .with_request_timeout(Duration::from_secs(2))
    }

    fn connected_pair() -> (Arc<Connection<DuplexStream>>, DuplexStream) {
        let (client_end, server_end) = duplex(64 * 1024);
        (
            Arc::new(Connection::from_stream(test_config(), client_end)),
            server_end,
        )
    }

    fn spawn_read_loop(connection: &Arc<Connection<DuplexStream>>) {
        let connection = connection.clone();
        tokio::spawn(async move {
            let _ = connection.read_loop().await;
        });
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

    fn seeded(
        connection: Arc<Connection<DuplexStream>>,
        cursor_id: i64,
        batch: Vec<Document>,
    ) -> Cursor<DuplexStream> {
        let docs: Vec<Value> = batch.into_iter().map(Value::from).collect();
        let reply = doc! {
            "ok" => 1.0,
            "cursor" => doc! {
                "id" => cursor_id,
                "ns" => "db.items",
                "firstBatch" => docs,
            },
        };
        Cursor::from_command_reply(connection, &reply, None).unwrap()
    }

    #[tokio::test]
    async fn test_single_batch_drains_without_get_more() {
        let (connection, mut server) = connected_pair();
        let mut cursor = seeded(
            connection,
            0,
            vec![doc! { "n" => 1 }, doc! { "n" => 2 }, doc! { "n" => 3 }],
        );

        for expected in 1..=3 {
            let doc = cursor.next().await.unwrap().unwrap();
            assert_eq!(doc.get_i32("n"), Some(expected));
        }
        assert!(cursor.next().await.unwrap().is_none());
        assert!(cursor.next().await.unwrap().is_none());
        assert!(cursor.is_exhausted());

        // Nothing may have touched the wire.
        let mut chunk = [0u8; 64];
        let quiet = tokio::time::timeout(Duration::from_millis(50), server.read(&mut chunk)).await;
        assert!(quiet.is_err(), "cursor sent traffic for a single batch");
    }

    #[tokio::test]
    async fn test_get_more_until_exhausted() {
        let (connection, mut server) = connected_pair();
        spawn_read_loop(&connection);
        let mut cursor = seeded(
            connection,
            42,
            vec![doc! { "n" => 1 }, doc! { "n" => 2 }],
        );

        let server_task = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            let request = read_request(&mut server, &mut buf).await;
            let body = request_body(&request);
            assert_eq!(body.get_i64("getMore"), Some(42));
            assert_eq!(body.get_str("collection"), Some("items"));
            assert_eq!(body.get_str("$db"), Some("db"));

            let reply = doc! {
                "ok" => 1.0,
                "cursor" => doc! {
                    "id" => 0i64,
                    "ns" => "db.items",
                    "nextBatch" => vec![doc! { "n" => 3 }],
                },
            };
            server
                .write_all(&reply_to(request.request_id, reply))
                .await
                .unwrap();
        });

        for expected in 1..=3 {
            let doc = cursor.next().await.unwrap().unwrap();
            assert_eq!(doc.get_i32("n"), Some(expected));
        }
        assert!(cursor.next().await.unwrap().is_none());
        assert_eq!(cursor.id(), 0);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_get_more_response_failure_is_not_retried() {
        let (connection, mut server) = connected_pair();
        spawn_read_loop(&connection);
        let mut cursor = seeded(connection, 42, vec![doc! { "n" => 1 }]);

        let server_task = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            let mut seen = 0usize;
            // Take the get-more and hang up without answering. Count what
            // arrives so a retry would be visible.
            let _ = read_request(&mut server, &mut buf).await;
            seen += 1;
            drop(server);
            seen
        });

        assert_eq!(
            cursor.next().await.unwrap().unwrap().get_i32("n"),
            Some(1)
        );
        let err = cursor.next().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        assert_eq!(server_task.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ahead_and_back_stay_in_batch() {
        let (connection, _server) = connected_pair();
        let batch = (0..5).map(|n| doc! { "n" => n }).collect();
        let mut cursor = seeded(connection, 0, batch);

        assert_eq!(cursor.next().await.unwrap().unwrap().get_i32("n"), Some(0));
        cursor.ahead(2).unwrap();
        assert_eq!(cursor.next().await.unwrap().unwrap().get_i32("n"), Some(3));
        cursor.back(4).unwrap();
        assert_eq!(cursor.next().await.unwrap().unwrap().get_i32("n"), Some(0));
        assert_eq!(cursor.buffered(), 4);

        let err = cursor.ahead(10).unwrap_err();
        assert!(matches!(
            err,
            ClientError::CursorPosition {
                requested: 10,
                available: 4,
            }
        ));
        let err = cursor.back(2).unwrap_err();
        assert!(matches!(
            err,
            ClientError::CursorPosition {
                requested: 2,
                available: 1,
            }
        ));
    }

    #[tokio::test]
    async fn test_close_kills_active_cursor() {
        let (connection, mut server) = connected_pair();
        let mut cursor = seeded(connection, 42, vec![doc! { "n" => 1 }]);

        cursor.close().await;
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.buffered(), 0);

        let mut buf = BytesMut::new();
        let request = read_request(&mut server, &mut buf).await;
        match &request.body {
            MessageBody::Msg(msg) => assert!(msg.flags.has_more_to_come()),
            other => panic!("expected command message, got {other:?}"),
        }
        let body = request_body(&request);
        assert_eq!(body.get_str("killCursors"), Some("items"));
        assert_eq!(body.get_str("$db"), Some("db"));
        let cursors = body.get_array("cursors").unwrap();
        assert_eq!(cursors, [Value::Int64(42)]);
    }

    #[tokio::test]
    async fn test_close_on_drained_cursor_sends_nothing() {
        let (connection, mut server) = connected_pair();
        let mut cursor = seeded(connection, 0, vec![]);
        assert!(cursor.next().await.unwrap().is_none());

        cursor.close().await;
        let mut chunk = [0u8; 64];
        let quiet = tokio::time::timeout(Duration::from_millis(50), server.read(&mut chunk)).await;
        assert!(quiet.is_err(), "close sent traffic for a dead cursor");
    }

    #[tokio::test]
    async fn test_seed_from_legacy_reply() {
        let (connection, _server) = connected_pair();
        let reply = Reply {
            flags: ReplyFlags::new(),
            cursor_id: 0,
            starting_from: 0,
            documents: vec![doc! { "n" => 1 }, doc! { "n" => 2 }],
        };
        let mut cursor =
            Cursor::from_legacy_reply(connection, "db.items", reply, None).unwrap();
        assert_eq!(cursor.namespace(), "db.items");
        assert_eq!(cursor.next().await.unwrap().unwrap().get_i32("n"), Some(1));
        assert_eq!(cursor.next().await.unwrap().unwrap().get_i32("n"), Some(2));
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_legacy_error_flags() {
        let (connection, _server) = connected_pair();
        let not_found = Reply {
            flags: ReplyFlags::from_bits(ReplyFlags::CURSOR_NOT_FOUND),
            cursor_id: 7,
            starting_from: 0,
            documents: vec![],
        };
        let err = Cursor::from_legacy_reply(connection.clone(), "db.items", not_found, None)
            .unwrap_err();
        assert!(matches!(err, ClientError::CursorNotFound { cursor_id: 7 }));

        let failed = Reply {
            flags: ReplyFlags::from_bits(ReplyFlags::QUERY_FAILURE),
            cursor_id: 0,
            starting_from: 0,
            documents: vec![doc! { "$err" => "no such index", "code" => 27 }],
        };
        let err =
            Cursor::from_legacy_reply(connection, "db.items", failed, None).unwrap_err();
        match err {
            ClientError::ServerError { code, message, .. } => {
                assert_eq!(code, 27);
                assert_eq!(message, "no such index");
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_cursor_replies() {
        let (connection, _server) = connected_pair();
        let err = Cursor::from_command_reply(connection.clone(), &doc! { "ok" => 1.0 }, None)
            .unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedReply(_)));

        let reply = doc! {
            "ok" => 1.0,
            "cursor" => doc! { "id" => 0i64, "ns" => "noseparator" },
        };
        let err = Cursor::from_command_reply(connection, &reply, None).unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedReply(_)));
    }
}
