//! One framed request/response channel to a plugin process.
//!
//! Calls on a connection are serialized by an async mutex. Ids increase
//! monotonically; a response carrying an older id is a late answer to a
//! call that already gave up and is dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::debug;

use finfocus_proto::Method;
use finfocus_proto::codec::{decode_message, encode_message, frame_codec};
use finfocus_proto::wire::{Request, Response};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub(crate) enum TransportError {
    #[error("connection closed by plugin")]
    Closed,

    #[error("connection i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("connection unusable after an interrupted write")]
    Poisoned,
}

struct Channel {
    reader: FramedRead<BoxReader, LengthDelimitedCodec>,
    writer: FramedWrite<BoxWriter, LengthDelimitedCodec>,
    /// Set when a write may have left a partial frame on the wire.
    poisoned: bool,
}

pub(crate) struct Connection {
    channel: Mutex<Channel>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(reader: BoxReader, writer: BoxWriter) -> Self {
        Self {
            channel: Mutex::new(Channel {
                reader: FramedRead::new(reader, frame_codec()),
                writer: FramedWrite::new(writer, frame_codec()),
                poisoned: false,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Frames over the child's stdout (responses) and stdin (requests).
    pub(crate) fn from_pipes(stdout: ChildStdout, stdin: ChildStdin) -> Self {
        Self::new(Box::new(stdout), Box::new(stdin))
    }

    pub(crate) async fn from_tcp(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(Box::new(reader), Box::new(writer)))
    }

    /// Send one request and wait for its response.
    ///
    /// Cancel-safe with respect to the lock: dropping the future releases
    /// it. Dropping mid-write poisons the channel.
    pub(crate) async fn round_trip(
        &self,
        method: Method,
        params: serde_json::Value,
    ) -> Result<Response, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode_message(&Request { id, method, params })
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        let mut channel = self.channel.lock().await;
        if channel.poisoned {
            return Err(TransportError::Poisoned);
        }

        channel.poisoned = true;
        channel.writer.send(frame).await?;
        channel.poisoned = false;

        loop {
            match channel.reader.next().await {
                None => {
                    channel.poisoned = true;
                    return Err(TransportError::Closed);
                }
                Some(Err(e)) => {
                    // Framing state is unknown after a codec error.
                    channel.poisoned = true;
                    return Err(TransportError::Io(e));
                }
                Some(Ok(bytes)) => {
                    let response: Response = decode_message(&bytes)
                        .map_err(|e| TransportError::Malformed(e.to_string()))?;
                    if response.id == id {
                        return Ok(response);
                    }
                    debug!(
                        expected = id,
                        received = response.id,
                        %method,
                        "discarding stale response"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// Plugin side of a duplex: answers each request with `{id, result: id}`
    /// after first emitting a stale frame with id 0.
    async fn echo_with_stale<S>(stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read, frame_codec());
        let mut sink = FramedWrite::new(write, frame_codec());
        while let Some(Ok(frame)) = frames.next().await {
            let request: Request = decode_message(&frame).unwrap();
            let stale = Response::ok(0, serde_json::json!("stale"));
            sink.send(encode_message(&stale).unwrap()).await.unwrap();
            let reply = Response::ok(request.id, serde_json::json!(request.id));
            sink.send(encode_message(&reply).unwrap()).await.unwrap();
        }
    }

    fn connect_duplex() -> (Connection, tokio::io::DuplexStream) {
        let (host, plugin) = tokio::io::duplex(4096);
        let (read, write) = tokio::io::split(host);
        (Connection::new(Box::new(read), Box::new(write)), plugin)
    }

    #[tokio::test]
    async fn stale_responses_are_skipped() {
        let (conn, plugin) = connect_duplex();
        tokio::spawn(echo_with_stale(plugin));

        let first = conn.round_trip(Method::Identity, serde_json::Value::Null).await.unwrap();
        let second = conn.round_trip(Method::Identity, serde_json::Value::Null).await.unwrap();
        assert_eq!(first.into_result().unwrap(), serde_json::json!(1));
        assert_eq!(second.into_result().unwrap(), serde_json::json!(2));
    }

    #[tokio::test]
    async fn concurrent_calls_are_serialized() {
        let (conn, plugin) = connect_duplex();
        tokio::spawn(echo_with_stale(plugin));
        let conn = Arc::new(conn);

        let calls = (0..8).map(|_| {
            let conn = Arc::clone(&conn);
            tokio::spawn(
                async move { conn.round_trip(Method::Identity, serde_json::Value::Null).await },
            )

        });
        let mut ids: Vec<u64> = Vec::new();
        for call in calls {
            let response = call.await.unwrap().unwrap();
            ids.push(response.into_result().unwrap().as_u64().unwrap());
        }
        ids.sort();
        assert_eq!(ids, (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn peer_hangup_is_closed_then_poisoned() {
        let (conn, plugin) = connect_duplex();
        drop(plugin);

        let err = conn.round_trip(Method::Identity, serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_) | TransportError::Closed), "{err}");
        let err = conn.round_trip(Method::Identity, serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, TransportError::Poisoned | TransportError::Io(_)), "{err}");
    }

    #[tokio::test]
    async fn late_answer_after_timeout_does_not_leak_into_next_call() {
        let (conn, plugin) = connect_duplex();
        // Plugin answers the first request only after a delay.
        tokio::spawn(async move {
            let (read, write) = tokio::io::split(plugin);
            let mut frames = FramedRead::new(read, frame_codec());
            let mut sink = FramedWrite::new(write, frame_codec());
            let mut first = true;
            while let Some(Ok(frame)) = frames.next().await {
                let request: Request = decode_message(&frame).unwrap();
                if first {
                    first = false;
                    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
                }
                let reply = Response::ok(request.id, serde_json::json!(request.id));
                sink.send(encode_message(&reply).unwrap()).await.unwrap();
            }
        });

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            conn.round_trip(Method::Identity, serde_json::Value::Null),
        )
        .await;
        assert!(timed_out.is_err());

        let next = conn.round_trip(Method::Identity, serde_json::Value::Null).await.unwrap();
        assert_eq!(next.id, 2);
        assert_eq!(next.into_result().unwrap(), serde_json::json!(2));
    }
}
