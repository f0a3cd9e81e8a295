//! Length-delimited JSON framing shared by the TCP and stdio transports.
//!
//! Every message is a 4-byte big-endian length followed by that many bytes
//! of UTF-8 JSON. The same framing runs over a TCP stream and over a child's
//! stdin/stdout pipes, so the transport choice never changes the codec.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

/// Upper bound on a single frame. Larger frames are rejected by the codec.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame payload is not valid JSON for this message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Build the frame codec used on both ends of a connection.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Serialize a message into a frame payload.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decode a frame payload into a message.
pub fn decode_message<T: DeserializeOwned>(frame: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(frame)?)
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::wire::{Method, Request};

    #[tokio::test]
    async fn frames_survive_a_byte_stream() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, frame_codec());
        let mut reader = FramedRead::new(server, frame_codec());

        let request = Request {
            id: 9,
            method: Method::GetPluginInfo,
            params: serde_json::Value::Null,
        };
        writer.send(encode_message(&request).unwrap()).await.unwrap();

        let frame = reader.next().await.unwrap().unwrap();
        let decoded: Request = decode_message(&frame).unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn length_prefix_is_big_endian_u32() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, frame_codec());
        writer.send(Bytes::from_static(b"{}")).await.unwrap();

        let mut raw = [0u8; 6];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut raw).await.unwrap();
        assert_eq!(raw, [0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn decode_rejects_non_json() {
        let err = decode_message::<Request>(b"not json").unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }
}
