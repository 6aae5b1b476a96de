// Chunked JSON streaming utilities
use crate::domain::event::TelemetryEvent;
use crate::infrastructure::http_response::brotli_compress;
use axum::body::Body;
use axum::http::{Response, StatusCode, header};
use axum::response::IntoResponse;
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Create a chunked streaming response of length-prefixed JSON frames
pub async fn chunked_json_stream<S, T>(
    stream: S,
    compress: bool,
) -> Result<Response<Body>, StatusCode>
where
    S: Stream<Item = T> + Send + 'static,
    T: Serialize + Send + Sync + 'static,
{
    let byte_stream = stream.then(move |msg| async move { serialize_chunk(&msg, compress).await });

    let body = Body::from_stream(byte_stream);

    // Chunks are compressed individually, so no Content-Encoding header
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndframe+json")
        .header(header::TRANSFER_ENCODING, "chunked")
        .body(body)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Serialize one message to a frame: 4-byte big-endian length, then the payload
pub async fn serialize_chunk<T: Serialize>(msg: &T, compress: bool) -> Result<Bytes, std::io::Error> {
    let buffer = serde_json::to_vec(msg).map_err(std::io::Error::other)?;

    let payload = if compress {
        brotli_compress(buffer).await?
    } else {
        buffer
    };

    let mut chunk = BytesMut::with_capacity(4 + payload.len());
    chunk.put_u32(payload.len() as u32);
    chunk.put_slice(&payload);

    Ok(chunk.freeze())
}

/// Streaming response fed by the live event relay
pub async fn stream_from_broadcast(
    rx: broadcast::Receiver<TelemetryEvent>,
    compress: bool,
) -> impl IntoResponse {
    let stream = async_stream::stream! {
        let mut events = BroadcastStream::new(rx);
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => yield event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::debug!("Live stream lagged, skipped {} events", skipped);
                }
            }
        }
    };

    match chunked_json_stream(stream, compress).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::status::StatusUpdate;

    #[tokio::test]
    async fn test_frame_is_length_prefixed() {
        let event = TelemetryEvent::message("/Sacha53/Pcasing", "101.5", 7);
        let chunk = serialize_chunk(&event, false).await.unwrap();

        let length = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
        assert_eq!(length, chunk.len() - 4);
        let decoded: serde_json::Value = serde_json::from_slice(&chunk[4..]).unwrap();
        assert_eq!(decoded["channel"], "/Sacha53/Pcasing");
        assert_eq!(decoded["type"], "message");
    }

    #[tokio::test]
    async fn test_broadcast_stream_ends_when_relay_closes() {
        let (tx, rx) = broadcast::channel(8);
        tx.send(TelemetryEvent::Status(StatusUpdate::disconnected("lost")))
            .unwrap();
        tx.send(TelemetryEvent::message("/W/X", "1", 1)).unwrap();
        drop(tx);

        let response = stream_from_broadcast(rx, false).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let first_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
        let first: serde_json::Value = serde_json::from_slice(&body[4..4 + first_len]).unwrap();
        assert_eq!(first["type"], "status");

        let rest = &body[4 + first_len..];
        let second_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        assert_eq!(rest.len(), 4 + second_len);
    }
}
