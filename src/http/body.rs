//! Size-limited request body reading.
//!
//! Bodies are pulled chunk by chunk and rejected as soon as they pass the
//! limit, so an oversized push is never held in memory in full.  Gzip bodies
//! are inflated against the same limit.

use std::io::Read;

use axum::body::Body;
use axum::http::{header, HeaderMap};
use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use thiserror::Error;
use tokio_stream::StreamExt;

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds the configured limit")]
    TooLarge,
    #[error("unsupported content encoding")]
    UnsupportedEncoding,
    #[error("failed to read request body: {0}")]
    Read(#[from] axum::Error),
    #[error("failed to decode gzip body: {0}")]
    Decode(#[source] std::io::Error),
}

/// `Content-Length` header, if present and well-formed.
pub fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Read the whole body, failing with [`BodyError::TooLarge`] once more than
/// `limit` bytes arrive or after inflation exceeds `limit`.
pub async fn read_body(headers: &HeaderMap, body: Body, limit: u64) -> Result<Bytes, BodyError> {
    if declared_length(headers).is_some_and(|len| len > limit) {
        return Err(BodyError::TooLarge);
    }

    let raw = read_limited(body, limit).await?;

    match content_encoding(headers).as_deref() {
        None | Some("identity") => Ok(raw),
        Some("gzip") | Some("x-gzip") => {
            tokio::task::spawn_blocking(move || gunzip_limited(&raw, limit))
                .await
                .map_err(|e| BodyError::Decode(std::io::Error::other(e)))?
        }
        Some(_) => Err(BodyError::UnsupportedEncoding),
    }
}

fn content_encoding(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
}

async fn read_limited(body: Body, limit: u64) -> Result<Bytes, BodyError> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if (buf.len() + chunk.len()) as u64 > limit {
            return Err(BodyError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn gunzip_limited(compressed: &[u8], limit: u64) -> Result<Bytes, BodyError> {
    let mut out = Vec::new();
    GzDecoder::new(compressed)
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(BodyError::Decode)?;
    if out.len() as u64 > limit {
        return Err(BodyError::TooLarge);
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[tokio::test]
    async fn reads_within_limit() {
        let body = read_body(&HeaderMap::new(), Body::from("0000"), 4).await.unwrap();
        assert_eq!(&body[..], b"0000");
    }

    #[tokio::test]
    async fn rejects_declared_length_over_limit() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("100"));
        let err = read_body(&headers, Body::from("x"), 10).await.unwrap_err();
        assert!(matches!(err, BodyError::TooLarge));
    }

    #[tokio::test]
    async fn rejects_streamed_body_over_limit() {
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"12345")),
            Ok(Bytes::from_static(b"67890")),
        ];
        let body = Body::from_stream(tokio_stream::iter(chunks));
        let err = read_body(&HeaderMap::new(), body, 8).await.unwrap_err();
        assert!(matches!(err, BodyError::TooLarge));
    }

    #[tokio::test]
    async fn inflates_gzip() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let body = read_body(&headers, Body::from(gzip(b"0009done\n")), 100).await.unwrap();
        assert_eq!(&body[..], b"0009done\n");
    }

    #[tokio::test]
    async fn gzip_bomb_is_limited() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let bomb = gzip(&vec![0u8; 1 << 20]);
        assert!((bomb.len() as u64) < 64 * 1024);
        let err = read_body(&headers, Body::from(bomb), 64 * 1024).await.unwrap_err();
        assert!(matches!(err, BodyError::TooLarge));
    }

    #[tokio::test]
    async fn unknown_encoding_is_refused() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("br"));
        let err = read_body(&headers, Body::from("x"), 10).await.unwrap_err();
        assert!(matches!(err, BodyError::UnsupportedEncoding));
    }
}
