// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! The enclave attestation dialogue.
//!
//! Requests and responses are tagged CBOR messages with a big-endian
//! u32 length prefix. One request is answered by exactly one response;
//! the driver is the only caller, so calls on a connection are
//! serialized.

use async_trait::async_trait;
use attestation::QuoteBundle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Upper bound on a single frame. TCB bundles dominate the payload and
/// stay well below this.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Upper bound on the QE target info accepted from the quoting service.
pub const TARGET_INFO_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("enclave channel closed")]
    Closed,

    #[error("enclave call timed out")]
    Timeout,

    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    FrameTooLarge,

    #[error("malformed message: {0}")]
    Codec(String),

    #[error("unexpected response from enclave")]
    UnexpectedResponse,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Requests the attestation driver sends to the enclave.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    /// Deliver the QE target info so the enclave can produce reports for
    /// the quoting enclave.
    RakInit { target_info: Vec<u8> },

    /// Ask the enclave for its attestation key material and a REPORT.
    RakReport,

    /// Deliver the verified quote and TCB bundle; the enclave
    /// acknowledges them by signing over the attestation.
    RakQuote { quote: QuoteBundle },
}

/// Responses from the enclave.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Empty,

    RakReport {
        rak_pub: Vec<u8>,
        rek_pub: Vec<u8>,
        report: Vec<u8>,
        nonce: String,
    },

    RakQuote {
        height: u64,
        signature: Vec<u8>,
    },

    Error {
        message: String,
    },
}

/// A request/response channel to one enclave.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn call(&self, request: Request) -> Result<Response, TransportError>;
}

/// A [`Connection`] over any byte stream, using length-prefixed CBOR
/// frames.
pub struct FramedConnection<T> {
    io: Mutex<T>,
}

impl<T> FramedConnection<T> {
    pub fn new(io: T) -> Self {
        Self { io: Mutex::new(io) }
    }
}

#[async_trait]
impl<T> Connection for FramedConnection<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn call(&self, request: Request) -> Result<Response, TransportError> {
        let mut body = Vec::new();
        ciborium::ser::into_writer(&request, &mut body)
            .map_err(|err| TransportError::Codec(err.to_string()))?;
        if body.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge);
        }

        let mut io = self.io.lock().await;

        io.write_all(&(body.len() as u32).to_be_bytes()).await?;
        io.write_all(&body).await?;
        io.flush().await?;

        let mut len = [0u8; 4];
        io.read_exact(&mut len).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                TransportError::Io(err)
            }
        })?;

        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge);
        }

        let mut frame = vec![0u8; len];
        io.read_exact(&mut frame).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                TransportError::Io(err)
            }
        })?;

        ciborium::de::from_reader(frame.as_slice())
            .map_err(|err| TransportError::Codec(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A trivial peer answering every request with a canned response.
    async fn serve<T: AsyncRead + AsyncWrite + Unpin>(mut io: T, response: Response) {
        let mut len = [0u8; 4];
        io.read_exact(&mut len).await.unwrap();
        let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
        io.read_exact(&mut frame).await.unwrap();

        let _request: Request = ciborium::de::from_reader(frame.as_slice()).unwrap();

        let mut body = Vec::new();
        ciborium::ser::into_writer(&response, &mut body).unwrap();
        io.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        io.write_all(&body).await.unwrap();
    }

    #[tokio::test]
    async fn round_trip() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let peer = tokio::spawn(serve(
            server,
            Response::RakQuote {
                height: 7,
                signature: vec![1u8; 64],
            },
        ));

        let conn = FramedConnection::new(client);
        let response = conn
            .call(Request::RakInit {
                target_info: vec![0u8; TARGET_INFO_LEN],
            })
            .await
            .unwrap();

        match response {
            Response::RakQuote { height, signature } => {
                assert_eq!(height, 7);
                assert_eq!(signature.len(), 64);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        peer.await.unwrap();
    }

    #[tokio::test]
    async fn closed_peer_is_reported() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        drop(server);

        let conn = FramedConnection::new(client);
        match conn.call(Request::RakReport).await {
            Err(TransportError::Closed) | Err(TransportError::Io(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let writer = tokio::spawn(async move {
            let mut io = server;
            let mut len = [0u8; 4];
            io.read_exact(&mut len).await.unwrap();
            let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
            io.read_exact(&mut frame).await.unwrap();

            // Claim a body larger than the frame cap.
            io.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
                .await
                .unwrap();
        });

        let conn = FramedConnection::new(client);
        match conn.call(Request::RakReport).await {
            Err(TransportError::FrameTooLarge) => {}
            other => panic!("unexpected result: {other:?}"),
        }

        writer.await.unwrap();
    }
}
