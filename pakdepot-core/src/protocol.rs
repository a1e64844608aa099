//! Peer wire protocol.
//!
//! JSON messages over TCP, each framed by a u32 big-endian length prefix so
//! that coalesced or fragmented reads can never split a logical message. The
//! JSON field names are the bit-exact interop contract with any compliant
//! peer.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DepotError, DepotResult};

/// Upper bound on one frame; anything larger is a protocol error.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    Handshake {
        peer_id: String,
        port: u16,
        capabilities: Vec<String>,
        shared_packages: Vec<String>,
        bandwidth: u32,
        trusted: bool,
        reputation: f64,
    },
    HandshakeResponse {
        peer_id: String,
        capabilities: Vec<String>,
        shared_packages: Vec<String>,
    },
    DownloadRequest {
        package: String,
    },
    DownloadResponse {
        package: String,
        available: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        chunks: Option<Vec<String>>,
    },
    UploadOffer {
        package: String,
    },
    UploadResponse {
        package: String,
        accepted: bool,
    },
    ChunkRequest {
        package: String,
        chunk_id: String,
    },
    ChunkResponse {
        package: String,
        chunk_id: String,
        /// Hex-encoded chunk payload when the peer has it.
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Ping,
    Pong,
}

impl PeerMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Handshake { .. } => "handshake",
            PeerMessage::HandshakeResponse { .. } => "handshake_response",
            PeerMessage::DownloadRequest { .. } => "download_request",
            PeerMessage::DownloadResponse { .. } => "download_response",
            PeerMessage::UploadOffer { .. } => "upload_offer",
            PeerMessage::UploadResponse { .. } => "upload_response",
            PeerMessage::ChunkRequest { .. } => "chunk_request",
            PeerMessage::ChunkResponse { .. } => "chunk_response",
            PeerMessage::Ping => "ping",
            PeerMessage::Pong => "pong",
        }
    }
}

/// Write one length-prefixed message.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &PeerMessage,
) -> DepotResult<()> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(DepotError::Protocol {
            message: format!("outgoing frame of {} bytes exceeds limit", payload.len()),
        });
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> DepotResult<PeerMessage> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(DepotError::Protocol {
            message: format!("incoming frame of {} bytes exceeds limit", len),
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|e| DepotError::Protocol {
        message: format!("malformed message: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn handshake_field_names_are_stable() {
        let message = PeerMessage::Handshake {
            peer_id: "abc".to_string(),
            port: 8080,
            capabilities: vec!["download".to_string(), "upload".to_string()],
            shared_packages: vec!["apt:curl".to_string()],
            bandwidth: 100,
            trusted: false,
            reputation: 0.5,
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(value["type"], "handshake");
        assert_eq!(value["peer_id"], "abc");
        assert_eq!(value["port"], 8080);
        assert_eq!(value["bandwidth"], 100);
        assert_eq!(value["trusted"], false);
        assert_eq!(value["reputation"], 0.5);
        assert_eq!(value["shared_packages"][0], "apt:curl");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let message = PeerMessage::DownloadResponse {
            package: "apt:curl".to_string(),
            available: false,
            chunks: None,
        };
        let encoded = serde_json::to_string(&message).unwrap();
        assert!(!encoded.contains("chunks"));

        let message = PeerMessage::ChunkResponse {
            package: "apt:curl".to_string(),
            chunk_id: "apt:curl:0".to_string(),
            data: Some("00ff".to_string()),
            error: None,
        };
        let encoded = serde_json::to_string(&message).unwrap();
        assert!(encoded.contains("data"));
        assert!(!encoded.contains("error"));
    }

    #[tokio::test]
    async fn framing_survives_back_to_back_messages() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_message(&mut client, &PeerMessage::Ping).await.unwrap();
        write_message(
            &mut client,
            &PeerMessage::DownloadRequest {
                package: "apt:curl".to_string(),
            },
        )
        .await
        .unwrap();

        assert_eq!(read_message(&mut server).await.unwrap(), PeerMessage::Ping);
        assert_eq!(
            read_message(&mut server).await.unwrap(),
            PeerMessage::DownloadRequest {
                package: "apt:curl".to_string()
            }
        );
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = client.write_u32(u32::MAX).await;
        });
        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, DepotError::Protocol { .. }));
    }
}
