//! Framed reads/writes, mesh HMAC and transport errors.

use crate::message::{decode_length, decode_message, encode_message, WireMessage};
use aip_types::error::AipError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type HmacSha256 = Hmac<Sha256>;

/// Maximum single message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("Remote error {code}: {message}")]
    Remote { code: u16, message: String },
}

impl From<WireError> for AipError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Remote { code, message } => AipError::Remote { code, message },
            other => AipError::ConnectionLost(other.to_string()),
        }
    }
}

/// HMAC-SHA256 over `data`, hex encoded.
pub fn hmac_sign(secret: &str, data: &[u8]) -> String {
    // new_from_slice only fails for fixed-size MACs; HMAC takes any key length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an HMAC-SHA256 signature using constant-time comparison.
pub fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

/// The HMAC a worker presents in its handshake (and the hub in its ack).
pub fn handshake_hmac(secret: &str, nonce: &str, id: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    hmac_sign(secret, format!("{nonce}{id}").as_bytes())
}

/// Write a framed message (4-byte length + JSON).
pub async fn write_message<W>(writer: &mut W, msg: &WireMessage) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(msg)?;
    if bytes.len() - 4 > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: (bytes.len() - 4) as u32,
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON).
pub async fn read_message<R>(reader: &mut R) -> Result<WireMessage, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let msg = decode_message(&body)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{WireNotification, WireRequest};

    #[test]
    fn test_hmac_verify() {
        let sig = hmac_sign("secret", b"nonce-1worker-1");
        assert!(hmac_verify("secret", b"nonce-1worker-1", &sig));
        assert!(!hmac_verify("other", b"nonce-1worker-1", &sig));
        assert!(!hmac_verify("secret", b"nonce-2worker-1", &sig));
    }

    #[test]
    fn test_open_mesh_has_empty_hmac() {
        assert!(handshake_hmac("", "n", "w").is_empty());
        assert_eq!(handshake_hmac("s", "n", "w"), hmac_sign("s", b"nw"));
    }

    #[tokio::test]
    async fn test_framed_io_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = WireMessage::request(WireRequest::RegisterKind {
            kind: "tools".into(),
        });
        write_message(&mut a, &msg).await.unwrap();
        write_message(&mut a, &WireMessage::notification(WireNotification::Draining))
            .await
            .unwrap();
        let first = read_message(&mut b).await.unwrap();
        assert_eq!(first.id, msg.id);
        let _second = read_message(&mut b).await.unwrap();

        drop(a);
        assert!(matches!(
            read_message(&mut b).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        match read_message(&mut b).await {
            Err(WireError::MessageTooLarge { size, .. }) => assert_eq!(size, MAX_MESSAGE_SIZE + 1),
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_error_maps_to_remote() {
        let e: AipError = WireError::Remote {
            code: 409,
            message: "taken".into(),
        }
        .into();
        assert!(matches!(e, AipError::Remote { code: 409, .. }));
        let e: AipError = WireError::ConnectionClosed.into();
        assert!(e.is_transport());
    }
}
