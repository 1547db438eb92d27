//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    // Frame and envelope errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Envelope or frame could not be interpreted.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A chunked reply arrived out of sequence or failed verification.
    #[error("chunk error for reply {reply_key}: {reason}")]
    Chunk {
        /// Correlation key of the affected reply.
        reply_key: String,
        /// What went wrong.
        reason: String,
    },

    // Connection errors
    /// Connection could not be established or was refused.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The remote side refused the handshake.
    #[error("rejected by {device_id}: {reason}")]
    Rejected {
        /// Id of the refusing device.
        device_id: String,
        /// Reason given by the peer.
        reason: String,
    },

    // Access errors
    /// The permission layer returned Blocked.
    #[error("permission denied: {action} on {path}")]
    PermissionDenied {
        /// Requested action.
        action: String,
        /// Target path.
        path: String,
    },

    /// A path or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::Deserialization(format!("invalid base64: {}", err))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            ErrorKind::ConnectionRefused
            | ErrorKind::AddrNotAvailable
            | ErrorKind::NotConnected => ProtocolError::Connection(err.to_string()),
            ErrorKind::NotFound => ProtocolError::NotFound(err.to_string()),
            _ => ProtocolError::Connection(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_error_names_the_reply() {
        let err = ProtocolError::Chunk {
            reply_key: "r-1".to_string(),
            reason: "expected chunk 2/3, got 3/3".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "chunk error for reply r-1: expected chunk 2/3, got 3/3"
        );
    }

    #[test]
    fn test_rejection_and_permission_messages() {
        let rejected = ProtocolError::Rejected {
            device_id: "dev-9".to_string(),
            reason: "device is blocked".to_string(),
        };
        assert_eq!(rejected.to_string(), "rejected by dev-9: device is blocked");

        let denied = ProtocolError::PermissionDenied {
            action: "remove".to_string(),
            path: "/srv/share/a.txt".to_string(),
        };
        assert_eq!(denied.to_string(), "permission denied: remove on /srv/share/a.txt");
    }

    #[test]
    fn test_oversized_frame_message() {
        let err = ProtocolError::FrameTooLarge {
            size: 20 * 1024 * 1024,
            max: 16 * 1024 * 1024,
        };
        assert!(err.to_string().contains("exceeds maximum of 16777216 bytes"));
    }

    #[test]
    fn test_codec_errors_map_to_deserialization() {
        let msgpack: ProtocolError = rmp_serde::from_slice::<Vec<String>>(&[0xC1])
            .unwrap_err()
            .into();
        assert!(matches!(msgpack, ProtocolError::Deserialization(_)));

        let b64: ProtocolError = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            "%%%",
        )
        .unwrap_err()
        .into();
        assert!(b64.to_string().contains("invalid base64"));
    }

    #[test]
    fn test_io_error_kinds() {
        use std::io::{Error, ErrorKind};

        let cases = [
            (ErrorKind::TimedOut, "operation timed out"),
            (ErrorKind::UnexpectedEof, "connection closed"),
            (ErrorKind::BrokenPipe, "connection closed"),
            (ErrorKind::ConnectionRefused, "connection failed"),
            (ErrorKind::NotFound, "not found"),
        ];
        for (kind, prefix) in cases {
            let err: ProtocolError = Error::new(kind, "boom").into();
            assert!(err.to_string().starts_with(prefix), "{:?} -> {}", kind, err);
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
