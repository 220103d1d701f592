use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Failures of the shared signaling medium. None of these are retried by the
/// mesh; reconnecting is the medium's own job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediumError {
    #[error("signaling medium disconnected")]
    Disconnected,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("medium transport error: {0}")]
    Transport(String),
}

/// A record or key read from the medium did not match its schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed key: {0}")]
    MalformedKey(String),

    #[error("invalid record at {key}: {reason}")]
    InvalidRecord { key: String, reason: String },
}

/// Errors reported by the peer connection collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer connection error: {0}")]
    Connection(String),

    #[error("session description rejected: {0}")]
    Description(String),

    #[error("ice candidate rejected: {0}")]
    Candidate(String),

    #[error("peer connection closed")]
    Closed,
}

/// Local audio acquisition failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("no audio input device available")]
    NoDevice,

    #[error("audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("audio error: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HuddleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Medium(#[from] MediumError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("room {0} is full")]
    RoomFull(String),

    #[error("already in room {0}")]
    AlreadyJoined(String),

    #[error("voice is disabled")]
    Disabled,

    #[error("mesh coordinator stopped")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::FileNotFound(PathBuf::from("/tmp/missing.toml"));
        assert_eq!(err.to_string(), "config file not found: /tmp/missing.toml");

        let err = ConfigError::ParseError("unexpected token".into());
        assert_eq!(err.to_string(), "config parse error: unexpected token");

        let err = ConfigError::ValidationError("voice.max_participants = 0".into());
        assert_eq!(
            err.to_string(),
            "config validation error: voice.max_participants = 0"
        );
    }

    #[test]
    fn medium_error_display() {
        assert_eq!(
            MediumError::Disconnected.to_string(),
            "signaling medium disconnected"
        );
        assert_eq!(
            MediumError::Unauthorized("bad token".into()).to_string(),
            "unauthorized: bad token"
        );
    }

    #[test]
    fn protocol_error_display() {
        let err = ProtocolError::InvalidRecord {
            key: "rooms/r/offers/a/b".into(),
            reason: "missing sdp".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid record at rooms/r/offers/a/b: missing sdp"
        );
    }

    #[test]
    fn huddle_error_from_medium() {
        let err: HuddleError = MediumError::Disconnected.into();
        assert!(matches!(err, HuddleError::Medium(MediumError::Disconnected)));
        assert!(err.to_string().contains("disconnected"));
    }

    #[test]
    fn huddle_error_from_media() {
        let err: HuddleError = MediaError::DeviceNotFound("usb-mic".into()).into();
        assert!(matches!(err, HuddleError::Media(_)));
        assert!(err.to_string().contains("usb-mic"));
    }

    #[test]
    fn huddle_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: HuddleError = io_err.into();
        assert!(matches!(err, HuddleError::Io(_)));
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn huddle_error_other_variants() {
        assert_eq!(
            HuddleError::RoomFull("lobby".into()).to_string(),
            "room lobby is full"
        );
        assert_eq!(
            HuddleError::AlreadyJoined("lobby".into()).to_string(),
            "already in room lobby"
        );
        assert_eq!(HuddleError::Disabled.to_string(), "voice is disabled");
        assert_eq!(HuddleError::Stopped.to_string(), "mesh coordinator stopped");
    }
}
