use thiserror::Error;

/// Pipeline-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Video error: {0}")]
    VideoError(String),

    #[error("Video device lost [{device}]: {reason}")]
    VideoDeviceLost { device: String, reason: String },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Encoder closed: {0}")]
    EncoderClosed(String),
}

impl AppError {
    /// Whether this error must terminate the pipeline instance
    ///
    /// Conversion and single-call codec failures only cost one frame.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AppError::Codec(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!AppError::Codec("bad frame".into()).is_fatal());
        assert!(AppError::EncoderClosed("gone".into()).is_fatal());
        assert!(AppError::VideoDeviceLost {
            device: "/dev/video0".into(),
            reason: "ENODEV".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_device_lost_message() {
        let err = AppError::VideoDeviceLost {
            device: "/dev/video2".into(),
            reason: "No such device".into(),
        };
        assert_eq!(
            err.to_string(),
            "Video device lost [/dev/video2]: No such device"
        );
    }
}
