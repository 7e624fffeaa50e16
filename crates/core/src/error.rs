/// Result alias that carries the custom [`QuantizerError`] type.
pub type Result<T> = std::result::Result<T, QuantizerError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum QuantizerError {
    /// Tempo must be a finite number of beats per minute greater than zero.
    #[error("tempo must be greater than 0 bpm, got {0}")]
    InvalidTempo(f64),
    /// Beat divisions count grid steps per 4-beat measure and start at 1.
    #[error("beat division must be at least 1, got {0}")]
    InvalidBeatDivision(u32),
    #[error("extra delay must be a finite, non-negative number of seconds, got {0}")]
    InvalidDelay(f64),
    /// Registration was attempted while the time base is stopped.
    #[error("quantizer is not playing; call start first")]
    NotPlaying,
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl QuantizerError {
    /// Creates a configuration error from the provided message.
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }
}
