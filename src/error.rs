use thiserror::Error;

/// Failure categories the engine branches on.
///
/// Everything else travels as `anyhow::Error`; these are the cases where the
/// caller must decide between "skip this cycle", "stop this stream" and
/// "drop this event".
#[derive(Debug, Error)]
pub enum SlotError {
    /// Bad or missing region config. The stream does not start.
    #[error("config error for stream {stream_id}: {message}")]
    Config { stream_id: String, message: String },

    /// Detector failed or timed out on one sampling cycle.
    #[error("detection failed: {0}")]
    DetectionTransient(String),

    /// Unrecoverable frame source (or escalated detector) failure. The stream stops.
    #[error("stream {stream_id} failed: {message}")]
    StreamFatal { stream_id: String, message: String },

    /// The sink rejected an event. The event is dropped.
    #[error("sink delivery failed: {0}")]
    SinkDelivery(String),
}

impl SlotError {
    pub fn config(stream_id: &str, message: impl Into<String>) -> Self {
        SlotError::Config {
            stream_id: stream_id.to_string(),
            message: message.into(),
        }
    }

    pub fn fatal(stream_id: &str, message: impl Into<String>) -> Self {
        SlotError::StreamFatal {
            stream_id: stream_id.to_string(),
            message: message.into(),
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, SlotError::Config { .. })
    }
}
