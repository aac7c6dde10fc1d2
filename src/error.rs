//! Pipeline error taxonomy.
//!
//! Build-time errors (`DeviceUnavailable`, `CalibrationInvalid`, `ShapeMismatch`)
//! halt startup. `ChannelOverflow` is counted and never propagated as a failure.
//! `StreamDisconnected` is escalated to the controller, which owns the restart policy.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("capture device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error(
        "frame shape mismatch: expected {expected_width}x{expected_height}, got {width}x{height}"
    )]
    ShapeMismatch {
        expected_width: u32,
        expected_height: u32,
        width: u32,
        height: u32,
    },

    #[error("calibration invalid: {0}")]
    CalibrationInvalid(String),

    #[error("frame channel overflow: dropped frame #{dropped_seq} ({total_dropped} dropped so far)")]
    ChannelOverflow {
        dropped_seq: u64,
        total_dropped: u64,
    },

    #[error("stream disconnected: {0}")]
    StreamDisconnected(String),

    #[error("failed to persist {}: {reason}", path.display())]
    PersistenceFailure { path: PathBuf, reason: String },
}

impl PipelineError {
    /// Process exit status for a fatal error of this kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::DeviceUnavailable { .. } => 2,
            PipelineError::CalibrationInvalid(_) => 3,
            PipelineError::ShapeMismatch { .. } => 4,
            PipelineError::StreamDisconnected(_) => 5,
            PipelineError::ChannelOverflow { .. } | PipelineError::PersistenceFailure { .. } => 1,
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::ChannelOverflow { .. } | PipelineError::PersistenceFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_describes_both_shapes() {
        let err = PipelineError::ShapeMismatch {
            expected_width: 1920,
            expected_height: 960,
            width: 1280,
            height: 720,
        };
        let text = err.to_string();
        assert!(text.contains("1920x960"));
        assert!(text.contains("1280x720"));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn overflow_and_persistence_are_not_fatal() {
        let overflow = PipelineError::ChannelOverflow {
            dropped_seq: 3,
            total_dropped: 1,
        };
        let persist = PipelineError::PersistenceFailure {
            path: PathBuf::from("fisheye_params.json"),
            reason: "read-only file system".to_string(),
        };
        assert!(!overflow.is_fatal());
        assert!(!persist.is_fatal());
        assert!(PipelineError::StreamDisconnected("exit status 1".into()).is_fatal());
    }
}
