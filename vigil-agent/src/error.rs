//! Error taxonomy for the Vigil agent
//!
//! Each component owns its error type so that retry and escalation policy is
//! decided where the error is produced:
//! - Frame acquisition: recoverable per cycle, counted towards `Faulted`
//! - Detector: frame shape problems, handled like a failed acquisition
//! - Channel delivery: scoped to one channel, never reaches the state machine
//! - Platform link: non-fatal, escalates alert severity
//! - Configuration: fatal at startup only
//! - Audit: logged, never unwinds the acquisition cycle

use thiserror::Error;

/// Failure to obtain a frame from the video source
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameAcquisitionError {
    #[error("frame source unavailable: {0}")]
    Unavailable(String),
    #[error("frame could not be decoded: {0}")]
    Decode(String),
    #[error("frame source exhausted")]
    EndOfStream,
}

/// Frame rejected by the motion detector
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetectorError {
    #[error("frame is {got_width}x{got_height}, background model is {width}x{height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
    #[error("frame buffer holds {got} bytes, expected {expected}")]
    BufferSize { expected: usize, got: usize },
    #[error("frame has no pixels")]
    Empty,
}

/// Outcome of a single failed `send` on a notification channel
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelDeliveryError {
    /// Worth retrying (network hiccup, 5xx, broker busy)
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Retrying cannot help (bad destination, rejected credentials, 4xx)
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl ChannelDeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelDeliveryError::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            ChannelDeliveryError::Transient(r) | ChannelDeliveryError::Permanent(r) => r,
        }
    }
}

/// Failure to get a return-to-base command acknowledged by the platform
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("link failure: {0}")]
    Transient(String),
    #[error("platform rejected command: {0}")]
    Rejected(String),
    #[error("no acknowledgement within {0} ms")]
    Timeout(u64),
    #[error("platform link disconnected")]
    Disconnected,
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl LinkError {
    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LinkError::Transient(_) | LinkError::Timeout(_) | LinkError::Disconnected
        )
    }
}

/// A single rejected configuration option
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConfigIssue {
    pub option: String,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.option, self.message)
    }
}

/// Startup configuration is unusable
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {}", join_issues(.0))]
    Invalid(Vec<ConfigIssue>),
    #[error("failed to read configuration: {0}")]
    Unreadable(String),
}

impl ConfigError {
    pub fn issues(&self) -> &[ConfigIssue] {
        match self {
            ConfigError::Invalid(issues) => issues,
            ConfigError::Unreadable(_) => &[],
        }
    }
}

fn join_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure to append to or read the audit log
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Command rejected by the monitoring session
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is faulted: {0}")]
    Faulted(String),
    #[error("cannot {action} while {state}")]
    IllegalTransition { action: &'static str, state: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_lists_every_issue() {
        let err = ConfigError::Invalid(vec![
            ConfigIssue { option: "detection.area_threshold".into(), message: "must be > 0".into() },
            ConfigIssue { option: "notify.channels".into(), message: "at least one channel".into() },
        ]);
        let text = err.to_string();
        assert!(text.contains("detection.area_threshold: must be > 0"));
        assert!(text.contains("notify.channels: at least one channel"));
        assert_eq!(err.issues().len(), 2);
    }

    #[test]
    fn test_link_error_transience() {
        assert!(LinkError::Timeout(500).is_transient());
        assert!(LinkError::Disconnected.is_transient());
        assert!(!LinkError::Rejected("armed".into()).is_transient());
    }
}
