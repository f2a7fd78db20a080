//! Bridge configuration types
//!
//! All options are consumed once at startup. Invalid values are reported
//! before either loop starts.

use crate::filter::CanIdPattern;
use crate::substitution::SubstitutionRule;
use crate::types::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Append every received snapshot to a JSON array instead of overwriting
    pub accumulate: bool,

    /// Only record signals whose value changed since the previous snapshot
    pub diff: bool,

    /// Add a `$timestamp` field to every record
    pub timestamps: bool,

    /// Use wall-clock time for `$timestamp` instead of time since first reception
    pub absolute_time: bool,

    /// Add `$id` and `$data` fields with the raw frame
    pub raw_data: bool,

    /// Working directory; a temporary directory is created when unset
    pub output_folder: Option<PathBuf>,

    /// Keep the working directory on exit
    pub preserve_files: bool,

    /// File naming substitution, as `MATCH:REPLACEMENT`
    pub substitution: Option<String>,

    /// Messages (names or identifiers) whose files are never written on reception
    pub disable_rx: Vec<String>,

    /// What to do with frames whose identifier is not in the catalog
    pub unknown_ids: UnknownIdPolicy,

    /// Only frames accepted by this pattern are mirrored
    pub rx_filter: Option<CanIdPattern>,

    /// Override the catalog's identifier format on sent frames
    pub force_extended_id: Option<bool>,

    /// How long a receive-path write stays recognisable as an echo
    pub echo_grace_ms: u64,

    /// Upper bound on how long a loop waits before checking for shutdown
    pub poll_interval_ms: u64,

    /// Capacity of the filesystem event queue
    pub event_queue_capacity: usize,

    /// Minimum delay between two warnings of the same persistent failure
    pub warning_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            accumulate: false,
            diff: false,
            timestamps: false,
            absolute_time: false,
            raw_data: false,
            output_folder: None,
            preserve_files: false,
            substitution: None,
            disable_rx: Vec::new(),
            unknown_ids: UnknownIdPolicy::default(),
            rx_filter: None,
            force_extended_id: None,
            echo_grace_ms: 2_000,
            poll_interval_ms: 100,
            event_queue_capacity: 256,
            warning_interval_ms: 5_000,
        }
    }
}

/// Handling of frames with an identifier unknown to the catalog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownIdPolicy {
    /// Count them, log at debug level only
    Ignore,
    /// Count them, warn once per identifier
    #[default]
    Log,
}

/// Timestamp flavour written to `$timestamp`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    /// Seconds since the message was first received
    Relative,
    /// Seconds since the Unix epoch
    Absolute,
}

impl BridgeConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: enable or disable accumulate mode
    pub fn with_accumulate(mut self, enabled: bool) -> Self {
        self.accumulate = enabled;
        self
    }

    /// Builder method: enable or disable diff mode
    pub fn with_diff(mut self, enabled: bool) -> Self {
        self.diff = enabled;
        self
    }

    /// Builder method: enable or disable timestamps
    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    /// Builder method: use absolute timestamps
    pub fn with_absolute_time(mut self, enabled: bool) -> Self {
        self.absolute_time = enabled;
        self
    }

    /// Builder method: include raw frame fields
    pub fn with_raw_data(mut self, enabled: bool) -> Self {
        self.raw_data = enabled;
        self
    }

    /// Builder method: set the working directory
    pub fn with_output_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.output_folder = Some(folder.into());
        self
    }

    /// Builder method: keep files on exit
    pub fn with_preserve_files(mut self, enabled: bool) -> Self {
        self.preserve_files = enabled;
        self
    }

    /// Builder method: set the file naming substitution
    pub fn with_substitution(mut self, rule: impl Into<String>) -> Self {
        self.substitution = Some(rule.into());
        self
    }

    /// Builder method: disable reception for a message
    pub fn disable_rx_for(mut self, message: impl Into<String>) -> Self {
        self.disable_rx.push(message.into());
        self
    }

    /// Builder method: set the unknown identifier policy
    pub fn with_unknown_ids(mut self, policy: UnknownIdPolicy) -> Self {
        self.unknown_ids = policy;
        self
    }

    /// Builder method: set the receive acceptance filter
    pub fn with_rx_filter(mut self, pattern: CanIdPattern) -> Self {
        self.rx_filter = Some(pattern);
        self
    }

    /// Builder method: set the echo grace window
    pub fn with_echo_grace(mut self, grace: Duration) -> Self {
        self.echo_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Builder method: set the loop polling interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Timestamp flavour, `None` when timestamps are off
    pub fn timestamp_mode(&self) -> Option<TimestampMode> {
        match (self.timestamps, self.absolute_time) {
            (false, _) => None,
            (true, false) => Some(TimestampMode::Relative),
            (true, true) => Some(TimestampMode::Absolute),
        }
    }

    /// Parsed substitution rule
    pub fn substitution_rule(&self) -> Result<Option<SubstitutionRule>> {
        self.substitution.as_deref().map(str::parse).transpose()
    }

    pub fn echo_grace(&self) -> Duration {
        Duration::from_millis(self.echo_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn warning_interval(&self) -> Duration {
        Duration::from_millis(self.warning_interval_ms)
    }

    /// Check option values that do not depend on the catalog
    pub fn validate(&self) -> Result<()> {
        self.substitution_rule()?;
        if self.absolute_time && !self.timestamps {
            log::warn!("absolute_time has no effect without timestamps");
        }
        if self.poll_interval_ms == 0 {
            return Err(MirrorError::Config("poll_interval_ms must be positive".to_string()));
        }
        if self.event_queue_capacity == 0 {
            return Err(MirrorError::Config(
                "event_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_config_builder() {
        let config = BridgeConfig::new()
            .with_accumulate(true)
            .with_diff(true)
            .with_timestamps(true)
            .with_substitution("12**:AB**")
            .disable_rx_for("Cmd")
            .with_unknown_ids(UnknownIdPolicy::Ignore)
            .with_echo_grace(Duration::from_millis(500));

        assert!(config.accumulate);
        assert!(config.diff);
        assert_eq!(config.timestamp_mode(), Some(TimestampMode::Relative));
        assert_eq!(config.disable_rx, vec!["Cmd".to_string()]);
        assert_eq!(config.unknown_ids, UnknownIdPolicy::Ignore);
        assert_eq!(config.echo_grace(), Duration::from_millis(500));
        assert!(config.substitution_rule().unwrap().is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timestamp_modes() {
        assert_eq!(BridgeConfig::new().timestamp_mode(), None);
        assert_eq!(
            BridgeConfig::new()
                .with_timestamps(true)
                .with_absolute_time(true)
                .timestamp_mode(),
            Some(TimestampMode::Absolute)
        );
    }

    #[test]
    fn test_invalid_substitution_fails_validation() {
        let config = BridgeConfig::new().with_substitution("12**:AB*");
        assert!(matches!(config.validate(), Err(MirrorError::InvalidPattern(_))));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{"accumulate": true, "unknown_ids": "ignore", "rx_filter": "*321"}"#,
        )
        .unwrap();
        assert!(config.accumulate);
        assert!(!config.diff);
        assert_eq!(config.unknown_ids, UnknownIdPolicy::Ignore);
        assert_eq!(config.rx_filter.unwrap().mask, 0xFFF);
        assert_eq!(config.echo_grace_ms, 2_000);
    }
}
