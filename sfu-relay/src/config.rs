//! Deserializable knobs for pipelines built by a [`HandlerRegistry`](crate::HandlerRegistry).

use crate::handler::{
    DEFAULT_KEYFRAME_TIMEOUT, DEFAULT_PADDING_PACKETS, DEFAULT_PLI_PERIOD,
    DEFAULT_RETRANSMISSION_BUFFER_SIZE, DEFAULT_SWITCH_TIMEOUT, FEEDBACK_GENERATION_HANDLER_NAME,
    STATS_HANDLER_NAME,
};
use crate::nack::NackPolicy;
use crate::report::{DEFAULT_AUDIO_INTERVAL, DEFAULT_VIDEO_INTERVAL};
use serde::Deserialize;
use std::time::Duration;

/// Per-handler settings shared by every factory in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    pub nacks_enabled: bool,
    pub nack_policy: NackPolicy,
    pub padding_enabled: bool,
    pub padding_packets: usize,
    pub pli_period_ms: u64,
    pub keyframe_timeout_ms: u64,
    pub layer_switch_timeout_ms: u64,
    pub rtcp_video_interval_ms: u64,
    pub rtcp_audio_interval_ms: u64,
    /// Sent packets kept per sink SSRC for answering NACKs.
    pub retransmission_buffer_size: u16,
    /// SSRC used as sender of generated RTCP. Random when absent.
    pub sender_ssrc: Option<u32>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            nacks_enabled: true,
            nack_policy: NackPolicy::default(),
            padding_enabled: false,
            padding_packets: DEFAULT_PADDING_PACKETS,
            pli_period_ms: DEFAULT_PLI_PERIOD.as_millis() as u64,
            keyframe_timeout_ms: DEFAULT_KEYFRAME_TIMEOUT.as_millis() as u64,
            layer_switch_timeout_ms: DEFAULT_SWITCH_TIMEOUT.as_millis() as u64,
            rtcp_video_interval_ms: DEFAULT_VIDEO_INTERVAL.as_millis() as u64,
            rtcp_audio_interval_ms: DEFAULT_AUDIO_INTERVAL.as_millis() as u64,
            retransmission_buffer_size: DEFAULT_RETRANSMISSION_BUFFER_SIZE,
            sender_ssrc: None,
        }
    }
}

impl HandlerConfig {
    pub fn pli_period(&self) -> Duration {
        Duration::from_millis(self.pli_period_ms)
    }

    pub fn keyframe_timeout(&self) -> Duration {
        Duration::from_millis(self.keyframe_timeout_ms)
    }

    pub fn layer_switch_timeout(&self) -> Duration {
        Duration::from_millis(self.layer_switch_timeout_ms)
    }

    pub fn rtcp_video_interval(&self) -> Duration {
        Duration::from_millis(self.rtcp_video_interval_ms)
    }

    pub fn rtcp_audio_interval(&self) -> Duration {
        Duration::from_millis(self.rtcp_audio_interval_ms)
    }
}

/// Ordered handler names, head (network side) first, plus their settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub handlers: Vec<String>,
    #[serde(flatten)]
    pub handler: HandlerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            handlers: vec![
                STATS_HANDLER_NAME.to_owned(),
                FEEDBACK_GENERATION_HANDLER_NAME.to_owned(),
            ],
            handler: HandlerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.handler.pli_period(), Duration::from_millis(200));
        assert_eq!(config.handler.rtcp_video_interval(), Duration::from_secs(1));
        assert_eq!(config.handler.rtcp_audio_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_config() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{
                "handlers": ["layer-filter", "padding-generator"],
                "nack_policy": "list",
                "padding_enabled": true,
                "padding_packets": 3,
                "sender_ssrc": 1234,
                "retransmission_buffer_size": 512
            }"#,
        )
        .unwrap();
        assert_eq!(config.handlers, vec!["layer-filter", "padding-generator"]);
        assert_eq!(config.handler.nack_policy, NackPolicy::List);
        assert!(config.handler.padding_enabled);
        assert_eq!(config.handler.padding_packets, 3);
        assert_eq!(config.handler.sender_ssrc, Some(1234));
        assert_eq!(config.handler.retransmission_buffer_size, 512);
        assert!(config.handler.nacks_enabled);
    }
}
