//! Router configuration.

use crate::data::RtpCodecCapability;
use common::MediaKind;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};

/// Default RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Media router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// IP announced in ICE candidates.
    pub announced_ip: IpAddr,
    /// Lowest RTC port handed out to transports.
    pub rtc_min_port: u16,
    /// Highest RTC port handed out to transports.
    pub rtc_max_port: u16,
    /// Codecs the router supports.
    pub codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            announced_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rtc_min_port: DEFAULT_RTC_MIN_PORT,
            rtc_max_port: DEFAULT_RTC_MAX_PORT,
            codecs: default_codecs(),
        }
    }
}

/// The stock codec set: Opus audio plus VP8/VP9/H264 video.
#[must_use]
pub fn default_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: json!({}),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: json!({}),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP9".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: json!({ "profile-id": 2 }),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: json!({
                "packetization-mode": 1,
                "profile-level-id": "42e01f",
                "level-asymmetry-allowed": 1,
            }),
        },
    ]
}
