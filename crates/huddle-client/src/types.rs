use std::fmt;
use std::path::PathBuf;

use huddle_common::RoomName;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::media::RemoteStats;

/// Public STUN server used when no ICE servers are configured.
pub const DEFAULT_ICE_SERVER: &str = "stun:openrelay.metered.ca:80";

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub signaling_url: String,
    pub room: RoomName,
    pub ice_servers: Vec<String>,
    pub media: MediaConfig,
}

impl CallConfig {
    pub fn new(signaling_url: impl Into<String>, room: RoomName) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            room,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            media: MediaConfig::default(),
        }
    }
}

/// Where local audio/video samples come from.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Ogg/Opus file; silence is sent when absent.
    pub audio_file: Option<PathBuf>,
    /// IVF/VP8 file; the video track stays silent when absent.
    pub video_file: Option<PathBuf>,
    /// Requested frame size. Advisory only: file video is sent at the size it
    /// was encoded with, and a mismatch is logged.
    pub video_width: u32,
    pub video_height: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio_file: None,
            video_file: None,
            video_width: 500,
            video_height: 500,
        }
    }
}

/// Which side of the call we are on. The host sends the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Guest,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Guest => write!(f, "guest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(Self::Audio),
            RTPCodecType::Video => Some(Self::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// User-facing controls for a running call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    ToggleMic,
    ToggleCamera,
    Stats,
    Leave,
}

/// Things a front end may want to show.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    RoleAssigned(Role),
    LocalMediaReady,
    PeerConnected,
    RemoteTrack(MediaKind),
    PeerLeft,
    RoomFull,
    MicToggled { active: bool },
    CameraToggled { active: bool },
    Stats(RemoteStats),
    Left,
}

/// Why [`crate::Call::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Left,
    RoomFull,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_config_defaults() {
        let config = CallConfig::new("ws://127.0.0.1:3000", RoomName::parse("r").unwrap());
        assert_eq!(config.ice_servers, vec![DEFAULT_ICE_SERVER.to_string()]);
        assert_eq!(
            (config.media.video_width, config.media.video_height),
            (500, 500)
        );
    }

    #[test]
    fn test_media_kind_from_codec_type() {
        assert_eq!(
            MediaKind::from_codec_type(RTPCodecType::Audio),
            Some(MediaKind::Audio)
        );
        assert_eq!(MediaKind::from_codec_type(RTPCodecType::Unspecified), None);
    }
}
