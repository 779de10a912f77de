use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest room name the client will send to the relay.
pub const MAX_ROOM_NAME_CHARS: usize = 128;

/// Validated room name. Trimmed, non-empty, no control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidRoom("room name is empty".into()));
        }
        if trimmed.chars().count() > MAX_ROOM_NAME_CHARS {
            return Err(Error::InvalidRoom(format!(
                "room name longer than {MAX_ROOM_NAME_CHARS} characters"
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(Error::InvalidRoom(
                "room name contains control characters".into(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RoomName> for String {
    fn from(room: RoomName) -> Self {
        room.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the shape browsers put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// Trickled ICE candidate, field names as in the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Events a client emits to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Enter a room, creating it if nobody is there yet.
    Join { room: RoomName },
    /// Local media is up; the peer already in the room may call us.
    Ready { room: RoomName },
    Offer {
        room: RoomName,
        description: SessionDescription,
    },
    Answer {
        room: RoomName,
        description: SessionDescription,
    },
    IceCandidate {
        room: RoomName,
        candidate: IceCandidate,
    },
    Leave { room: RoomName },
}

impl ClientEvent {
    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Ready { .. } => "ready",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Leave { .. } => "leave",
        }
    }

    pub fn room(&self) -> &RoomName {
        match self {
            Self::Join { room }
            | Self::Ready { room }
            | Self::Offer { room, .. }
            | Self::Answer { room, .. }
            | Self::IceCandidate { room, .. }
            | Self::Leave { room } => room,
        }
    }
}

/// Events the relay delivers to a client.
///
/// Payloads on events that carry nothing of interest (`created`, `full`,
/// `leave`, ...) are ignored, since relays often echo the room name there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    try_from = "RawRelayEvent"
)]
pub enum RelayEvent {
    /// The room did not exist; we are its first occupant.
    Created,
    /// The room had one occupant; we are the second.
    Joined,
    /// Both seats are taken.
    Full,
    /// The other occupant is ready to be called.
    Ready,
    Offer { description: SessionDescription },
    Answer { description: SessionDescription },
    IceCandidate { candidate: IceCandidate },
    /// The other occupant left.
    Leave,
}

impl RelayEvent {
    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Joined => "joined",
            Self::Full => "full",
            Self::Ready => "ready",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Leave => "leave",
        }
    }
}

/// A relay frame before its payload is checked against the event name.
#[derive(Deserialize)]
struct RawRelayEvent {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct DescriptionData {
    description: SessionDescription,
}

#[derive(Deserialize)]
struct CandidateData {
    candidate: IceCandidate,
}

impl TryFrom<RawRelayEvent> for RelayEvent {
    type Error = Error;

    fn try_from(raw: RawRelayEvent) -> Result<Self> {
        let event = match raw.event.as_str() {
            "created" => Self::Created,
            "joined" => Self::Joined,
            "full" => Self::Full,
            "ready" => Self::Ready,
            "leave" => Self::Leave,
            "offer" => Self::Offer {
                description: serde_json::from_value::<DescriptionData>(raw.data)?.description,
            },
            "answer" => Self::Answer {
                description: serde_json::from_value::<DescriptionData>(raw.data)?.description,
            },
            "ice-candidate" => Self::IceCandidate {
                candidate: serde_json::from_value::<CandidateData>(raw.data)?.candidate,
            },
            other => return Err(Error::protocol(format!("unknown relay event {other:?}"))),
        };
        Ok(event)
    }
}
