pub mod call;
pub mod media;
pub mod peer;
pub mod signaling;
pub mod types;

pub use call::Call;
pub use media::{LocalMedia, RemoteMedia, RemoteStats};
pub use peer::PeerLink;
pub use signaling::{connect, validate_signaling_url, SignalingLink};
pub use types::{
    CallCommand, CallConfig, CallEvent, CallOutcome, MediaConfig, MediaKind, Role,
    DEFAULT_ICE_SERVER,
};
