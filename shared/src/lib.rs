use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod flags;

pub type ConnectionId = u32;
pub type PlayerId = u32;

/// Protocol revision clients must report in their login packet.
pub const PROTOCOL_VERSION: u8 = 5;
/// Maximum display-name length after normalization.
pub const MAX_NAME_LENGTH: usize = 20;
/// Sentinel session value for anonymous logins.
pub const SESSION_NONE: &str = "none";

pub const DEFAULT_FLAG: &str = "GB";
pub const MUTE_DURATION_MS: u64 = 10 * 60 * 1000;
pub const MIN_PLAYTIME_TO_VOTE_MS: u64 = 60 * 1000;
pub const LOGIN_TIMEOUT_MS: u64 = 10 * 1000;
pub const MUTE_SWEEP_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Login request fields as reported by the client.
///
/// Everything in here is untrusted until the admission controller has
/// validated and normalized it.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoginMessage {
    pub protocol: u8,
    pub name: String,
    /// Either a JSON session payload or [`SESSION_NONE`].
    pub session: String,
    pub flag: String,
    pub horizon_x: u16,
    pub horizon_y: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum ClientPacket {
    Login(LoginMessage),
    VoteMute { target: PlayerId },
    Disconnect,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    IncorrectProtocol,
    InvalidLoginData,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RankingEntry {
    pub player_id: PlayerId,
    pub score: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum ServerPacket {
    Error { code: ErrorCode },
    CommandReply { text: String },
    VoteMutePassed { target: PlayerId },
    Ranking { entries: Vec<RankingEntry> },
    Disconnected { reason: String },
}
