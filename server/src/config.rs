//! Runtime configuration for the session and moderation core.

use shared::{
    DEFAULT_FLAG, LOGIN_TIMEOUT_MS, MIN_PLAYTIME_TO_VOTE_MS, MUTE_DURATION_MS,
};

/// Options recognized by the admission controller and moderation engine.
///
/// Built once at startup from command-line arguments and passed by reference
/// to the components that need it.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// When true, non-"none" session payloads must carry a resolvable token.
    pub auth_active: bool,
    /// When false, characters outside printable ASCII are stripped from names.
    pub allow_non_ascii_usernames: bool,
    /// Reserved display-name prefix for bot connections. May carry
    /// surrounding whitespace; both the raw and trimmed forms are enforced.
    pub bots_name_prefix: String,
    /// How long a vote-mute or server mute lasts.
    pub mute_duration_ms: u64,
    /// Minimum accumulated active play time before a vote counts.
    pub min_playtime_to_vote_ms: u64,
    /// Flag assigned when neither the client nor geolocation provides one.
    pub default_flag: String,
    /// How long a fresh connection may sit without completing login.
    pub login_timeout_ms: u64,
    /// Hard cap on simultaneous connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            auth_active: false,
            allow_non_ascii_usernames: false,
            bots_name_prefix: String::new(),
            mute_duration_ms: MUTE_DURATION_MS,
            min_playtime_to_vote_ms: MIN_PLAYTIME_TO_VOTE_MS,
            default_flag: DEFAULT_FLAG.to_string(),
            login_timeout_ms: LOGIN_TIMEOUT_MS,
            max_connections: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert!(!config.auth_active);
        assert!(!config.allow_non_ascii_usernames);
        assert!(config.bots_name_prefix.is_empty());
        assert_eq!(config.default_flag, "GB");
        assert!(config.mute_duration_ms > 0);
    }
}
