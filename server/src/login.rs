//! Login admission: turns a raw login request into a normalized
//! player-creation intent, or rejects it.
//!
//! The controller never creates players itself. A passing request is queued
//! on the connect-player channel via `delay` and materialized by the spawn
//! collaborator at the next tick flush. Rejections are reply events, never
//! hard faults, and all session-validation failures collapse into the same
//! "invalid login data" signal so the client learns nothing about which
//! sub-check failed.

use crate::config::ServerConfig;
use crate::directory::Directory;
use crate::events::{Channels, PlayerConnect, Response};
use log::{debug, info};
use serde_json::Value;
use shared::{flags, ConnectionId, LoginMessage, MAX_NAME_LENGTH, PROTOCOL_VERSION, SESSION_NONE};
use std::net::IpAddr;

/// Maps a session token to a user id. An empty string means the token is
/// invalid.
pub trait TokenResolver {
    fn user_id_from_token(&self, token: &str) -> String;
}

/// IP-to-country lookup.
pub trait Geocoder {
    fn country_code(&self, ip: IpAddr) -> Option<String>;
}

/// Resolver that accepts the token itself as the user id.
pub struct PlainTokenResolver;

impl TokenResolver for PlainTokenResolver {
    fn user_id_from_token(&self, token: &str) -> String {
        token.trim().to_string()
    }
}

/// Geocoder with no database behind it; every lookup misses.
pub struct NullGeocoder;

impl Geocoder for NullGeocoder {
    fn country_code(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

pub struct LoginController {
    auth_active: bool,
    allow_non_ascii_usernames: bool,
    default_flag: String,
    bots_name_prefix_testers: Vec<String>,
}

impl LoginController {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            auth_active: config.auth_active,
            allow_non_ascii_usernames: config.allow_non_ascii_usernames,
            default_flag: config.default_flag.clone(),
            bots_name_prefix_testers: Self::prefix_testers(&config.bots_name_prefix),
        }
    }

    /// The configured prefix is enforced both raw and trimmed, as two
    /// distinct testers.
    fn prefix_testers(prefix: &str) -> Vec<String> {
        if prefix.is_empty() {
            return Vec::new();
        }

        let mut testers = vec![prefix.to_string()];
        let trimmed = prefix.trim();

        if trimmed != prefix {
            testers.push(trimmed.to_string());
        }

        testers
    }

    fn has_bots_name_prefix(&self, name: &str) -> bool {
        self.bots_name_prefix_testers
            .iter()
            .any(|tester| name.starts_with(tester.as_str()))
    }

    pub fn normalize_name(&self, raw: &str) -> String {
        normalize_name(raw, self.allow_non_ascii_usernames)
    }

    fn resolve_user_id(&self, resolver: &dyn TokenResolver, session: &str) -> Option<String> {
        if !self.auth_active || session == SESSION_NONE {
            return Some(String::new());
        }

        let payload: Value = serde_json::from_str(session).ok()?;
        let token = payload.get("token")?.as_str()?;
        let user_id = resolver.user_id_from_token(token);

        if user_id.is_empty() {
            None
        } else {
            Some(user_id)
        }
    }

    fn resolve_flag(&self, client_flag: &str, ip: IpAddr, geocoder: &dyn Geocoder) -> String {
        let upper = client_flag.to_uppercase();
        if flags::is_known(&upper) {
            return upper;
        }

        if let Some(code) = geocoder.country_code(ip) {
            let code = code.to_uppercase();
            if flags::is_known(&code) {
                return code;
            }
        }

        self.default_flag.clone()
    }

    /// Emits a rejection and settles the admission attempt, so a corrected
    /// retry on the same connection is not swallowed by the pending guard.
    fn reject(
        directory: &mut Directory,
        channels: &mut Channels,
        connection_id: ConnectionId,
        response: Response,
    ) {
        if let Some(connection) = directory.connection_mut(connection_id) {
            connection.pending_login = false;
        }
        channels.responses.emit(&response);
    }

    /// Handles a login request for `connection_id`.
    pub fn on_login(
        &self,
        directory: &mut Directory,
        channels: &mut Channels,
        resolver: &dyn TokenResolver,
        geocoder: &dyn Geocoder,
        connection_id: ConnectionId,
        msg: &LoginMessage,
    ) {
        let previous_player = {
            let connection = match directory.connection_mut(connection_id) {
                Some(connection) => connection,
                None => return,
            };

            // A second request while one is in flight has no effect.
            if connection.pending_login {
                return;
            }

            connection.pending_login = true;
            connection.cancel_login_timeout();
            connection.player_id
        };

        // Duplicate login packet for an already-authenticated connection:
        // kick the player bound earlier, not whoever this request names.
        if let Some(player_id) = previous_player {
            info!(
                "Double login, connection {} refused (player {})",
                connection_id, player_id
            );
            channels.responses.emit(&Response::KickPlayer { player_id });

            return;
        }

        let (is_bot, ip) = {
            let connection = match directory.connection_mut(connection_id) {
                Some(connection) => connection,
                None => return,
            };

            connection.is_main = true;
            (connection.is_bot, connection.ip)
        };

        if msg.protocol != PROTOCOL_VERSION {
            Self::reject(
                directory,
                channels,
                connection_id,
                Response::IncorrectProtocol { connection_id },
            );

            return;
        }

        let user_id = match self.resolve_user_id(resolver, &msg.session) {
            Some(user_id) => user_id,
            None => {
                Self::reject(
                    directory,
                    channels,
                    connection_id,
                    Response::InvalidLoginData { connection_id },
                );

                return;
            }
        };

        let name = self.normalize_name(&msg.name);

        if name.is_empty()
            || name.chars().count() > MAX_NAME_LENGTH
            || msg.name.chars().all(char::is_whitespace)
            || (!is_bot
                && !self.bots_name_prefix_testers.is_empty()
                && self.has_bots_name_prefix(&name))
        {
            Self::reject(
                directory,
                channels,
                connection_id,
                Response::InvalidLoginData { connection_id },
            );

            return;
        }

        let flag = self.resolve_flag(&msg.flag, ip, geocoder);

        channels.connect_player.delay(PlayerConnect {
            connection_id,
            name,
            flag,
            horizon_x: msg.horizon_x,
            horizon_y: msg.horizon_y,
            user_id,
        });

        debug!("Admission queued for connection {}", connection_id);
    }
}

/// Name normalization pipeline, in order: strip characters outside printable
/// ASCII (when configured), collapse runs of two-or-more whitespace
/// characters to one space, trim the ends. Applying it twice equals applying
/// it once.
fn normalize_name(raw: &str, allow_non_ascii: bool) -> String {
    let kept: String = if allow_non_ascii {
        raw.to_string()
    } else {
        raw.chars().filter(|c| (' '..='~').contains(c)).collect()
    };

    let mut collapsed = String::with_capacity(kept.len());
    let mut run = 0usize;
    let mut run_char = ' ';

    for c in kept.chars() {
        if c.is_whitespace() {
            run += 1;
            run_char = c;
        } else {
            // A lone whitespace character survives as-is; only runs collapse.
            match run {
                0 => {}
                1 => collapsed.push(run_char),
                _ => collapsed.push(' '),
            }
            run = 0;
            collapsed.push(c);
        }
    }
    match run {
        0 => {}
        1 => collapsed.push(run_char),
        _ => collapsed.push(' '),
    }

    collapsed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Connection;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    struct StubResolver(&'static str);

    impl TokenResolver for StubResolver {
        fn user_id_from_token(&self, _token: &str) -> String {
            self.0.to_string()
        }
    }

    struct StubGeocoder(Option<&'static str>);

    impl Geocoder for StubGeocoder {
        fn country_code(&self, _ip: IpAddr) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn test_addr() -> SocketAddr {
        "203.0.113.7:3000".parse().unwrap()
    }

    fn login_msg(name: &str) -> LoginMessage {
        LoginMessage {
            protocol: PROTOCOL_VERSION,
            name: name.to_string(),
            session: SESSION_NONE.to_string(),
            flag: "se".to_string(),
            horizon_x: 1920,
            horizon_y: 1080,
        }
    }

    struct Harness {
        directory: Directory,
        channels: Channels,
        responses: Arc<Mutex<Vec<Response>>>,
        intents: Arc<Mutex<Vec<PlayerConnect>>>,
    }

    fn harness(config: &ServerConfig) -> (LoginController, Harness) {
        let mut directory = Directory::new();
        directory.add_connection(Connection::new(1, test_addr(), false, 10_000));

        let mut channels = Channels::new();
        let responses = Arc::new(Mutex::new(Vec::new()));
        let intents = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&responses);
        channels.responses.subscribe(move |event: &Response| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });

        let sink = Arc::clone(&intents);
        channels.connect_player.subscribe(move |event: &PlayerConnect| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });

        (
            LoginController::new(config),
            Harness {
                directory,
                channels,
                responses,
                intents,
            },
        )
    }

    fn run_login(controller: &LoginController, h: &mut Harness, msg: &LoginMessage) {
        controller.on_login(
            &mut h.directory,
            &mut h.channels,
            &StubResolver("user-1"),
            &StubGeocoder(None),
            1,
            msg,
        );
    }

    #[test]
    fn test_normalize_collapses_and_trims() {
        let controller = LoginController::new(&ServerConfig::default());
        assert_eq!(controller.normalize_name("  a   b  "), "a b");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let controller = LoginController::new(&ServerConfig::default());

        for raw in ["  a   b  ", "plain", " x\t\ty ", "héllo  there"] {
            let once = controller.normalize_name(raw);
            let twice = controller.normalize_name(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_normalize_strips_non_ascii_when_disallowed() {
        let controller = LoginController::new(&ServerConfig::default());
        assert_eq!(controller.normalize_name("Pïlot"), "Plot");

        let permissive = LoginController::new(&ServerConfig {
            allow_non_ascii_usernames: true,
            ..ServerConfig::default()
        });
        assert_eq!(permissive.normalize_name("Pïlot"), "Pïlot");
    }

    #[test]
    fn test_successful_login_queues_intent_on_flush() {
        let (controller, mut h) = harness(&ServerConfig::default());
        run_login(&controller, &mut h, &login_msg("  a   b  "));

        // Admission is deferred; nothing delivered until the tick flush.
        assert!(h.intents.lock().unwrap().is_empty());
        assert_eq!(h.channels.connect_player.pending_len(), 1);

        h.channels.connect_player.emit_delayed();

        let intents = h.intents.lock().unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].connection_id, 1);
        assert_eq!(intents[0].name, "a b");
        assert_eq!(intents[0].flag, "SE");
        assert_eq!(intents[0].horizon_x, 1920);
        assert_eq!(intents[0].user_id, "");
        assert!(h.responses.lock().unwrap().is_empty());
    }

    #[test]
    fn test_second_request_while_pending_is_noop() {
        let (controller, mut h) = harness(&ServerConfig::default());
        run_login(&controller, &mut h, &login_msg("Eve"));
        run_login(&controller, &mut h, &login_msg("Eve"));

        assert_eq!(h.channels.connect_player.pending_len(), 1);
        assert!(h.responses.lock().unwrap().is_empty());
    }

    #[test]
    fn test_login_cancels_login_timeout() {
        let (controller, mut h) = harness(&ServerConfig::default());
        assert!(h.directory.connection(1).unwrap().login_deadline.is_some());

        run_login(&controller, &mut h, &login_msg("Eve"));
        assert!(h.directory.connection(1).unwrap().login_deadline.is_none());
    }

    #[test]
    fn test_rejection_settles_pending_and_allows_retry() {
        let (controller, mut h) = harness(&ServerConfig::default());

        let mut msg = login_msg("Eve");
        msg.protocol = 4;
        run_login(&controller, &mut h, &msg);
        assert!(!h.directory.connection(1).unwrap().pending_login);

        // A corrected request on the same connection goes through.
        run_login(&controller, &mut h, &login_msg("Eve"));
        assert_eq!(h.channels.connect_player.pending_len(), 1);
    }

    #[test]
    fn test_double_login_kicks_previously_bound_player() {
        let (controller, mut h) = harness(&ServerConfig::default());
        h.directory.connection_mut(1).unwrap().player_id = Some(7);

        run_login(&controller, &mut h, &login_msg("Mallory"));

        assert_eq!(
            *h.responses.lock().unwrap(),
            vec![Response::KickPlayer { player_id: 7 }]
        );
        assert_eq!(h.channels.connect_player.pending_len(), 0);
    }

    #[test]
    fn test_incorrect_protocol_rejected_before_validation() {
        let (controller, mut h) = harness(&ServerConfig::default());
        let mut msg = login_msg("");
        msg.protocol = 4;

        run_login(&controller, &mut h, &msg);

        assert_eq!(
            *h.responses.lock().unwrap(),
            vec![Response::IncorrectProtocol { connection_id: 1 }]
        );
    }

    #[test]
    fn test_whitespace_only_name_rejected() {
        let (controller, mut h) = harness(&ServerConfig::default());
        run_login(&controller, &mut h, &login_msg("   "));

        assert_eq!(
            *h.responses.lock().unwrap(),
            vec![Response::InvalidLoginData { connection_id: 1 }]
        );
        assert_eq!(h.channels.connect_player.pending_len(), 0);
    }

    #[test]
    fn test_overlong_name_rejected() {
        let (controller, mut h) = harness(&ServerConfig::default());
        run_login(&controller, &mut h, &login_msg(&"x".repeat(21)));

        assert_eq!(
            *h.responses.lock().unwrap(),
            vec![Response::InvalidLoginData { connection_id: 1 }]
        );
    }

    #[test]
    fn test_twenty_char_name_admitted() {
        let (controller, mut h) = harness(&ServerConfig::default());
        run_login(&controller, &mut h, &login_msg(&"x".repeat(20)));

        assert!(h.responses.lock().unwrap().is_empty());
        assert_eq!(h.channels.connect_player.pending_len(), 1);
    }

    #[test]
    fn test_bot_prefix_rejected_for_humans_only() {
        let config = ServerConfig {
            bots_name_prefix: "[BOT] ".to_string(),
            ..ServerConfig::default()
        };

        let (controller, mut h) = harness(&config);
        run_login(&controller, &mut h, &login_msg("[BOT] Eve"));
        assert_eq!(
            *h.responses.lock().unwrap(),
            vec![Response::InvalidLoginData { connection_id: 1 }]
        );

        // Same name on a bot connection passes the gate.
        let (controller, mut h) = harness(&config);
        h.directory.connection_mut(1).unwrap().is_bot = true;
        run_login(&controller, &mut h, &login_msg("[BOT] Eve"));
        assert!(h.responses.lock().unwrap().is_empty());
        assert_eq!(h.channels.connect_player.pending_len(), 1);
    }

    #[test]
    fn test_trimmed_bot_prefix_also_enforced() {
        let config = ServerConfig {
            bots_name_prefix: "[BOT] ".to_string(),
            ..ServerConfig::default()
        };

        let (controller, mut h) = harness(&config);
        run_login(&controller, &mut h, &login_msg("[BOT]Eve"));

        assert_eq!(
            *h.responses.lock().unwrap(),
            vec![Response::InvalidLoginData { connection_id: 1 }]
        );
    }

    #[test]
    fn test_session_validation_failures_collapse() {
        let config = ServerConfig {
            auth_active: true,
            ..ServerConfig::default()
        };

        let bad_sessions = [
            "{not json",
            "{}",
            r#"{"token": 42}"#,
            r#"{"token": "anything"}"#, // resolver below returns empty
        ];

        for session in bad_sessions {
            let (controller, mut h) = harness(&config);
            let mut msg = login_msg("Eve");
            msg.session = session.to_string();

            controller.on_login(
                &mut h.directory,
                &mut h.channels,
                &StubResolver(""),
                &StubGeocoder(None),
                1,
                &msg,
            );

            assert_eq!(
                *h.responses.lock().unwrap(),
                vec![Response::InvalidLoginData { connection_id: 1 }],
                "session {:?} should be rejected",
                session
            );
        }
    }

    #[test]
    fn test_valid_session_resolves_user_id() {
        let config = ServerConfig {
            auth_active: true,
            ..ServerConfig::default()
        };

        let (controller, mut h) = harness(&config);
        let mut msg = login_msg("Eve");
        msg.session = r#"{"token": "abc"}"#.to_string();

        run_login(&controller, &mut h, &msg);
        h.channels.connect_player.emit_delayed();

        let intents = h.intents.lock().unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].user_id, "user-1");
    }

    #[test]
    fn test_flag_falls_back_to_geolocation_then_default() {
        let (controller, mut h) = harness(&ServerConfig::default());
        let mut msg = login_msg("Eve");
        msg.flag = "zz".to_string();

        controller.on_login(
            &mut h.directory,
            &mut h.channels,
            &StubResolver(""),
            &StubGeocoder(Some("fi")),
            1,
            &msg,
        );
        h.channels.connect_player.emit_delayed();
        assert_eq!(h.intents.lock().unwrap()[0].flag, "FI");

        let (controller, mut h) = harness(&ServerConfig::default());
        run_login(&controller, &mut h, &msg);
        h.channels.connect_player.emit_delayed();
        assert_eq!(h.intents.lock().unwrap()[0].flag, "GB");
    }

    #[test]
    fn test_unknown_connection_is_noop() {
        let (controller, mut h) = harness(&ServerConfig::default());
        controller.on_login(
            &mut h.directory,
            &mut h.channels,
            &StubResolver(""),
            &StubGeocoder(None),
            99,
            &login_msg("Eve"),
        );

        assert!(h.responses.lock().unwrap().is_empty());
        assert_eq!(h.channels.connect_player.pending_len(), 0);
    }
}
