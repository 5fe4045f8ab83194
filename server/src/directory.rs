//! Shared index of connections, players and IP associations.
//!
//! This module is pure data: every method performs exactly the lookup or
//! mutation requested and nothing else. The runtime owns a single
//! [`Directory`] and hands it by mutable reference to each handler, so all
//! mutation happens within one logical tick. Handlers must not keep
//! references across ticks; always re-resolve by id before mutating.

use log::info;
use shared::{timestamp_ms, ConnectionId, PlayerId};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

/// Score awarded to the killer when a kill is recorded.
const KILL_SCORE: u32 = 25;

/// One transport-level link.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub ip: IpAddr,
    /// Set while a login request is in flight; blocks duplicate admission.
    pub pending_login: bool,
    /// Bound exactly once by successful admission, never cleared afterwards.
    pub player_id: Option<PlayerId>,
    /// The primary game connection, as opposed to auxiliary ones.
    pub is_main: bool,
    pub is_bot: bool,
    /// Deadline (ms since epoch) by which login must complete. `None` once
    /// cancelled or fired.
    pub login_deadline: Option<u64>,
}

impl Connection {
    pub fn new(id: ConnectionId, addr: SocketAddr, is_bot: bool, login_timeout_ms: u64) -> Self {
        Self {
            id,
            addr,
            ip: addr.ip(),
            pending_login: false,
            player_id: None,
            is_main: false,
            is_bot,
            login_deadline: Some(timestamp_ms() + login_timeout_ms),
        }
    }

    /// Cancels the scheduled login timeout. Idempotent: cancelling an
    /// already-cancelled or already-fired timeout is a no-op.
    pub fn cancel_login_timeout(&mut self) {
        self.login_deadline = None;
    }
}

/// One active game participant.
#[derive(Debug)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    /// Current IP; may change across reconnects.
    pub ip: IpAddr,
    pub active_playing_ms: u64,
    /// Timestamp (ms since epoch) until which chat is muted. A value in the
    /// past means not muted.
    pub unmute_time: u64,
    pub score: u32,
    pub kills: u32,
    pub deaths: u32,
    pub level: u8,
    /// Persisted-account user id; empty for anonymous players.
    pub user_id: String,
}

impl Player {
    pub fn new(id: PlayerId, name: String, ip: IpAddr) -> Self {
        Self {
            id,
            name,
            ip,
            active_playing_ms: 0,
            unmute_time: 0,
            score: 0,
            kills: 0,
            deaths: 0,
            level: 1,
            user_id: String::new(),
        }
    }
}

/// Metric used for leaderboard snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingMetric {
    Score,
    Kills,
    Level,
}

#[derive(Default)]
pub struct Directory {
    connections: HashMap<ConnectionId, Connection>,
    players: HashMap<PlayerId, Player>,
    main_connection_by_player: HashMap<PlayerId, ConnectionId>,
    connections_by_ip: HashMap<IpAddr, HashSet<ConnectionId>>,
    ip_mutes: HashMap<IpAddr, u64>,
    human_connections: HashSet<ConnectionId>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&mut self, connection: Connection) {
        info!(
            "Connection {} opened from {}",
            connection.id, connection.addr
        );
        self.connections_by_ip
            .entry(connection.ip)
            .or_default()
            .insert(connection.id);
        self.connections.insert(connection.id, connection);
    }

    /// Removes the connection and its IP association. Player cleanup is the
    /// caller's responsibility, so partial teardown stays impossible.
    pub fn remove_connection(&mut self, connection_id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&connection_id)?;

        if let Some(ids) = self.connections_by_ip.get_mut(&connection.ip) {
            ids.remove(&connection_id);
            if ids.is_empty() {
                self.connections_by_ip.remove(&connection.ip);
            }
        }
        self.human_connections.remove(&connection_id);

        info!("Connection {} closed", connection_id);
        Some(connection)
    }

    pub fn connection(&self, connection_id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&connection_id)
    }

    pub fn connection_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Iterates the live connections, in no particular order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn find_connection_by_addr(&self, addr: SocketAddr) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|(_, connection)| connection.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn connections_from_ip(&self, ip: IpAddr) -> Vec<ConnectionId> {
        self.connections_by_ip
            .get(&ip)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Registers a freshly created player, binds it to its main connection
    /// and counts the connection as human unless it belongs to a bot.
    pub fn add_player(&mut self, player: Player, main_connection_id: ConnectionId) {
        let player_id = player.id;

        self.players.insert(player_id, player);
        self.main_connection_by_player
            .insert(player_id, main_connection_id);

        if let Some(connection) = self.connections.get_mut(&main_connection_id) {
            connection.player_id = Some(player_id);
            if !connection.is_bot {
                self.human_connections.insert(main_connection_id);
            }
        }
    }

    pub fn remove_player(&mut self, player_id: PlayerId) -> Option<Player> {
        if let Some(connection_id) = self.main_connection_by_player.remove(&player_id) {
            self.human_connections.remove(&connection_id);
        }
        self.players.remove(&player_id)
    }

    pub fn player(&self, player_id: PlayerId) -> Option<&Player> {
        self.players.get(&player_id)
    }

    pub fn player_mut(&mut self, player_id: PlayerId) -> Option<&mut Player> {
        self.players.get_mut(&player_id)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// A player is connected while it exists and has a main connection.
    pub fn is_player_connected(&self, player_id: PlayerId) -> bool {
        self.players.contains_key(&player_id)
            && self.main_connection_by_player.contains_key(&player_id)
    }

    pub fn main_connection_id(&self, player_id: PlayerId) -> Option<ConnectionId> {
        self.main_connection_by_player.get(&player_id).copied()
    }

    pub fn human_connection_count(&self) -> usize {
        self.human_connections.len()
    }

    pub fn ip_mute(&self, ip: IpAddr) -> Option<u64> {
        self.ip_mutes.get(&ip).copied()
    }

    pub fn set_ip_mute(&mut self, ip: IpAddr, unmute_time: u64) {
        self.ip_mutes.insert(ip, unmute_time);
    }

    pub fn remove_ip_mute(&mut self, ip: IpAddr) {
        self.ip_mutes.remove(&ip);
    }

    /// Stable snapshot of the mute table, safe to iterate while entries are
    /// removed underneath.
    pub fn ip_mutes_snapshot(&self) -> Vec<(IpAddr, u64)> {
        self.ip_mutes.iter().map(|(ip, t)| (*ip, *t)).collect()
    }

    pub fn record_kill(&mut self, killer_id: PlayerId, victim_id: PlayerId) {
        if let Some(killer) = self.players.get_mut(&killer_id) {
            killer.kills += 1;
            killer.score += KILL_SCORE;
        }
        if let Some(victim) = self.players.get_mut(&victim_id) {
            victim.deaths += 1;
        }
    }

    /// Ordered player ids, best first, ties broken by id.
    pub fn snapshot_ranking(&self, metric: RankingMetric) -> Vec<PlayerId> {
        let mut ids: Vec<PlayerId> = self.players.keys().copied().collect();

        ids.sort_by(|a, b| {
            let value = |id: &PlayerId| -> u32 {
                let player = &self.players[id];
                match metric {
                    RankingMetric::Score => player.score,
                    RankingMetric::Kills => player.kills,
                    RankingMetric::Level => player.level as u32,
                }
            };
            value(b).cmp(&value(a)).then_with(|| a.cmp(b))
        });

        ids
    }

    /// Credits active play time to every connected player.
    pub fn accumulate_active_playing(&mut self, dt_ms: u64) {
        let connected: Vec<PlayerId> = self.main_connection_by_player.keys().copied().collect();
        for player_id in connected {
            if let Some(player) = self.players.get_mut(&player_id) {
                player.active_playing_ms += dt_ms;
            }
        }
    }

    /// Connections whose login deadline has passed.
    pub fn expired_login_deadlines(&self, now: u64) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|connection| connection.login_deadline.is_some_and(|deadline| now >= deadline))
            .map(|connection| connection.id)
            .collect()
    }
}
