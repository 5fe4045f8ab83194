//! Server runtime: UDP transport adapter, component wiring and the tick loop.
//!
//! The transport edge is deliberately thin. Packets are bincode-decoded and
//! fed into the single-threaded tick loop over an mpsc channel; all handlers
//! run to completion there, so shared state never needs locking. Channel
//! listeners forward events into queues the loop drains, keeping the
//! admission and moderation components free of any socket knowledge.

use crate::channel::ListenerError;
use crate::config::ServerConfig;
use crate::directory::{Connection, Directory, Player, RankingMetric};
use crate::events::{Channels, PlayerConnect, Response};
use crate::login::{Geocoder, LoginController, NullGeocoder, PlainTokenResolver, TokenResolver};
use crate::moderation::Moderation;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    timestamp_ms, ClientPacket, ConnectionId, ErrorCode, PlayerId, RankingEntry, ServerPacket,
    MUTE_SWEEP_INTERVAL_MS,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// How many ticks between ranking broadcasts.
const RANKING_BROADCAST_TICKS: u64 = 60;
/// How many leaders a ranking broadcast carries.
const RANKING_BROADCAST_SIZE: usize = 10;

/// Messages sent from network tasks to the main server loop.
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: ClientPacket,
        addr: SocketAddr,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Messages sent from the main loop to the network sender task.
#[derive(Debug)]
pub enum OutboundMessage {
    Send {
        packet: ServerPacket,
        addr: SocketAddr,
    },
    Broadcast {
        packet: ServerPacket,
        addrs: Vec<SocketAddr>,
    },
}

pub struct Server {
    socket: Arc<UdpSocket>,
    config: ServerConfig,
    directory: Directory,
    channels: Channels,
    login: LoginController,
    moderation: Moderation,
    resolver: Box<dyn TokenResolver + Send>,
    geocoder: Box<dyn Geocoder + Send>,

    next_connection_id: ConnectionId,
    next_player_id: PlayerId,
    tick: u64,
    tick_duration: Duration,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    out_rx: Option<mpsc::UnboundedReceiver<OutboundMessage>>,
    intent_rx: mpsc::UnboundedReceiver<PlayerConnect>,
    response_rx: mpsc::UnboundedReceiver<Response>,
}

impl Server {
    pub async fn new(
        addr: &str,
        tick_duration: Duration,
        config: ServerConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let mut channels = Channels::new();

        // Forward channel deliveries into queues the tick loop drains.
        let (intent_tx, intent_rx) = mpsc::unbounded_channel();
        channels
            .connect_player
            .subscribe(move |event: &PlayerConnect| {
                intent_tx
                    .send(event.clone())
                    .map_err(|err| ListenerError(err.to_string()))
            });

        let (response_tx, response_rx) = mpsc::unbounded_channel();
        channels.responses.subscribe(move |event: &Response| {
            response_tx
                .send(event.clone())
                .map_err(|err| ListenerError(err.to_string()))
        });

        Ok(Server {
            socket,
            login: LoginController::new(&config),
            moderation: Moderation::new(config.mute_duration_ms, config.min_playtime_to_vote_ms),
            resolver: Box::new(PlainTokenResolver),
            geocoder: Box::new(NullGeocoder),
            config,
            directory: Directory::new(),
            channels,
            next_connection_id: 1,
            next_player_id: 1,
            tick: 0,
            tick_duration,
            server_tx,
            server_rx,
            out_tx,
            out_rx: Some(out_rx),
            intent_rx,
            response_rx,
        })
    }

    /// Spawns the task that continuously listens for incoming packets.
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<ClientPacket>(&buffer[0..len]) {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the task that drains the outgoing packet queue.
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut out_rx = match self.out_rx.take() {
            Some(rx) => rx,
            None => return,
        };

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message {
                    OutboundMessage::Send { packet, addr } => {
                        if let Err(e) = Self::send_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    OutboundMessage::Broadcast { packet, addrs } => {
                        for addr in addrs {
                            if let Err(e) = Self::send_impl(&socket, &packet, addr).await {
                                error!("Failed to broadcast to {}: {}", addr, e);
                            }
                        }
                    }
                }
            }
        });
    }

    async fn send_impl(
        socket: &UdpSocket,
        packet: &ServerPacket,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn queue_send(&self, packet: ServerPacket, addr: SocketAddr) {
        if self
            .out_tx
            .send(OutboundMessage::Send { packet, addr })
            .is_err()
        {
            error!("Failed to queue packet for {}", addr);
        }
    }

    fn send_to_connection(&self, connection_id: ConnectionId, packet: ServerPacket) {
        if let Some(connection) = self.directory.connection(connection_id) {
            self.queue_send(packet, connection.addr);
        }
    }

    /// Resolves the connection for `addr`, admitting a new one when there is
    /// capacity. Returns `None` when the server is full.
    fn connection_for_addr(&mut self, addr: SocketAddr) -> Option<ConnectionId> {
        if let Some(connection_id) = self.directory.find_connection_by_addr(addr) {
            return Some(connection_id);
        }

        if self.directory.connection_count() >= self.config.max_connections {
            self.queue_send(
                ServerPacket::Disconnected {
                    reason: "Server full".to_string(),
                },
                addr,
            );
            return None;
        }

        let connection_id = self.next_connection_id;
        self.next_connection_id += 1;
        self.directory.add_connection(Connection::new(
            connection_id,
            addr,
            false,
            self.config.login_timeout_ms,
        ));

        Some(connection_id)
    }

    fn handle_packet(&mut self, packet: ClientPacket, addr: SocketAddr) {
        let connection_id = match self.connection_for_addr(addr) {
            Some(connection_id) => connection_id,
            None => return,
        };

        match packet {
            ClientPacket::Login(msg) => {
                self.login.on_login(
                    &mut self.directory,
                    &mut self.channels,
                    self.resolver.as_ref(),
                    self.geocoder.as_ref(),
                    connection_id,
                    &msg,
                );
            }
            ClientPacket::VoteMute { target } => {
                let voter = self
                    .directory
                    .connection(connection_id)
                    .and_then(|connection| connection.player_id);

                if let Some(voter_id) = voter {
                    self.moderation.on_vote_mute(
                        &mut self.directory,
                        &mut self.channels,
                        voter_id,
                        target,
                    );
                }
            }
            ClientPacket::Disconnect => {
                self.close_connection(connection_id);
            }
        }

        self.drain_responses();
    }

    /// Tears down a connection and, for a main connection, its player.
    fn close_connection(&mut self, connection_id: ConnectionId) {
        let connection = match self.directory.remove_connection(connection_id) {
            Some(connection) => connection,
            None => return,
        };

        if connection.is_main {
            if let Some(player_id) = connection.player_id {
                self.directory.remove_player(player_id);
                self.moderation.on_player_removed(player_id);
                info!("Player {} removed", player_id);
            }
        }
    }

    /// Materializes a deferred admission intent into a Player.
    ///
    /// Re-resolves the connection: it may have closed between `delay` and
    /// the tick flush, and its player binding is set exactly once.
    fn spawn_player(&mut self, intent: PlayerConnect) {
        let (ip, taken) = match self.directory.connection_mut(intent.connection_id) {
            Some(connection) => {
                // The admission this intent came from is over either way;
                // later login packets must reach the double-login guard.
                connection.pending_login = false;
                (connection.ip, connection.player_id.is_some())
            }
            None => return,
        };
        if taken {
            return;
        }

        let player_id = self.next_player_id;
        self.next_player_id += 1;

        let mut player = Player::new(player_id, intent.name, ip);
        player.user_id = intent.user_id;

        // A standing IP mute applies to the new session immediately.
        if let Some(unmute_time) = self.directory.ip_mute(ip) {
            if unmute_time > timestamp_ms() {
                player.unmute_time = unmute_time;
            }
        }

        info!(
            "Player {} ({}) joined from connection {}",
            player_id, player.name, intent.connection_id
        );
        self.directory.add_player(player, intent.connection_id);
    }

    fn dispatch_response(&mut self, response: Response) {
        match response {
            Response::KickPlayer { player_id } => {
                if let Some(connection_id) = self.directory.main_connection_id(player_id) {
                    self.send_to_connection(
                        connection_id,
                        ServerPacket::Disconnected {
                            reason: "Kicked".to_string(),
                        },
                    );
                    self.close_connection(connection_id);
                }
            }
            Response::IncorrectProtocol { connection_id } => {
                self.send_to_connection(
                    connection_id,
                    ServerPacket::Error {
                        code: ErrorCode::IncorrectProtocol,
                    },
                );
            }
            Response::InvalidLoginData { connection_id } => {
                self.send_to_connection(
                    connection_id,
                    ServerPacket::Error {
                        code: ErrorCode::InvalidLoginData,
                    },
                );
            }
            Response::VoteMutePassed {
                connection_id,
                target_id,
            } => {
                self.send_to_connection(
                    connection_id,
                    ServerPacket::VoteMutePassed { target: target_id },
                );
            }
            Response::CommandReply {
                connection_id,
                text,
            } => {
                self.send_to_connection(connection_id, ServerPacket::CommandReply { text });
            }
        }
    }

    fn drain_responses(&mut self) {
        while let Ok(response) = self.response_rx.try_recv() {
            self.dispatch_response(response);
        }
    }

    fn broadcast_ranking(&self) {
        let entries: Vec<RankingEntry> = self
            .directory
            .snapshot_ranking(RankingMetric::Score)
            .into_iter()
            .take(RANKING_BROADCAST_SIZE)
            .filter_map(|player_id| {
                self.directory.player(player_id).map(|player| RankingEntry {
                    player_id,
                    score: player.score,
                })
            })
            .collect();

        if entries.is_empty() {
            return;
        }

        let addrs: Vec<SocketAddr> = self
            .directory
            .connections()
            .filter(|connection| connection.is_main)
            .map(|connection| connection.addr)
            .collect();

        if self
            .out_tx
            .send(OutboundMessage::Broadcast {
                packet: ServerPacket::Ranking { entries },
                addrs,
            })
            .is_err()
        {
            error!("Failed to queue ranking broadcast");
        }
    }

    /// One logical tick: flush each channel's delayed queue exactly once,
    /// apply queued admissions, credit play time and fire login timeouts.
    fn tick_once(&mut self, dt_ms: u64) {
        self.tick += 1;

        self.channels.connect_player.emit_delayed();
        while let Ok(intent) = self.intent_rx.try_recv() {
            self.spawn_player(intent);
        }

        self.channels.responses.emit_delayed();
        self.drain_responses();

        self.directory.accumulate_active_playing(dt_ms);

        let now = timestamp_ms();
        for connection_id in self.directory.expired_login_deadlines(now) {
            debug!("Login timeout for connection {}", connection_id);
            self.send_to_connection(
                connection_id,
                ServerPacket::Disconnected {
                    reason: "Login timeout".to_string(),
                },
            );
            self.close_connection(connection_id);
        }

        if self.tick % RANKING_BROADCAST_TICKS == 0 {
            self.broadcast_ranking();
        }
    }

    /// Main server loop coordinating transport, tick flushes and sweeps.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut sweep_interval = interval(Duration::from_millis(MUTE_SWEEP_INTERVAL_MS));
        // The first interval tick fires immediately.
        sweep_interval.tick().await;

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr);
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                }

                _ = tick_interval.tick() => {
                    self.tick_once(self.tick_duration.as_millis() as u64);

                    if self.tick % 600 == 0 && self.directory.connection_count() > 0 {
                        debug!(
                            "Tick {}: {} connections, {} players",
                            self.tick,
                            self.directory.connection_count(),
                            self.directory.player_count()
                        );
                    }
                }

                _ = sweep_interval.tick() => {
                    self.moderation.clear_expired(&mut self.directory);
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{LoginMessage, PROTOCOL_VERSION, SESSION_NONE};

    async fn test_server() -> Server {
        Server::new(
            "127.0.0.1:0",
            Duration::from_millis(16),
            ServerConfig::default(),
        )
        .await
        .expect("bind test server")
    }

    fn login_packet(name: &str) -> ClientPacket {
        ClientPacket::Login(LoginMessage {
            protocol: PROTOCOL_VERSION,
            name: name.to_string(),
            session: SESSION_NONE.to_string(),
            flag: "se".to_string(),
            horizon_x: 1920,
            horizon_y: 1080,
        })
    }

    fn client_addr(n: u16) -> SocketAddr {
        format!("127.0.0.1:{}", 40_000 + n).parse().unwrap()
    }

    #[test]
    fn test_login_packet_creates_player_on_tick() {
        tokio_test::block_on(async {
            let mut server = test_server().await;

            server.handle_packet(login_packet("Eve"), client_addr(1));
            assert_eq!(server.directory.connection_count(), 1);
            assert_eq!(server.directory.player_count(), 0);

            server.tick_once(16);
            assert_eq!(server.directory.player_count(), 1);
            assert!(server.directory.is_player_connected(1));
        });
    }

    #[test]
    fn test_double_login_after_admission_kicks_player() {
        tokio_test::block_on(async {
            let mut server = test_server().await;
            let addr = client_addr(1);

            server.handle_packet(login_packet("Eve"), addr);
            server.tick_once(16);
            assert_eq!(server.directory.player_count(), 1);

            // A second login packet on the settled connection must hit the
            // double-login guard and kick the bound player.
            server.handle_packet(login_packet("Eve"), addr);
            assert_eq!(server.directory.player_count(), 0);
            assert_eq!(server.directory.connection_count(), 0);
        });
    }

    #[test]
    fn test_server_full_rejects_new_addr() {
        tokio_test::block_on(async {
            let mut server = test_server().await;
            server.config.max_connections = 1;

            server.handle_packet(login_packet("A"), client_addr(1));
            server.handle_packet(login_packet("B"), client_addr(2));

            assert_eq!(server.directory.connection_count(), 1);
        });
    }

    #[test]
    fn test_disconnect_removes_player_and_connection() {
        tokio_test::block_on(async {
            let mut server = test_server().await;

            server.handle_packet(login_packet("Eve"), client_addr(1));
            server.tick_once(16);
            assert_eq!(server.directory.player_count(), 1);

            server.handle_packet(ClientPacket::Disconnect, client_addr(1));
            assert_eq!(server.directory.player_count(), 0);
            assert_eq!(server.directory.connection_count(), 0);
        });
    }

    #[test]
    fn test_spawn_applies_standing_ip_mute() {
        tokio_test::block_on(async {
            let mut server = test_server().await;
            let addr = client_addr(1);
            let mute_until = timestamp_ms() + 60_000;

            server.directory.set_ip_mute(addr.ip(), mute_until);
            server.handle_packet(login_packet("Eve"), addr);
            server.tick_once(16);

            assert_eq!(
                server.directory.player(1).unwrap().unmute_time,
                mute_until
            );
        });
    }
}
