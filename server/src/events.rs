//! Domain events exchanged between the core and its collaborators.

use crate::channel::Channel;
use shared::{ConnectionId, PlayerId};

/// Normalized player-creation intent produced by a successful admission.
///
/// Delivered on the connect-player channel at the next tick flush; the
/// player-spawn collaborator reacts to it, the controller itself never
/// touches player state.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerConnect {
    pub connection_id: ConnectionId,
    pub name: String,
    pub flag: String,
    pub horizon_x: u16,
    pub horizon_y: u16,
    /// Empty string for anonymous players.
    pub user_id: String,
}

/// Replies and control signals addressed to specific connections or players.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Terminate the session of an already-authenticated player.
    KickPlayer { player_id: PlayerId },
    IncorrectProtocol { connection_id: ConnectionId },
    InvalidLoginData { connection_id: ConnectionId },
    VoteMutePassed {
        connection_id: ConnectionId,
        target_id: PlayerId,
    },
    CommandReply {
        connection_id: ConnectionId,
        text: String,
    },
}

/// The channels owned by the server runtime. Queues are independent; each
/// channel is flushed once per tick.
pub struct Channels {
    pub connect_player: Channel<PlayerConnect>,
    pub responses: Channel<Response>,
}

impl Channels {
    pub fn new() -> Self {
        Self {
            connect_player: Channel::new("connect_player"),
            responses: Channel::new("responses"),
        }
    }
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}
