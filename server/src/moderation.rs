//! Quorum-based vote-mute, server mutes and the IP mute table.
//!
//! Vote counting is two-phase. The fast path only compares the raw tally
//! size against the quorum, which keeps per-vote cost flat no matter how
//! large tallies grow. The accurate pass runs only once the fast path
//! triggers: it prunes voters who disconnected since voting and counts one
//! vote per unique IP, which defeats multi-account vote stuffing from a
//! single address.

use crate::directory::Directory;
use crate::events::{Channels, Response};
use log::debug;
use shared::{timestamp_ms, PlayerId};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

pub struct Moderation {
    /// Tallies keyed by mute target. Removed on successful mute or target
    /// disconnect; stale voters are pruned lazily by the accurate pass.
    votes: HashMap<PlayerId, HashSet<PlayerId>>,
    mute_duration_ms: u64,
    min_playtime_to_vote_ms: u64,
}

impl Moderation {
    pub fn new(mute_duration_ms: u64, min_playtime_to_vote_ms: u64) -> Self {
        Self {
            votes: HashMap::new(),
            mute_duration_ms,
            min_playtime_to_vote_ms,
        }
    }

    /// Unique-IP votes required to mute, from the current human count.
    fn quorum(directory: &Directory) -> usize {
        (directory.human_connection_count() as f64).sqrt().floor() as usize + 1
    }

    fn reply(
        directory: &Directory,
        channels: &mut Channels,
        player_id: PlayerId,
        text: String,
    ) {
        if let Some(connection_id) = directory.main_connection_id(player_id) {
            channels.responses.emit(&Response::CommandReply {
                connection_id,
                text,
            });
        }
    }

    /// Registers a vote by `voter_id` to mute `target_id`.
    pub fn on_vote_mute(
        &mut self,
        directory: &mut Directory,
        channels: &mut Channels,
        voter_id: PlayerId,
        target_id: PlayerId,
    ) {
        if !directory.is_player_connected(voter_id) || !directory.is_player_connected(target_id) {
            return;
        }

        let voter_playtime = match directory.player(voter_id) {
            Some(player) => player.active_playing_ms,
            None => return,
        };

        if voter_playtime < self.min_playtime_to_vote_ms {
            Self::reply(
                directory,
                channels,
                voter_id,
                "The vote isn't counted. Only active players can vote, please play more."
                    .to_string(),
            );
            debug!("Player {} hasn't played enough to vote mute", voter_id);

            return;
        }

        self.votes.entry(target_id).or_default().insert(voter_id);

        let quorum = Self::quorum(directory);
        let tally = match self.votes.get_mut(&target_id) {
            Some(tally) => tally,
            None => return,
        };

        let mut muted = false;
        let mut valid_votes = tally.len();

        // Fast check: tally size alone cannot reach quorum, skip the
        // IP-deduplication pass entirely.
        if tally.len() >= quorum {
            let mut unique_ips: HashSet<IpAddr> = HashSet::new();
            valid_votes = 0;

            // Accurate check over a stable snapshot: purge voters who left,
            // count one vote per unique IP among those still here.
            for voted_id in tally.iter().copied().collect::<Vec<_>>() {
                match directory.player(voted_id) {
                    Some(player) if directory.is_player_connected(voted_id) => {
                        if unique_ips.insert(player.ip) {
                            valid_votes += 1;
                        }
                    }
                    _ => {
                        tally.remove(&voted_id);
                    }
                }
            }

            if valid_votes >= quorum {
                muted = true;
                debug!("Player {} muted by players", target_id);

                let unmute_time = timestamp_ms() + self.mute_duration_ms;
                let target_ip = {
                    let target = match directory.player_mut(target_id) {
                        Some(target) => target,
                        None => return,
                    };
                    target.unmute_time = unmute_time;
                    target.ip
                };
                directory.set_ip_mute(target_ip, unmute_time);

                for voted_id in self.votes.remove(&target_id).unwrap_or_default() {
                    if let Some(connection_id) = directory.main_connection_id(voted_id) {
                        channels.responses.emit(&Response::VoteMutePassed {
                            connection_id,
                            target_id,
                        });
                    }
                }
            }
        }

        if !muted {
            let target_name = directory
                .player(target_id)
                .map(|player| player.name.clone())
                .unwrap_or_default();

            Self::reply(
                directory,
                channels,
                voter_id,
                format!("Voted to mute {} ({}/{}).", target_name, valid_votes, quorum),
            );
        }
    }

    /// Administrative mute, no quorum involved.
    pub fn mute_player_by_server(&self, directory: &mut Directory, player_id: PlayerId) {
        if !directory.is_player_connected(player_id) {
            return;
        }

        let ip = match directory.player(player_id) {
            Some(player) => player.ip,
            None => return,
        };

        self.mute_by_ip(directory, ip, self.mute_duration_ms);
        debug!("Player {} muted by server", player_id);
    }

    /// Mutes `ip` and pushes the expiry onto every currently-connected
    /// player behind it, so a reconnect under the same IP observes the mute
    /// without consulting the table at chat time.
    pub fn mute_by_ip(&self, directory: &mut Directory, ip: IpAddr, duration_ms: u64) {
        let unmute_time = timestamp_ms() + duration_ms;

        directory.set_ip_mute(ip, unmute_time);
        Self::update_players_mute_expiry(directory, ip, unmute_time);
    }

    /// Unmutes `ip` and propagates an already-expired timestamp the same
    /// way.
    pub fn unmute_by_ip(&self, directory: &mut Directory, ip: IpAddr) {
        let expired = timestamp_ms() - 1;

        directory.remove_ip_mute(ip);
        Self::update_players_mute_expiry(directory, ip, expired);
    }

    /// Drops every expired entry from the mute table. Runs on a coarse
    /// clock; iterates a snapshot so entry removal underneath is safe.
    pub fn clear_expired(&self, directory: &mut Directory) {
        let now = timestamp_ms();

        for (ip, unmute_time) in directory.ip_mutes_snapshot() {
            if now > unmute_time {
                self.unmute_by_ip(directory, ip);
            }
        }
    }

    /// Drops the tally targeting a departed player. Votes that player cast
    /// elsewhere stay until the next accurate pass prunes them.
    pub fn on_player_removed(&mut self, player_id: PlayerId) {
        self.votes.remove(&player_id);
    }

    fn update_players_mute_expiry(directory: &mut Directory, ip: IpAddr, unmute_time: u64) {
        for connection_id in directory.connections_from_ip(ip) {
            let player_id = match directory.connection(connection_id) {
                Some(connection) => connection.player_id,
                None => continue,
            };

            if let Some(player_id) = player_id {
                if let Some(player) = directory.player_mut(player_id) {
                    player.unmute_time = unmute_time;
                }
            }
        }
    }

    #[cfg(test)]
    fn tally(&self, target_id: PlayerId) -> Option<&HashSet<PlayerId>> {
        self.votes.get(&target_id)
    }
}
