//! # Game Server Library
//!
//! This library provides the session-and-moderation core of the multiplayer
//! game server: it admits raw connections into authenticated player
//! sessions, routes domain events through publish/subscribe channels with
//! deferred delivery, and enforces community moderation on top of
//! server-initiated and IP-scoped mutes.
//!
//! ## Core Responsibilities
//!
//! ### Admission
//! Every login request is validated, its display name normalized and its
//! flag resolved before a player-creation intent is queued for the next
//! tick. Duplicate logins, protocol mismatches and malformed session
//! payloads are answered with reply events, never hard faults.
//!
//! ### Event Routing
//! Producers and consumers are decoupled by named channels. `emit` delivers
//! synchronously in registration order; `delay` defers delivery to the next
//! tick flush. A faulting listener is logged and isolated so its siblings
//! and the pending queue are unaffected.
//!
//! ### Moderation
//! Players vote to mute an abusive peer. The quorum is derived from the
//! current human connection count and counted per unique IP, which resists
//! both drive-by votes from fresh connections and multi-account stuffing
//! from a single address. Server mutes and the IP mute table back this up,
//! with a coarse periodic sweep dropping expired entries.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Tick Loop
//! All handlers run to completion on one logical thread per tick.
//! Concurrency means interleaving across ticks, not parallel execution, so
//! every handler must leave the shared [`directory::Directory`], the vote
//! tallies and the mute table self-consistent when it returns. Components
//! never keep references to directory entries across ticks; they re-resolve
//! by id to observe disconnects that happened in between.
//!
//! ### Explicit Shared State
//! The [`directory::Directory`] is owned by the server runtime and passed by
//! mutable reference into each entry point. There are no globals and no
//! locks on the hot path.
//!
//! ## Module Organization
//!
//! - [`config`] — runtime options for admission and moderation.
//! - [`directory`] — connection/player indices, IP mute table, rankings.
//! - [`channel`] — the publish/subscribe primitive with deferred delivery.
//! - [`events`] — typed domain events and the channel bundle.
//! - [`login`] — the admission controller and its collaborator traits.
//! - [`moderation`] — vote-mute, server mutes, expiry sweeps.
//! - [`network`] — UDP transport adapter and the tick loop.

pub mod channel;
pub mod config;
pub mod directory;
pub mod events;
pub mod login;
pub mod moderation;
pub mod network;
