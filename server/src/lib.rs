//! # Signaling Service Library
//!
//! This library provides the always-on rendezvous service for peer-hosted game
//! sessions. It never runs game logic: it tracks who is connected, decides which
//! client holds host authority, and relays connection-negotiation messages
//! between clients so they can open direct peer links.
//!
//! ## Core Responsibilities
//!
//! ### Membership
//! Every WebSocket connection becomes one peer with an opaque id and a role
//! (`player` or `viewer`). Joins and departures are broadcast to all peers.
//!
//! ### Host Election
//! At most one peer holds host authority at any time. When the session has no
//! host, the oldest connected viewer is elected; when the host leaves, the next
//! oldest viewer takes over. Election happens only inside the main loop, so two
//! hosts can never be assigned concurrently.
//!
//! ### Negotiation Relay
//! Offers, answers and address candidates are routed by their `to` field with
//! the sender id stamped by the server. Payloads are never inspected.
//!
//! ## Architecture Design
//!
//! ### Single Main Loop
//! Connection tasks read frames and forward them as [`network::ServerMessage`]
//! values over a channel. One loop owns the [`registry::SessionRegistry`] and
//! every outbound queue, which serializes all membership changes.
//!
//! ### Memory-Only State
//! Nothing is persisted. A restart drops all peers; clients reconnect and
//! re-negotiate.
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! Bind address, allowed origins and capacity validation.
//!
//! ### Network Module (`network`)
//! TCP accept loop, WebSocket handshake (origin and role checks), and the main
//! routing loop.
//!
//! ### Registry Module (`registry`)
//! Membership, join ordering, host election, relay routing, snapshot
//! checkpoints and link-failure re-announcement.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::SignalingServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::new("127.0.0.1", 8080, &["http://localhost:3000"], 32)?;
//!     let server = SignalingServer::bind(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod network;
pub mod registry;
