//! # Peer Session Client Library
//!
//! This library provides the client side of a peer-hosted game session. There
//! is no game server: one client is elected host by the signaling service and
//! runs the authoritative simulation, while every other client receives state
//! over a direct peer link.
//!
//! ## Architecture Overview
//!
//! ### Host Authority
//! Exactly one client simulates at a time. It steps the ships, broadcasts
//! full-state ticks to every open link and sends an occasional checkpoint to
//! the signaling service so a successor can resume from recent state.
//!
//! ### Viewers and Players
//! Non-host clients merge ticks into a local entity map keyed by entity id.
//! Players additionally send `input.update` to the host whenever their input
//! changes, and a `player.config` naming and colouring their ship. The host
//! attributes both to the link they arrived on.
//!
//! ### Host Migration
//! When the host leaves, the service elects the oldest remaining viewer. The
//! new host seeds its simulation from the last state it observed (or the
//! service's checkpoint), opens fresh links to everyone and carries on.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! The [`session::Session`] object owning all client state, and the event loop
//! that drives it.
//!
//! ### Peer Manager Module (`peer_manager`)
//! Offer/answer/candidate state machine per remote peer, with candidate
//! buffering and best-effort sends.
//!
//! ### Transport Module (`transport`)
//! The [`transport::LinkTransport`] seam and its WebRTC data channel
//! implementation.
//!
//! ### Event Bus Module (`event_bus`)
//! Named-event dispatch with isolated, ordered handlers.
//!
//! ### Replication Module (`replication`)
//! Tick de-duplication on the host, tick merging on viewers, and the host's
//! input queue.
//!
//! ### Game Module (`game`)
//! The host's ship simulation.
//!
//! ### Input Module (`input`)
//! Local input and player config change detection.
//!
//! ### Signaling Module (`signaling`)
//! WebSocket connection to the signaling service.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::event_bus::Event;
//! use client::session::{Session, SessionConfig};
//! use shared::Role;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ice = ["stun:stun.l.google.com:19302"];
//!     let config = SessionConfig::new("ws://127.0.0.1:8080", Role::Viewer, 30, &ice)?;
//!     let (session, inputs) = Session::connect(&config).await?;
//!
//!     session.bus().on(Event::HOST_STARTED, |_, _| {
//!         println!("now hosting");
//!         Ok(())
//!     });
//!
//!     session.run(inputs, config.tick_interval()).await;
//!     Ok(())
//! }
//! ```

pub mod event_bus;
pub mod game;
pub mod input;
pub mod peer_manager;
pub mod replication;
pub mod session;
pub mod signaling;
pub mod transport;
