//! # Meshbadge - Meshtastic text client for a wearable badge
//!
//! Meshbadge runs on a small Linux board worn as a badge. It holds a link to a
//! Meshtastic node (an rfcomm serial binding or the node's TCP API), keeps every
//! text message it sees in a local store, and shows them as a scrollable feed
//! on a small terminal.
//!
//! ## Features
//!
//! - **Supervised Link**: Reconnects with capped exponential backoff, probes a live link, and gives up after a configurable number of attempts until the operator asks again.
//! - **Durable History**: Every message is stored once (sled) and mirrored to a human-readable JSON-lines journal.
//! - **Duplicate Suppression**: Stable message ids from vendor packet ids or content hashes, checked in memory and enforced by the store.
//! - **Outbound Text**: Operator messages are recorded before they are sent and corrected in place if the radio refuses them.
//! - **Scrollable Feed**: Bounded scrolling with a sticky bottom, independent of the renderer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshbadge::badge::{input, terminal::TerminalRenderer, Badge};
//! use meshbadge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut renderer =
//!         TerminalRenderer::new(std::io::stdout(), config.feed.width, config.feed.viewport_height);
//!     let badge = Badge::open(config)?;
//!     badge.run_configured(input::spawn_stdin_reader(), &mut renderer).await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`transport`] - Node links: stream framing, serial, TCP and an in-memory test radio
//! - [`supervisor`] - Link lifecycle, backoff and health probing
//! - [`queue`] - Bounded handoff between the link and the ingest task
//! - [`normalizer`] - Raw events to canonical messages, ids and dedup
//! - [`pipeline`] - The ingest task
//! - [`storage`] - Message store and journal
//! - [`outbound`] - Operator submissions and retries
//! - [`feed`] - Scroll model
//! - [`badge`] - Foreground loop, operator input and terminal rendering
//! - [`config`] - Configuration management and validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Badge (UI)    │ ← feed, input, renderer
//! └─────────────────┘
//!     ▲         │ submit
//!     │ updates ▼
//! ┌─────────────────┐      ┌─────────────────┐
//! │ Ingest/Outbound │ ───▶ │  Message Store  │ ← sled + journal
//! └─────────────────┘      └─────────────────┘
//!     ▲         │
//!     │ queue   ▼ commands
//! ┌─────────────────┐
//! │   Supervisor    │ ← owns the link
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Transport     │ ← serial / TCP
//! └─────────────────┘
//! ```

pub mod badge;
pub mod config;
pub mod error;
pub mod feed;
pub mod logutil;
pub mod message;
pub mod metrics;
pub mod normalizer;
pub mod outbound;
pub mod pipeline;
pub mod protobuf;
pub mod queue;
pub mod storage;
pub mod supervisor;
pub mod transport;
pub mod validation;
