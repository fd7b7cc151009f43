//! # Session Relay Server Library
//!
//! This library provides the relay server that keeps a shared VR scene in sync
//! across participants. It holds no simulation of its own: it assigns session
//! ids, relays pose and voice packets between participants, arbitrates who may
//! move each shared scene object, and notices participants that go silent.
//!
//! ## Core Responsibilities
//!
//! ### Session Lifecycle
//! Every participant is identified by a non-zero session id handed out on
//! request. Ids are never reused within a server run. A session ends on an
//! explicit disconnect or after a run of unanswered heartbeats, and ending it
//! releases everything it held exactly once.
//!
//! ### Relaying
//! Head and hand poses, voice buffers and echo text are relayed unchanged to
//! every other live session. The sender never receives its own packet back.
//!
//! ### Scene Object Ownership
//! The first participant to claim a shared object owns it until it releases
//! the object or its session ends. Updates from anyone else are refused and
//! answered with the authoritative state.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! Live sessions, id assignment and address lookup.
//!
//! ### Heartbeat Module (`heartbeat`)
//! Per-session miss counters advanced once per probe interval.
//!
//! ### Ownership Module (`ownership`)
//! Shared scene objects and the single-owner rule.
//!
//! ### Router Module (`router`)
//! Per-session bounded outbound queues and fan-out over them.
//!
//! ### Relay Module (`relay`)
//! Decodes inbound datagrams and drives the modules above.
//!
//! ### Network Module (`network`)
//! Socket receive task and the main loop with heartbeat timing.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = ServerConfig::default().with_bind_addr("0.0.0.0:8080");
//!     let mut server = Server::bind(&config).await?;
//!
//!     // Runs until a shutdown handle fires:
//!     // - Receives datagrams and dispatches them to the relay
//!     // - Probes every session once per heartbeat interval
//!     // - Ends sessions that miss too many heartbeats
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod heartbeat;
pub mod network;
pub mod ownership;
pub mod registry;
pub mod relay;
pub mod router;
pub mod transport;
