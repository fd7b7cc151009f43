//! # Session Relay Client Library
//!
//! This library is the participant side of the shared VR session. It owns the
//! connection to the relay server and keeps a plain-data view of everyone else
//! in the session for a rendering or audio engine to consume.
//!
//! ## Module Organization
//!
//! ### State Module (`state`)
//! The participant view built from server packets:
//! - Own session id once assigned
//! - Remote participants with head and hand poses
//! - Bounded queues of received voice frames
//! - Shared scene objects and their current owners
//!
//! ### Network Module (`network`)
//! Manages all client-server communication:
//! - UDP socket and session assignment with retries
//! - Heartbeat replies so the server keeps the session alive
//! - Sending poses, voice, echo text and object updates
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//! use shared::{Pose, SceneObject};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new("127.0.0.1:8080").await?;
//!     client.connect(Duration::from_secs(5)).await?;
//!
//!     client.send_head_pose(Pose::default()).await?;
//!     client.claim_object(&SceneObject::new("chair1")).await?;
//!
//!     // Apply whatever the others sent and answer heartbeats
//!     client.poll(Duration::from_millis(50)).await?;
//!     println!("{}", client.view().to_json()?);
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod state;
