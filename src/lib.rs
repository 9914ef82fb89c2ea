//! # Sensorino - Smart-home gateway for low-power radio networks
//!
//! Sensorino sits between radio "Bases" and the rest of a home automation setup.
//! Bases forward JSON messages from battery-powered sensor and actuator nodes; the
//! gateway validates them, keeps a tree of every node's services and channel values,
//! records the full history of that tree and sends commands back to the nodes.
//!
//! ## Features
//!
//! - **Protocol validation**: structural and state-aware checks for every message in both directions.
//! - **State tracking**: one pending transaction per node, speculative `set`s rolled back on error replies.
//! - **History**: every change persisted in sled; the tree can be rebuilt as of any past instant.
//! - **Discovery**: unknown nodes and services are probed gently with jittered requests.
//! - **Console log**: the raw Base traffic, kept in memory and on disk.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sensorino::config::Config;
//! use sensorino::gateway::Gateway;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("sensorino.toml").await?;
//!     let listener = TcpListener::bind(&config.server.base_listen).await?;
//!
//!     let mut gateway = Gateway::open(config)?;
//!     gateway.load()?;
//!     gateway.run(listener).await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`gateway`] - the owning context and event loop
//! - [`base`] - TCP endpoint Bases connect to
//! - [`protocol`] - messages, datatypes, framing and validation
//! - [`state`] - state tree, change-sets and the transaction tracker
//! - [`storage`] - sled-backed history of values, console lines and floorplans
//! - [`discovery`] - discovery of unknown nodes and services
//! - [`console`] - raw traffic log
//! - [`config`] - configuration file handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Base server    │ ← one task per connected Base
//! └─────────────────┘
//!          │ BaseEvent
//! ┌─────────────────┐
//! │    Gateway      │ ← validation, console, discovery, timers
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  State tracker  │ ← tree + pending transactions
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │     Store       │ ← history
//! └─────────────────┘
//! ```

pub mod base;
pub mod config;
pub mod console;
pub mod discovery;
pub mod errors;
pub mod gateway;
pub mod logutil;
pub mod metrics;
pub mod protocol;
pub mod state;
pub mod storage;
pub mod timers;
