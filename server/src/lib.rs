//! # Game Server Library
//!
//! This library provides a small multiplayer game backend that is reachable
//! over TCP and UDP at the same time. Clients on either transport exchange the
//! same JSON envelopes, and the game rules never need to know
//! which transport a session arrived on.
//!
//! ## Core Responsibilities
//!
//! ### Framing and Session Identity
//! - TCP byte streams are cut into newline-delimited envelopes, however the
//!   bytes happen to be split across reads
//! - UDP peers get an implicit session keyed by their source address
//! - Every session receives a process-unique id, announced in a `welcome`
//!
//! ### Single Authoritative Loop
//! All game logic runs on one dispatcher task at a fixed tick rate. Network
//! tasks only ever push into a shared mailbox; the dispatcher swaps the whole
//! batch out each cycle, so game state needs no locking of its own.
//!
//! ### Routing
//! Game logic answers with response descriptors: unicast to one session, or
//! broadcast to everyone with an optional exclusion. The router finds the
//! transport that owns each id and queues the envelope there.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! Session records, the process-wide id counter and the capacity-limited
//! registry each transport owns.
//!
//! ### Transport Modules (`stream`, `datagram`)
//! - `stream`: TCP accept loop, per-connection reader and writer tasks
//! - `datagram`: one shared UDP socket, a sender task and a liveness sweep
//!
//! ### Mailbox Module (`mailbox`)
//! The inbound queue between network tasks and the dispatcher.
//!
//! ### Dispatch Module (`dispatch`)
//! The [`dispatch::GameLogic`] contract, response routing and the paced tick
//! loop.
//!
//! ### Server Module (`server`)
//! Start-up, the ordered shutdown sequence and the control surface used by
//! the binary and the tests.
//!
//! ### Game Module (`game`)
//! A reference world: logins, characters, movement, chat and periodic
//! snapshots.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::game::World;
//! use server::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(ServerConfig::default(), World::new());
//!     server.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!
//!     // Tells every client, drains the dispatcher and flushes the world.
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! The server runs these tasks while started:
//! - **Accept loop** and per-connection **reader**/**writer** tasks for TCP
//! - **Receive loop** and **sender** for UDP
//! - One **liveness sweep** per transport
//! - The **dispatcher**, pacing itself to the configured tick rate

pub mod config;
pub mod datagram;
pub mod dispatch;
pub mod error;
pub mod game;
pub mod mailbox;
pub mod server;
pub mod session;
pub mod stream;

pub use config::ServerConfig;
pub use error::{LogicError, ServerError};
pub use server::Server;
