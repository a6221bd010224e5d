#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # Tessera: object lifecycle and buffer memory for a display-protocol server
//!
//! This crate implements the core of a Wayland-style display server: clients connect, bind
//! capabilities, hand over shared memory from which pixel buffers are carved, create drawable
//! surfaces, attach buffers to them and commit, and optionally give a surface the window role.
//!
//! ## Structure of the crate
//!
//! - [`server`] holds the process-wide [`ServerState`](server::ServerState): the arena of client
//!   connections, the capability registry and the outbound event queues.
//! - [`shm`] manages shared-memory pools and the buffers validated inside them.
//! - [`compositor`] implements the double-buffered surface commit state machine and surface roles.
//! - [`shell`] assigns the window role and drives the configure/acknowledge handshake.
//! - [`export`] hands immutable snapshots of committed buffers to collaborators running on other
//!   threads, and encodes them into network frames.
//! - [`wayland`] binds all of the above onto [`wayland_server`] so real clients can talk to it.
//!
//! ## General principles
//!
//! All core state is owned by a single [`ServerState`](server::ServerState) and only ever mutated from
//! the dispatch thread. Objects are addressed through small copyable handles scoped to the connection
//! that created them; a handle to a destroyed object simply stops resolving, so destruction can
//! cascade at any point between two requests without leaving dangling references behind.
//!
//! Notifications for clients (advertised formats, buffer releases, configure events, frame
//! callbacks) are queued per connection as [`Event`](server::Event)s. The protocol frontend drains
//! and delivers them after each request.
//!
//! ### Logging
//!
//! Tessera makes extensive use of [`tracing`] for its internal logging. Per-request flow is logged at
//! `trace` level, object lifecycle at `debug` and client misbehaviour at `warn`.

pub mod compositor;
pub mod export;
pub mod server;
pub mod shell;
pub mod shm;
pub mod utils;
#[cfg(feature = "wayland_frontend")]
pub mod wayland;

pub mod reexports;
