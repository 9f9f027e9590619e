//! Matchmaking and signaling server for randomized peer-to-peer video chat.
//!
//! Instances are stateless: the waiting queue, pair map and abuse state live
//! in a shared store, and a pub/sub bus carries events to whichever instance
//! owns the target connection. Media never transits the server — only
//! matchmaking decisions and opaque negotiation blobs do.

pub mod abuse;
pub mod config;
pub mod connection;
pub mod connid;
pub mod events;
pub mod matchmaker;
pub mod pairs;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod server;
pub mod store;
pub mod web;
