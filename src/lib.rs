// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A gossip router for light Lightning Network clients, in library form.
//!
//! The router ingests channel and node gossip from peers, maintains a pruned local view of the
//! public channel graph (plus our own not-yet-announced channels), keeps it converged with the
//! network through the windowed gossip-queries sync dialogue, and computes payment routes over
//! it with per-direction exclusions and invoice routing hints.
//!
//! It is the light/mobile take on channel gossip: announcements are admitted on their
//! signatures alone rather than checked against the chain, everything not needed for routing is
//! stripped before storage, and remote gossip queries are acknowledged but not served. Hosts
//! provide the missing pieces through small interfaces: a [`storage::NetworkDb`] for
//! persistence, per-peer transport handles for replies, a [`util::logger::Logger`] for log
//! output, and chain-watcher events for funding spends and the tip height.
//!
//! [`router::Router`] is the runtime-agnostic core; [`actor::start`] runs it the standard way,
//! as a Tokio task fed through a [`actor::RouterHandle`].

#![deny(missing_docs)]
#![forbid(unsafe_code)]

#[macro_use]
pub mod util;
pub mod msgs;
pub mod graph;
pub mod events;
pub mod storage;
pub mod sync;
pub mod router;
pub mod actor;
