// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The persistence interface the router writes its view of the network through. Writes happen
//! inline from the router's event handlers (which are serialized by construction) so
//! implementations don't need their own locking for correctness, only for shared access from
//! other readers.
//!
//! A write failure never takes the router down: the in-memory state has already been updated and
//! staying alive with a slightly diverged disk view beats dying over one. Failures are logged by
//! the caller.

use crate::graph::{ChannelDesc, ChannelInfo, ChannelUpdateInfo};
use crate::msgs::{NodeAnnouncement, NodeId};

use std::io;

/// The network database: persisted channels, channel updates and node announcements, so a
/// restart doesn't have to resync the whole graph from peers.
pub trait NetworkDb {
	/// Lists every persisted channel.
	fn list_channels(&self) -> Result<Vec<ChannelInfo>, io::Error>;
	/// Lists every persisted channel update together with the direction it applies to.
	fn list_channel_updates(&self) -> Result<Vec<(ChannelDesc, ChannelUpdateInfo)>, io::Error>;
	/// Persists a newly validated channel.
	fn add_channel(&self, channel: &ChannelInfo) -> Result<(), io::Error>;
	/// Removes a channel and, cascading, any updates stored for either of its directions.
	fn remove_channel(&self, short_channel_id: u64) -> Result<(), io::Error>;
	/// Persists the first update seen for a channel direction.
	fn add_channel_update(&self, desc: &ChannelDesc, update: &ChannelUpdateInfo) -> Result<(), io::Error>;
	/// Replaces the persisted update for a channel direction with a fresher one.
	fn update_channel_update(&self, desc: &ChannelDesc, update: &ChannelUpdateInfo) -> Result<(), io::Error>;
	/// Persists a newly discovered node announcement.
	fn add_node(&self, node: &NodeAnnouncement) -> Result<(), io::Error>;
	/// Replaces the persisted announcement for a node with a fresher one.
	fn update_node(&self, node: &NodeAnnouncement) -> Result<(), io::Error>;
	/// Removes a node announcement. Must tolerate the node being absent.
	fn remove_node(&self, node_id: &NodeId) -> Result<(), io::Error>;
}
