// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Events flowing in and out of the router: commands it sends back to per-peer transports, the
//! broadcast notifications other subsystems subscribe to, and the wrapper peer messages arrive
//! in.

use crate::msgs::{ChannelAnnouncement, ChannelUpdate, NodeAnnouncement, NodeId, RoutingMessage};

use tokio::sync::mpsc;

use std::collections::{HashMap, HashSet};

/// Commands the router issues on a peer's transport handle. All sends are fire-and-forget; a
/// transport whose peer went away simply drops them.
#[derive(Clone, Debug)]
pub enum PeerCommand {
	/// Acknowledges that the wrapped inbound message has been taken off the wire, releasing the
	/// transport's read window. Sent before the message is processed.
	ReadAck(RoutingMessage),
	/// A routing message to deliver to the peer.
	Send(RoutingMessage),
	/// Tells the transport the wrapped message carried an invalid signature so it can penalize
	/// or disconnect the peer.
	InvalidSignature(RoutingMessage),
}

/// The sending side of a per-peer transport, handed to the router with each inbound message and
/// with sync commands.
pub type TransportHandle = mpsc::UnboundedSender<PeerCommand>;

/// A routing message relayed by a peer connection, along with the transport to respond through.
#[derive(Clone, Debug)]
pub struct PeerRoutingMessage {
	/// Handle for read-acks and replies
	pub transport: TransportHandle,
	/// The peer's node id
	pub remote_node_id: NodeId,
	/// The message itself
	pub message: RoutingMessage,
}

/// Where a piece of gossip entered this node, used to avoid echoing gossip back to its origin
/// and to tell locally generated records from peer ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GossipOrigin {
	/// Generated by a local subsystem
	Local,
	/// Relayed by the given peer
	Remote(NodeId),
}

/// Gossip accumulated for rebroadcast, each entry tagged with the origins it was received from.
/// The light client never flushes this itself but [`filter_gossip`] is used to answer a peer's
/// timestamp filter from it.
///
/// [`filter_gossip`]: crate::router::filter_gossip
#[derive(Clone, Debug, Default)]
pub struct Rebroadcast {
	/// Pending channel announcements
	pub channels: HashMap<ChannelAnnouncement, HashSet<GossipOrigin>>,
	/// Pending channel updates
	pub updates: HashMap<ChannelUpdate, HashSet<GossipOrigin>>,
	/// Pending node announcements
	pub nodes: HashMap<NodeAnnouncement, HashSet<GossipOrigin>>,
}

/// Events published on the router's broadcast bus. Subscribers get every event; a lagging or
/// absent subscriber never blocks the router.
#[derive(Clone, Debug)]
pub enum NetworkEvent {
	/// A channel was pruned or its funding output was spent
	ChannelLost {
		/// The channel's short id
		short_channel_id: u64,
	},
	/// A node lost its last channel and was dropped
	NodeLost {
		/// The node's id
		node_id: NodeId,
	},
	/// A first announcement was accepted for a node we knew only from channels
	NodeDiscovered(NodeAnnouncement),
	/// A fresher announcement replaced what we knew about a node
	NodeUpdated(NodeAnnouncement),
	/// A channel update was validated and applied
	ChannelUpdateReceived(ChannelUpdate),
	/// The aggregate progress of ongoing channel-table syncs moved
	SyncProgress {
		/// 1.0 when no peer has an outstanding sync
		progress: f64,
	},
}
