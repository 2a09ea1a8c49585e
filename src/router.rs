// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The gossip router: owns the channel tables and the graph, ingests announcements and updates
//! from peers, prunes what the network has forgotten, drives the per-peer sync dialogue and
//! answers route requests.
//!
//! All state lives behind a single [`Router`] which processes one [`RouterEvent`] at a time, so
//! no handler ever observes half-applied state and no locking exists anywhere in this module.
//! Everything leaving the router (transport commands, bus events, database writes) is
//! fire-and-forget; a failed database write is logged and the router keeps going with its
//! in-memory view.

use bitcoin::blockdata::constants::genesis_block;
use bitcoin::hash_types::BlockHash;
use bitcoin::network::constants::Network;
use bitcoin::secp256k1::{self, Secp256k1};

use rand::Rng;

use tokio::sync::{broadcast, oneshot};

use crate::events::{GossipOrigin, NetworkEvent, PeerCommand, PeerRoutingMessage, Rebroadcast, TransportHandle};
use crate::graph::{ChannelDesc, ChannelInfo, ChannelUpdateInfo, NetworkGraph};
use crate::msgs::{
	ChannelAnnouncement, ChannelUpdate, ErrorAction, GossipTimestampFilter, LightningError,
	NodeAnnouncement, NodeId, QueryChannelRange, ReplyChannelRange, ReplyShortChannelIdsEnd,
	RoutingFees, RoutingMessage, QUERY_FLAG_CHECKSUMS, QUERY_FLAG_TIMESTAMPS,
};
use crate::storage::NetworkDb;
use crate::sync::{build_queries, shortids_to_request, sync_progress, update_checksum, ChannelQueryMode, Syncing};
use crate::util::config::RouterConfig;
use crate::util::logger::{Level, Logger};
use crate::util::scid_utils::{block_from_scid, scid_from_parts, MAX_SCID_BLOCK};

use std::cmp;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io;
use std::ops::Deref;
use std::time::{SystemTime, UNIX_EPOCH};

/// We consider a channel_update stale two weeks after its timestamp and no longer apply or keep
/// it, per BOLT 7's pruning suggestion.
pub(crate) const STALE_CHANNEL_UPDATE_AGE_SECS: u64 = 60 * 60 * 24 * 14;

/// An update within four days of going stale is "almost stale": worth refetching during a
/// checksum sync even when its content hasn't changed, so it doesn't age out underneath us.
pub(crate) const ALMOST_STALE_CHANNEL_UPDATE_AGE_SECS: u64 = 60 * 60 * 24 * 10;

/// A channel only counts as stale once its funding block is more than this far below the tip.
/// Below that it may simply not have had a chance to receive updates yet.
pub(crate) const CHANNEL_STALE_AGE_BLOCKS: u32 = 2016;

/// At most this many channels are evicted per prune cycle, bounding the pause a cycle causes.
pub(crate) const MAX_PRUNE_COUNT: usize = 1000;

/// How many candidate paths a route request considers when the caller doesn't say.
pub const DEFAULT_ROUTES_COUNT: usize = 3;

/// Candidate paths within this relative margin of the cheapest are all eligible, and the route
/// returned is picked among them at random.
pub const DEFAULT_ALLOWED_SPREAD: f64 = 0.1;

/// Whether an update timestamp is past the stale horizon. A timestamp exactly at the horizon is
/// not stale yet.
pub(crate) fn is_stale_timestamp(timestamp: u32, now: u64) -> bool {
	(timestamp as u64) < now.saturating_sub(STALE_CHANNEL_UPDATE_AGE_SECS)
}

/// Whether an update timestamp is within four days of the stale horizon.
pub(crate) fn is_almost_stale_timestamp(timestamp: u32, now: u64) -> bool {
	(timestamp as u64) < now.saturating_sub(ALMOST_STALE_CHANNEL_UPDATE_AGE_SECS)
}

/// An extra hop supplied alongside a route request, usually lifted from an invoice's routing
/// hints. Describes one channel towards the payment target that isn't (or isn't yet) in public
/// gossip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtraHop {
	/// The node the hinted channel starts from
	pub node_id: NodeId,
	/// The hinted channel's short id
	pub short_channel_id: u64,
	/// The fees the hinted channel charges
	pub fees: RoutingFees,
	/// The CLTV delta the hinted channel requires
	pub cltv_expiry_delta: u16,
}

/// A request for a payment route.
#[derive(Clone, Debug)]
pub struct RouteRequest {
	/// The node the payment starts from, normally us
	pub source: NodeId,
	/// The payment target
	pub target: NodeId,
	/// The amount carried, which fees are computed against
	pub amount_msat: u64,
	/// How many candidate paths to consider before the randomized pick
	pub num_routes: usize,
	/// Assisted routes from the invoice, each a chain of hops ending at the target
	pub assisted_routes: Vec<Vec<ExtraHop>>,
	/// Nodes to avoid entirely for this request
	pub ignore_nodes: HashSet<NodeId>,
	/// Channel directions to avoid for this request, on top of the router's own exclusions
	pub ignore_channels: HashSet<ChannelDesc>,
}

impl RouteRequest {
	/// A request with the default candidate count and nothing ignored.
	pub fn new(source: NodeId, target: NodeId, amount_msat: u64) -> Self {
		RouteRequest {
			source,
			target,
			amount_msat,
			num_routes: DEFAULT_ROUTES_COUNT,
			assisted_routes: Vec::new(),
			ignore_nodes: HashSet::new(),
			ignore_channels: HashSet::new(),
		}
	}
}

/// One edge traversal in a computed route.
#[derive(Clone, Debug, PartialEq)]
pub struct Hop {
	/// The node forwarding the payment over this hop
	pub node_id: NodeId,
	/// The node receiving it
	pub next_node_id: NodeId,
	/// The update whose fees and CLTV apply to this traversal
	pub last_update: ChannelUpdateInfo,
}

/// A computed route, echoing the exclusions that were in force so retries can extend them.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteResponse {
	/// The hops to traverse, source first
	pub hops: Vec<Hop>,
	/// The nodes the request asked to avoid
	pub ignore_nodes: HashSet<NodeId>,
	/// The channel directions the request asked to avoid
	pub ignore_channels: HashSet<ChannelDesc>,
}

/// Failures the router reports to requesters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouterError {
	/// Source and target of a route request are the same node
	CannotRouteToSelf,
	/// No path to the target survived the constraints
	RouteNotFound,
	/// The request named a channel the router doesn't know
	NonexistingChannel(u64),
	/// The request named a channel that has been closed
	ChannelClosed(u64),
}

impl fmt::Display for RouterError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			RouterError::CannotRouteToSelf => f.write_str("cannot route to self"),
			RouterError::RouteNotFound => f.write_str("route not found"),
			RouterError::NonexistingChannel(scid) => write!(f, "unknown channel {}", scid),
			RouterError::ChannelClosed(scid) => write!(f, "channel {} is closed", scid),
		}
	}
}

impl std::error::Error for RouterError {}

/// Gossip received while the announcement it depends on is still being verified, keyed by the
/// message itself with the set of origins that delivered it.
#[derive(Default)]
pub(crate) struct Stash {
	pub(crate) updates: HashMap<ChannelUpdate, HashSet<GossipOrigin>>,
	pub(crate) nodes: HashMap<NodeAnnouncement, HashSet<GossipOrigin>>,
}

/// A copy of the router's tables, as returned by [`RouterEvent::GetData`].
#[derive(Clone, Debug)]
pub struct DataSnapshot {
	/// Known node announcements
	pub nodes: BTreeMap<NodeId, NodeAnnouncement>,
	/// The public channel table
	pub channels: BTreeMap<u64, ChannelInfo>,
	/// Updates for public channels
	pub updates: HashMap<ChannelDesc, ChannelUpdateInfo>,
	/// Local channels not announced to the network, with their remote endpoint
	pub private_channels: HashMap<u64, NodeId>,
	/// Updates for private channels
	pub private_updates: HashMap<ChannelDesc, ChannelUpdateInfo>,
	/// Channel directions currently excluded from route computation
	pub excluded_channels: HashSet<ChannelDesc>,
}

/// Everything that can drive the router, as one closed enum so the dispatch in
/// [`Router::handle_event`] stays exhaustive.
pub enum RouterEvent {
	/// A routing message relayed by a peer connection
	PeerMessage(PeerRoutingMessage),
	/// Ask the router to (re)start a channel-table sync with the given peer. Emitted by the
	/// peer actor when a connection is (re)established.
	SendChannelQuery {
		/// The peer to sync with
		remote_node_id: NodeId,
		/// The peer's transport
		transport: TransportHandle,
	},
	/// A local channel reached a usable state (or refreshed its parameters)
	LocalChannelUpdate {
		/// The channel's short id (possibly an alias while unconfirmed)
		short_channel_id: u64,
		/// The channel's remote endpoint
		remote_node_id: NodeId,
		/// Our signed update for it
		update: ChannelUpdate,
	},
	/// A local channel is gone
	LocalChannelDown {
		/// The channel's short id
		short_channel_id: u64,
	},
	/// The chain watcher saw a channel's funding output spent
	ChannelSpent {
		/// The channel's short id
		short_channel_id: u64,
	},
	/// A payment failed over this channel direction; stop routing through it for a while
	ExcludeChannel(ChannelDesc),
	/// The exclusion period for this channel direction is over
	LiftChannelExclusion(ChannelDesc),
	/// The chain tip moved
	BestBlockUpdated {
		/// The new tip height
		height: u32,
	},
	/// Periodic rebroadcast trigger. This light client doesn't relay gossip, so this is a no-op.
	TickBroadcast,
	/// Periodic prune trigger
	TickPruneStaleChannels,
	/// Compute a route
	FindRoute {
		/// What to compute
		request: RouteRequest,
		/// Where to deliver the result
		responder: oneshot::Sender<Result<RouteResponse, RouterError>>,
	},
	/// Snapshot the node table
	GetNodes {
		/// Where to deliver the result
		responder: oneshot::Sender<Vec<NodeAnnouncement>>,
	},
	/// Snapshot the channel table
	GetChannels {
		/// Where to deliver the result
		responder: oneshot::Sender<Vec<ChannelInfo>>,
	},
	/// Snapshot the update values
	GetUpdates {
		/// Where to deliver the result
		responder: oneshot::Sender<Vec<ChannelUpdateInfo>>,
	},
	/// Snapshot the update table keyed by direction
	GetUpdatesMap {
		/// Where to deliver the result
		responder: oneshot::Sender<HashMap<ChannelDesc, ChannelUpdateInfo>>,
	},
	/// Snapshot all tables
	GetData {
		/// Where to deliver the result
		responder: oneshot::Sender<DataSnapshot>,
	},
}

/// The router itself. Feed it events through [`Router::handle_event`] from a single task; see
/// [`crate::actor`] for the standard way to run it.
pub struct Router<D: Deref, L: Deref> where D::Target: NetworkDb, L::Target: Logger {
	secp_ctx: Secp256k1<secp256k1::VerifyOnly>,
	chain_hash: BlockHash,
	node_id: NodeId,
	conf: RouterConfig,
	db: D,
	logger: L,
	event_tx: broadcast::Sender<NetworkEvent>,
	best_block_height: u32,
	nodes: BTreeMap<NodeId, NodeAnnouncement>,
	channels: BTreeMap<u64, ChannelInfo>,
	updates: HashMap<ChannelDesc, ChannelUpdateInfo>,
	stash: Stash,
	awaiting: HashMap<ChannelAnnouncement, Vec<GossipOrigin>>,
	private_channels: HashMap<u64, NodeId>,
	private_updates: HashMap<ChannelDesc, ChannelUpdateInfo>,
	excluded_channels: HashSet<ChannelDesc>,
	graph: NetworkGraph,
	sync: HashMap<NodeId, Syncing>,
}

impl<D: Deref, L: Deref> Router<D, L> where D::Target: NetworkDb, L::Target: Logger {
	/// Creates an empty router for the given chain.
	pub fn new(network: Network, node_id: NodeId, conf: RouterConfig, db: D, logger: L) -> Self {
		let (event_tx, _) = broadcast::channel(256);
		Router {
			secp_ctx: Secp256k1::verification_only(),
			chain_hash: genesis_block(network).header.block_hash(),
			node_id,
			conf,
			db,
			logger,
			event_tx,
			best_block_height: 0,
			nodes: BTreeMap::new(),
			channels: BTreeMap::new(),
			updates: HashMap::new(),
			stash: Stash::default(),
			awaiting: HashMap::new(),
			private_channels: HashMap::new(),
			private_updates: HashMap::new(),
			excluded_channels: HashSet::new(),
			graph: NetworkGraph::new(),
			sync: HashMap::new(),
		}
	}

	/// Creates a router restored from the network database: channels and updates are loaded and
	/// the graph rebuilt from the enabled ones. Persisted node announcements are not loaded;
	/// node metadata is repopulated from live gossip instead, which keeps startup memory down.
	pub fn load(network: Network, node_id: NodeId, conf: RouterConfig, db: D, logger: L) -> Result<Self, io::Error> {
		let channels = db.list_channels()?;
		let updates = db.list_channel_updates()?;
		let mut router = Self::new(network, node_id, conf, db, logger);
		for info in channels {
			router.channels.insert(info.short_channel_id, info);
		}
		let mut loaded_updates = 0;
		for (desc, update) in updates {
			if !router.channels.contains_key(&desc.short_channel_id) {
				log_warn!(router.logger, "dropping persisted update for unknown channel {}", desc.short_channel_id);
				continue;
			}
			if !update.is_disabled() {
				router.graph.add_edge(desc, update.clone());
			}
			router.updates.insert(desc, update);
			loaded_updates += 1;
		}
		log_info!(router.logger, "loaded {} channels and {} channel updates from the network db",
			router.channels.len(), loaded_updates);
		Ok(router)
	}

	/// Subscribes to the router's event bus.
	pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
		self.event_tx.subscribe()
	}

	/// The configuration the router runs with.
	pub fn config(&self) -> &RouterConfig {
		&self.conf
	}

	fn publish(&self, event: NetworkEvent) {
		// A send only fails when nobody subscribed, which is fine.
		let _ = self.event_tx.send(event);
	}

	/// Processes one event to completion.
	pub fn handle_event(&mut self, event: RouterEvent) {
		let now = SystemTime::now().duration_since(UNIX_EPOCH).expect("Time must be > 1970").as_secs();
		self.handle_event_with_time(event, now);
	}

	pub(crate) fn handle_event_with_time(&mut self, event: RouterEvent, now: u64) {
		match event {
			RouterEvent::PeerMessage(peer_message) => self.handle_peer_message(peer_message, now),
			RouterEvent::SendChannelQuery { remote_node_id, transport } =>
				self.handle_send_channel_query(remote_node_id, &transport),
			RouterEvent::LocalChannelUpdate { short_channel_id, remote_node_id, update } => {
				if !self.channels.contains_key(&short_channel_id) {
					self.private_channels.insert(short_channel_id, remote_node_id);
				}
				if let Err(e) = self.handle_channel_update(update, &GossipOrigin::Local, now) {
					self.handle_message_error(e, None);
				}
			},
			RouterEvent::LocalChannelDown { short_channel_id } => {
				log_debug!(self.logger, "removing local channel {}", short_channel_id);
				self.remove_private_channel(short_channel_id);
			},
			RouterEvent::ChannelSpent { short_channel_id } => self.handle_channel_spent(short_channel_id),
			RouterEvent::ExcludeChannel(desc) => {
				log_info!(self.logger, "excluding channel {} from {} from route computation",
					desc.short_channel_id, desc.a);
				self.excluded_channels.insert(desc);
			},
			RouterEvent::LiftChannelExclusion(desc) => {
				if self.excluded_channels.remove(&desc) {
					log_info!(self.logger, "reinstating channel {} from {} for route computation",
						desc.short_channel_id, desc.a);
				}
			},
			RouterEvent::BestBlockUpdated { height } => {
				if height > self.best_block_height {
					self.best_block_height = height;
				}
			},
			RouterEvent::TickBroadcast => {
				// Light clients don't relay gossip.
			},
			RouterEvent::TickPruneStaleChannels => self.prune_stale_channels(now),
			RouterEvent::FindRoute { request, responder } => {
				let _ = responder.send(self.find_route(&request));
			},
			RouterEvent::GetNodes { responder } => {
				let _ = responder.send(self.nodes.values().cloned().collect());
			},
			RouterEvent::GetChannels { responder } => {
				let _ = responder.send(self.channels.values().cloned().collect());
			},
			RouterEvent::GetUpdates { responder } => {
				let _ = responder.send(self.updates.values().cloned().collect());
			},
			RouterEvent::GetUpdatesMap { responder } => {
				let _ = responder.send(self.updates.clone());
			},
			RouterEvent::GetData { responder } => {
				let _ = responder.send(DataSnapshot {
					nodes: self.nodes.clone(),
					channels: self.channels.clone(),
					updates: self.updates.clone(),
					private_channels: self.private_channels.clone(),
					private_updates: self.private_updates.clone(),
					excluded_channels: self.excluded_channels.clone(),
				});
			},
		}
	}

	fn handle_peer_message(&mut self, peer_message: PeerRoutingMessage, now: u64) {
		let PeerRoutingMessage { transport, remote_node_id, message } = peer_message;
		// Ack the read before doing anything else so a slow handler (or database) never stalls
		// the transport's flow control.
		let _ = transport.send(PeerCommand::ReadAck(message.clone()));
		if let Some(chain_hash) = message.chain_hash() {
			if *chain_hash != self.chain_hash {
				log_warn!(self.logger, "ignoring message from {} for chain {}", remote_node_id, chain_hash);
				return;
			}
		}
		let origin = GossipOrigin::Remote(remote_node_id);
		let result = match message.clone() {
			RoutingMessage::ChannelAnnouncement(announcement) =>
				self.handle_channel_announcement(announcement, &origin),
			RoutingMessage::ChannelUpdate(update) =>
				self.handle_channel_update(update, &origin, now),
			RoutingMessage::NodeAnnouncement(announcement) =>
				self.handle_node_announcement(announcement, &origin),
			RoutingMessage::ReplyChannelRange(reply) => {
				self.handle_reply_channel_range(remote_node_id, &transport, reply, now);
				Ok(())
			},
			RoutingMessage::ReplyShortChannelIdsEnd(reply) => {
				self.handle_reply_short_channel_ids_end(remote_node_id, &transport, reply);
				Ok(())
			},
			RoutingMessage::QueryChannelRange(_) | RoutingMessage::QueryShortChannelIds(_)
				| RoutingMessage::GossipTimestampFilter(_) => {
				// We don't serve the routing table to peers.
				log_gossip!(self.logger, "ignoring gossip query from {}", remote_node_id);
				Ok(())
			},
		};
		if let Err(e) = result {
			self.handle_message_error(e, Some((&transport, &message)));
		}
	}

	fn handle_message_error(&self, error: LightningError, origin: Option<(&TransportHandle, &RoutingMessage)>) {
		match error.action {
			ErrorAction::IgnoreError | ErrorAction::IgnoreDuplicateGossip => {
				log_gossip!(self.logger, "{}", error.err);
			},
			ErrorAction::IgnoreAndLog(level) => {
				log_given_level!(self.logger, level, "{}", error.err);
			},
			ErrorAction::SendInvalidSignature => {
				log_warn!(self.logger, "{}", error.err);
				if let Some((transport, message)) = origin {
					let _ = transport.send(PeerCommand::InvalidSignature(message.clone()));
				}
			},
		}
	}

	fn handle_channel_announcement(&mut self, announcement: ChannelAnnouncement, origin: &GossipOrigin)
		-> Result<(), LightningError> {
		let short_channel_id = announcement.contents.short_channel_id;
		if self.channels.contains_key(&short_channel_id) {
			return Err(LightningError {
				err: format!("ignoring channel_announcement for {}, already known", short_channel_id),
				action: ErrorAction::IgnoreDuplicateGossip,
			});
		}
		if let Some(origins) = self.awaiting.get_mut(&announcement) {
			origins.push(*origin);
			return Err(LightningError {
				err: format!("ignoring channel_announcement for {}, already being verified", short_channel_id),
				action: ErrorAction::IgnoreDuplicateGossip,
			});
		}
		announcement.verify(&self.secp_ctx)?;
		// Light-client policy: the channel is admitted on its signatures alone, without waiting
		// for an on-chain check of the funding output, and the witness data is dropped.
		let info = ChannelInfo {
			short_channel_id,
			node_1: announcement.contents.node_id_1,
			node_2: announcement.contents.node_id_2,
		};
		log_debug!(self.logger, "adding channel {} between {} and {}", short_channel_id, info.node_1, info.node_2);
		self.channels.insert(short_channel_id, info.clone());
		if self.private_channels.remove(&short_channel_id).is_some() {
			// The channel got publicly announced; its private updates are superseded by the
			// public ones arriving alongside the announcement.
			self.remove_private_updates(short_channel_id);
		}
		if let Err(e) = self.db.add_channel(&info) {
			log_error!(self.logger, "failed to persist channel {}: {}", short_channel_id, e);
		}
		Ok(())
	}

	fn handle_node_announcement(&mut self, announcement: NodeAnnouncement, origin: &GossipOrigin)
		-> Result<(), LightningError> {
		let node_id = announcement.contents.node_id;
		if let Some(origins) = self.stash.nodes.get_mut(&announcement) {
			origins.insert(*origin);
			return Err(LightningError {
				err: format!("ignoring node_announcement for {}, already stashed", node_id),
				action: ErrorAction::IgnoreDuplicateGossip,
			});
		}
		if let Some(existing) = self.nodes.get(&node_id) {
			if existing.contents.timestamp >= announcement.contents.timestamp {
				return Err(LightningError {
					err: format!("ignoring duplicate or outdated node_announcement for {}", node_id),
					action: ErrorAction::IgnoreDuplicateGossip,
				});
			}
		}
		announcement.verify(&self.secp_ctx)?;
		if self.nodes.contains_key(&node_id) {
			log_debug!(self.logger, "updated node {}", node_id);
			self.nodes.insert(node_id, announcement.clone());
			self.publish(NetworkEvent::NodeUpdated(announcement.clone()));
			if let Err(e) = self.db.update_node(&announcement) {
				log_error!(self.logger, "failed to persist node_announcement for {}: {}", node_id, e);
			}
			Ok(())
		} else if self.channels.values().any(|c| c.node_1 == node_id || c.node_2 == node_id) {
			log_debug!(self.logger, "added node {}", node_id);
			self.nodes.insert(node_id, announcement.clone());
			self.publish(NetworkEvent::NodeDiscovered(announcement.clone()));
			if let Err(e) = self.db.add_node(&announcement) {
				log_error!(self.logger, "failed to persist node_announcement for {}: {}", node_id, e);
			}
			Ok(())
		} else if self.awaiting.keys().any(|c| c.contents.node_id_1 == node_id || c.contents.node_id_2 == node_id) {
			let mut origins = HashSet::new();
			origins.insert(*origin);
			self.stash.nodes.insert(announcement, origins);
			Ok(())
		} else {
			// No channel references this node. Also make sure no record lingers on disk from a
			// time when one did.
			if let Err(e) = self.db.remove_node(&node_id) {
				log_error!(self.logger, "failed to remove node {} from the network db: {}", node_id, e);
			}
			Err(LightningError {
				err: format!("ignoring node_announcement for {} with no known channel", node_id),
				action: ErrorAction::IgnoreError,
			})
		}
	}

	fn handle_channel_update(&mut self, update: ChannelUpdate, origin: &GossipOrigin, now: u64)
		-> Result<(), LightningError> {
		let short_channel_id = update.contents.short_channel_id;
		if let Some(info) = self.channels.get(&short_channel_id) {
			let (node_1, node_2) = (info.node_1, info.node_2);
			let desc = ChannelDesc::from_update(&update.contents, &node_1, &node_2);
			if is_stale_timestamp(update.contents.timestamp, now) {
				return Err(LightningError {
					err: format!("ignoring stale channel_update for {}", short_channel_id),
					action: ErrorAction::IgnoreAndLog(Level::Gossip),
				});
			}
			let had_update = match self.updates.get(&desc) {
				Some(existing) => {
					if existing.timestamp >= update.contents.timestamp {
						return Err(LightningError {
							err: format!("ignoring duplicate or outdated channel_update for {}", short_channel_id),
							action: ErrorAction::IgnoreDuplicateGossip,
						});
					}
					true
				},
				None => false,
			};
			update.verify(&self.secp_ctx, &desc.a)?;
			let info = ChannelUpdateInfo::from_msg(&update.contents);
			log_debug!(self.logger, "applying channel_update for {} from {}: {}", short_channel_id,
				desc.a, if info.is_disabled() { "disabled" } else { "enabled" });
			self.updates.insert(desc, info.clone());
			self.graph.remove_edge(&desc);
			if !info.is_disabled() {
				self.graph.add_edge(desc, info.clone());
			}
			self.publish(NetworkEvent::ChannelUpdateReceived(update.clone()));
			let persisted = if had_update {
				self.db.update_channel_update(&desc, &info)
			} else {
				self.db.add_channel_update(&desc, &info)
			};
			if let Err(e) = persisted {
				log_error!(self.logger, "failed to persist channel_update for {}: {}", short_channel_id, e);
			}
			Ok(())
		} else if self.awaiting.keys().any(|c| c.contents.short_channel_id == short_channel_id) {
			self.stash.updates.entry(update).or_insert_with(HashSet::new).insert(*origin);
			Ok(())
		} else if let Some(remote_node_id) = self.private_channels.get(&short_channel_id).copied() {
			let (node_1, node_2) = if self.node_id < remote_node_id {
				(self.node_id, remote_node_id)
			} else {
				(remote_node_id, self.node_id)
			};
			let desc = ChannelDesc::from_update(&update.contents, &node_1, &node_2);
			if is_stale_timestamp(update.contents.timestamp, now) {
				return Err(LightningError {
					err: format!("ignoring stale channel_update for private channel {}", short_channel_id),
					action: ErrorAction::IgnoreAndLog(Level::Gossip),
				});
			}
			if let Some(existing) = self.private_updates.get(&desc) {
				if existing.timestamp >= update.contents.timestamp {
					return Err(LightningError {
						err: format!("ignoring duplicate or outdated channel_update for private channel {}", short_channel_id),
						action: ErrorAction::IgnoreDuplicateGossip,
					});
				}
			}
			update.verify(&self.secp_ctx, &desc.a)?;
			let info = ChannelUpdateInfo::from_msg(&update.contents);
			log_debug!(self.logger, "applying channel_update for private channel {}: {}", short_channel_id,
				if info.is_disabled() { "disabled" } else { "enabled" });
			self.private_updates.insert(desc, info.clone());
			self.graph.remove_edge(&desc);
			if !info.is_disabled() {
				self.graph.add_edge(desc, info);
			}
			Ok(())
		} else {
			Err(LightningError {
				err: format!("ignoring channel_update for unknown channel {}", short_channel_id),
				action: ErrorAction::IgnoreError,
			})
		}
	}

	fn handle_channel_spent(&mut self, short_channel_id: u64) {
		if self.channels.contains_key(&short_channel_id) {
			log_info!(self.logger, "funding output of channel {} was spent", short_channel_id);
			self.remove_channels(&[short_channel_id]);
		} else if self.private_channels.contains_key(&short_channel_id) {
			log_info!(self.logger, "funding output of private channel {} was spent", short_channel_id);
			self.remove_private_channel(short_channel_id);
		} else {
			log_debug!(self.logger, "ignoring spend of unknown channel {}", short_channel_id);
		}
	}

	fn remove_private_channel(&mut self, short_channel_id: u64) {
		self.private_channels.remove(&short_channel_id);
		self.remove_private_updates(short_channel_id);
	}

	fn remove_private_updates(&mut self, short_channel_id: u64) {
		let descs: Vec<ChannelDesc> = self.private_updates.keys()
			.filter(|desc| desc.short_channel_id == short_channel_id).copied().collect();
		for desc in descs {
			self.private_updates.remove(&desc);
			self.graph.remove_edge(&desc);
		}
	}

	fn is_stale_channel(&self, info: &ChannelInfo, now: u64) -> bool {
		let height = block_from_scid(info.short_channel_id);
		if height.saturating_add(CHANNEL_STALE_AGE_BLOCKS) >= self.best_block_height {
			return false;
		}
		let stale_side = |desc: &ChannelDesc| {
			self.updates.get(desc).map_or(true, |update| is_stale_timestamp(update.timestamp, now))
		};
		stale_side(&info.desc_1()) && stale_side(&info.desc_2())
	}

	fn prune_stale_channels(&mut self, now: u64) {
		let mut stale = Vec::new();
		for info in self.channels.values() {
			if stale.len() >= MAX_PRUNE_COUNT {
				break;
			}
			if self.is_stale_channel(info, now) {
				stale.push(info.short_channel_id);
			}
		}
		if !stale.is_empty() {
			log_info!(self.logger, "pruning {} stale channels", stale.len());
		}
		self.remove_channels(&stale);
	}

	/// Removes the given channels from every table, the graph, and the database, then drops
	/// nodes left without any channel. Used by the pruner and the funding-spent path alike.
	fn remove_channels(&mut self, short_channel_ids: &[u64]) {
		let mut affected_nodes = HashSet::new();
		for short_channel_id in short_channel_ids {
			let info = match self.channels.remove(short_channel_id) {
				Some(info) => info,
				None => continue,
			};
			self.updates.remove(&info.desc_1());
			self.updates.remove(&info.desc_2());
			self.graph.remove_edge(&info.desc_1());
			self.graph.remove_edge(&info.desc_2());
			if let Err(e) = self.db.remove_channel(*short_channel_id) {
				log_error!(self.logger, "failed to remove channel {} from the network db: {}", short_channel_id, e);
			}
			self.publish(NetworkEvent::ChannelLost { short_channel_id: *short_channel_id });
			affected_nodes.insert(info.node_1);
			affected_nodes.insert(info.node_2);
		}
		if affected_nodes.is_empty() {
			return;
		}
		let mut still_connected = HashSet::new();
		for info in self.channels.values() {
			still_connected.insert(info.node_1);
			still_connected.insert(info.node_2);
		}
		for node_id in affected_nodes {
			if still_connected.contains(&node_id) {
				continue;
			}
			if self.nodes.remove(&node_id).is_some() {
				log_debug!(self.logger, "dropping node {} with no remaining channel", node_id);
				if let Err(e) = self.db.remove_node(&node_id) {
					log_error!(self.logger, "failed to remove node {} from the network db: {}", node_id, e);
				}
				self.publish(NetworkEvent::NodeLost { node_id });
			}
		}
	}

	fn handle_send_channel_query(&mut self, remote_node_id: NodeId, transport: &TransportHandle) {
		// Any sync in progress with this peer died with its previous connection.
		self.sync.remove(&remote_node_id);
		let query_flags = match self.conf.channel_query_mode {
			ChannelQueryMode::Plain => None,
			ChannelQueryMode::WithTimestamps => Some(QUERY_FLAG_TIMESTAMPS),
			ChannelQueryMode::WithChecksums => Some(QUERY_FLAG_TIMESTAMPS | QUERY_FLAG_CHECKSUMS),
		};
		log_debug!(self.logger, "sending query_channel_range to {}", remote_node_id);
		let _ = transport.send(PeerCommand::Send(RoutingMessage::QueryChannelRange(QueryChannelRange {
			chain_hash: self.chain_hash,
			first_blocknum: 0,
			number_of_blocks: u32::max_value(),
			query_flags,
		})));
		let _ = transport.send(PeerCommand::Send(RoutingMessage::GossipTimestampFilter(GossipTimestampFilter {
			chain_hash: self.chain_hash,
			first_timestamp: 0,
			timestamp_range: u32::max_value(),
		})));
		self.publish(NetworkEvent::SyncProgress { progress: sync_progress(&self.sync) });
	}

	fn handle_reply_channel_range(&mut self, remote_node_id: NodeId, transport: &TransportHandle,
		reply: ReplyChannelRange, now: u64) {
		let wanted = {
			let channels = &self.channels;
			let updates = &self.updates;
			shortids_to_request(&reply,
				|short_channel_id| channels.contains_key(&short_channel_id),
				|short_channel_id| {
					match channels.get(&short_channel_id) {
						Some(info) => {
							let update_1 = updates.get(&info.desc_1());
							let update_2 = updates.get(&info.desc_2());
							((update_1.map_or(0, |u| u.timestamp), update_2.map_or(0, |u| u.timestamp)),
								(update_1.map_or(0, |u| update_checksum(short_channel_id, u)),
								update_2.map_or(0, |u| update_checksum(short_channel_id, u))))
						},
						None => ((0, 0), (0, 0)),
					}
				},
				now)
		};
		log_debug!(self.logger, "reply_channel_range from {} with {} ids, requesting {}",
			remote_node_id, reply.short_channel_ids.len(), wanted.len());
		let queries = build_queries(self.chain_hash, &wanted, reply.checksums.is_some());

		// Channels the peer no longer announces within its declared window are prune
		// candidates; this is what makes us converge with the rest of the network.
		self.reconcile_with_range_reply(&reply, now);

		if !queries.is_empty() {
			match self.sync.entry(remote_node_id) {
				Entry::Occupied(mut entry) => {
					let syncing = entry.get_mut();
					syncing.total += queries.len();
					syncing.pending.extend(queries);
				},
				Entry::Vacant(entry) => {
					let total = queries.len();
					let mut queries = queries.into_iter();
					let head = queries.next().unwrap();
					entry.insert(Syncing { pending: queries.collect(), total });
					let _ = transport.send(PeerCommand::Send(RoutingMessage::QueryShortChannelIds(head)));
				},
			}
		}
		self.publish(NetworkEvent::SyncProgress { progress: sync_progress(&self.sync) });
	}

	fn reconcile_with_range_reply(&mut self, reply: &ReplyChannelRange, now: u64) {
		let start = match scid_from_parts(reply.first_blocknum as u64, 0, 0) {
			Ok(scid) => scid,
			Err(_) => return,
		};
		let end_block = cmp::min(reply.end_blocknum() as u64, MAX_SCID_BLOCK);
		let end = match scid_from_parts(end_block, 0, 0) {
			Ok(scid) => scid,
			Err(_) => return,
		};
		let announced: HashSet<u64> = reply.short_channel_ids.iter().copied().collect();
		let mut candidates = Vec::new();
		for (short_channel_id, info) in self.channels.range(start..end) {
			if candidates.len() >= MAX_PRUNE_COUNT {
				break;
			}
			if announced.contains(short_channel_id) {
				continue;
			}
			if self.is_stale_channel(info, now) {
				candidates.push(*short_channel_id);
			}
		}
		if !candidates.is_empty() {
			log_info!(self.logger, "pruning {} channels the peer no longer announces", candidates.len());
		}
		self.remove_channels(&candidates);
	}

	fn handle_reply_short_channel_ids_end(&mut self, remote_node_id: NodeId, transport: &TransportHandle,
		_reply: ReplyShortChannelIdsEnd) {
		let mut done = false;
		if let Some(syncing) = self.sync.get_mut(&remote_node_id) {
			match syncing.pending.pop_front() {
				Some(query) => {
					let _ = transport.send(PeerCommand::Send(RoutingMessage::QueryShortChannelIds(query)));
				},
				None => done = true,
			}
		}
		if done {
			log_debug!(self.logger, "sync with {} complete", remote_node_id);
			self.sync.remove(&remote_node_id);
		}
		self.publish(NetworkEvent::SyncProgress { progress: sync_progress(&self.sync) });
	}

	/// Computes a route, synchronously. Hosts that find this too heavy for their event loop can
	/// run it from a worker over a snapshot instead; the state it reads is only mutated between
	/// events.
	pub fn find_route(&self, request: &RouteRequest) -> Result<RouteResponse, RouterError> {
		if request.source == request.target {
			return Err(RouterError::CannotRouteToSelf);
		}
		let mut assisted: HashMap<ChannelDesc, ChannelUpdateInfo> = HashMap::new();
		for route in request.assisted_routes.iter() {
			for (i, hop) in route.iter().enumerate() {
				let next_node = if i + 1 < route.len() { route[i + 1].node_id } else { request.target };
				let channel_flags = if hop.node_id < next_node { 0 } else { 1 };
				let desc = ChannelDesc {
					short_channel_id: hop.short_channel_id,
					a: hop.node_id,
					b: next_node,
				};
				assisted.insert(desc, ChannelUpdateInfo {
					timestamp: 0,
					message_flags: 0,
					channel_flags,
					cltv_expiry_delta: hop.cltv_expiry_delta,
					htlc_minimum_msat: 0,
					htlc_maximum_msat: None,
					fees: hop.fees,
				});
			}
		}
		let mut ignored = self.excluded_channels.clone();
		ignored.extend(request.ignore_channels.iter().copied());
		let paths = self.graph.k_shortest_paths(&request.source, &request.target,
			request.amount_msat, &ignored, &request.ignore_nodes, &assisted,
			cmp::max(1, request.num_routes));
		if paths.is_empty() || (paths.len() == 1 && paths[0].path.is_empty()) {
			return Err(RouterError::RouteNotFound);
		}
		let max_weight = (paths[0].weight as f64 * (1.0 + DEFAULT_ALLOWED_SPREAD)).round() as u64;
		let eligible: Vec<_> = paths.iter().filter(|path| path.weight <= max_weight).collect();
		let chosen = if self.conf.randomize_route_selection {
			eligible[rand::thread_rng().gen_range(0..eligible.len())]
		} else {
			eligible[0]
		};
		log_debug!(self.logger, "found {} paths to {}, picked one of {} with weight {}",
			paths.len(), request.target, eligible.len(), chosen.weight);
		let hops = chosen.path.iter().map(|edge| Hop {
			node_id: edge.desc.a,
			next_node_id: edge.desc.b,
			last_update: edge.update.clone(),
		}).collect();
		Ok(RouteResponse {
			hops,
			ignore_nodes: request.ignore_nodes.clone(),
			ignore_channels: request.ignore_channels.clone(),
		})
	}
}

/// Drops from a pending rebroadcast everything the requesting peer sent us itself, and applies
/// its timestamp filter to the updates and node announcements (channel announcements carry no
/// timestamp and pass any filter).
pub fn filter_gossip(rebroadcast: &Rebroadcast, requester: &GossipOrigin, filter: Option<&GossipTimestampFilter>)
	-> (Vec<ChannelAnnouncement>, Vec<ChannelUpdate>, Vec<NodeAnnouncement>) {
	let channels = rebroadcast.channels.iter()
		.filter(|(_, origins)| !origins.contains(requester))
		.map(|(announcement, _)| announcement.clone()).collect();
	let updates = rebroadcast.updates.iter()
		.filter(|(update, origins)| !origins.contains(requester)
			&& filter.map_or(true, |f| f.includes(update.contents.timestamp)))
		.map(|(update, _)| update.clone()).collect();
	let nodes = rebroadcast.nodes.iter()
		.filter(|(announcement, origins)| !origins.contains(requester)
			&& filter.map_or(true, |f| f.includes(announcement.contents.timestamp)))
		.map(|(announcement, _)| announcement.clone()).collect();
	(channels, updates, nodes)
}
