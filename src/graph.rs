// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The directed channel graph and the k-shortest-paths search the route planner runs over it.
//!
//! Each edge is one direction of a channel, keyed by [`ChannelDesc`] and carrying the routing
//! parameters from its latest enabled channel_update. The graph holds exactly the enabled
//! directions; disabled updates remove their edge rather than annotating it.

use crate::msgs::{DecodeError, NodeId, RoutingFees, UnsignedChannelUpdate};
use crate::util::ser::{Readable, Writeable, Writer};

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io::{self, Read};

/// Routes longer than this many hops cannot be built into onions and are never returned.
pub const ROUTE_MAX_LENGTH: usize = 20;

/// One direction of a channel: `a` is the node the update originates from (and the node HTLCs
/// traverse the channel from), `b` the node they arrive at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelDesc {
	/// The channel's short id
	pub short_channel_id: u64,
	/// The originating node for this direction
	pub a: NodeId,
	/// The receiving node for this direction
	pub b: NodeId,
}

impl ChannelDesc {
	/// Builds the descriptor a channel_update refers to, given the channel's announced node
	/// ordering (node_1 must be the lexicographically lesser key).
	pub fn from_update(update: &UnsignedChannelUpdate, node_1: &NodeId, node_2: &NodeId) -> ChannelDesc {
		if update.direction() == 0 {
			ChannelDesc { short_channel_id: update.short_channel_id, a: *node_1, b: *node_2 }
		} else {
			ChannelDesc { short_channel_id: update.short_channel_id, a: *node_2, b: *node_1 }
		}
	}
}

impl Writeable for ChannelDesc {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.short_channel_id.write(writer)?;
		self.a.write(writer)?;
		self.b.write(writer)
	}
}

impl Readable for ChannelDesc {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(ChannelDesc {
			short_channel_id: Readable::read(reader)?,
			a: Readable::read(reader)?,
			b: Readable::read(reader)?,
		})
	}
}

/// What we keep of a channel_announcement once it has been validated: the identifiers. The
/// signatures and funding keys only matter for admission and dropping them keeps the channel
/// table small enough for mobile use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
	/// The channel's short id
	pub short_channel_id: u64,
	/// The lexicographically lesser endpoint
	pub node_1: NodeId,
	/// The lexicographically greater endpoint
	pub node_2: NodeId,
}

impl ChannelInfo {
	/// The descriptor for the direction originating from node_1.
	pub fn desc_1(&self) -> ChannelDesc {
		ChannelDesc { short_channel_id: self.short_channel_id, a: self.node_1, b: self.node_2 }
	}

	/// The descriptor for the direction originating from node_2.
	pub fn desc_2(&self) -> ChannelDesc {
		ChannelDesc { short_channel_id: self.short_channel_id, a: self.node_2, b: self.node_1 }
	}
}

impl Writeable for ChannelInfo {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.short_channel_id.write(writer)?;
		self.node_1.write(writer)?;
		self.node_2.write(writer)
	}
}

impl Readable for ChannelInfo {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(ChannelInfo {
			short_channel_id: Readable::read(reader)?,
			node_1: Readable::read(reader)?,
			node_2: Readable::read(reader)?,
		})
	}
}

/// What we keep of a channel_update once it has been validated: everything but the signature and
/// the chain hash, both of which are dead weight after admission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelUpdateInfo {
	/// When the last update to the channel direction was issued
	pub timestamp: u32,
	/// Message flags as received (bit 0 tracks `htlc_maximum_msat` presence)
	pub message_flags: u8,
	/// Channel flags as received (bit 0 direction, bit 1 disabled)
	pub channel_flags: u8,
	/// The difference in CLTV values that you must have when routing through this channel
	pub cltv_expiry_delta: u16,
	/// The minimum value, which must be relayed to the next hop via the channel
	pub htlc_minimum_msat: u64,
	/// The maximum value which may be relayed to the next hop via the channel
	pub htlc_maximum_msat: Option<u64>,
	/// Fees charged when the channel is used for routing
	pub fees: RoutingFees,
}

impl ChannelUpdateInfo {
	/// Strips a validated channel_update down to its routing content.
	pub fn from_msg(msg: &UnsignedChannelUpdate) -> Self {
		ChannelUpdateInfo {
			timestamp: msg.timestamp,
			message_flags: msg.message_flags,
			channel_flags: msg.channel_flags,
			cltv_expiry_delta: msg.cltv_expiry_delta,
			htlc_minimum_msat: msg.htlc_minimum_msat,
			htlc_maximum_msat: msg.htlc_maximum_msat,
			fees: RoutingFees {
				base_msat: msg.fee_base_msat,
				proportional_millionths: msg.fee_proportional_millionths,
			},
		}
	}

	/// Whether this update marks its direction of the channel as temporarily unusable
	pub fn is_disabled(&self) -> bool {
		self.channel_flags & (1 << 1) != 0
	}

	/// The fee charged for relaying the given amount across this channel direction.
	pub fn fee_msat(&self, amount_msat: u64) -> u64 {
		let proportional = (amount_msat as u128 * self.fees.proportional_millionths as u128 / 1_000_000) as u64;
		(self.fees.base_msat as u64).saturating_add(proportional)
	}

	/// Whether the given amount satisfies the update's htlc_minimum/htlc_maximum constraints.
	pub fn htlc_fits(&self, amount_msat: u64) -> bool {
		amount_msat >= self.htlc_minimum_msat
			&& self.htlc_maximum_msat.map_or(true, |max| amount_msat <= max)
	}
}

impl Writeable for ChannelUpdateInfo {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.timestamp.write(writer)?;
		let message_flags = if self.htlc_maximum_msat.is_some() {
			self.message_flags | 1
		} else {
			self.message_flags & !1
		};
		message_flags.write(writer)?;
		self.channel_flags.write(writer)?;
		self.cltv_expiry_delta.write(writer)?;
		self.htlc_minimum_msat.write(writer)?;
		self.fees.write(writer)?;
		if let Some(htlc_maximum_msat) = self.htlc_maximum_msat {
			htlc_maximum_msat.write(writer)?;
		}
		Ok(())
	}
}

impl Readable for ChannelUpdateInfo {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let timestamp: u32 = Readable::read(reader)?;
		let message_flags: u8 = Readable::read(reader)?;
		let channel_flags: u8 = Readable::read(reader)?;
		let cltv_expiry_delta: u16 = Readable::read(reader)?;
		let htlc_minimum_msat: u64 = Readable::read(reader)?;
		let fees: RoutingFees = Readable::read(reader)?;
		let htlc_maximum_msat = if message_flags & 1 != 0 {
			Some(Readable::read(reader)?)
		} else {
			None
		};
		Ok(ChannelUpdateInfo {
			timestamp, message_flags, channel_flags, cltv_expiry_delta, htlc_minimum_msat,
			htlc_maximum_msat, fees,
		})
	}
}

/// One edge traversal, pairing a descriptor with the routing parameters in force for it.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphEdge {
	/// The channel direction being traversed
	pub desc: ChannelDesc,
	/// The update governing that direction
	pub update: ChannelUpdateInfo,
}

/// A path through the graph together with its total fee.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightedPath {
	/// The edges traversed, source first
	pub path: Vec<GraphEdge>,
	/// The summed edge fees for the queried amount
	pub weight: u64,
}

/// The directed channel graph. Holds exactly one edge per enabled (channel, direction) pair;
/// adding an edge for a descriptor that is already present replaces its update.
#[derive(Clone, Default)]
pub struct NetworkGraph {
	adjacency: HashMap<NodeId, Vec<GraphEdge>>,
	edge_count: usize,
}

impl NetworkGraph {
	/// Constructs a new, empty graph.
	pub fn new() -> Self {
		NetworkGraph { adjacency: HashMap::new(), edge_count: 0 }
	}

	/// Adds an edge for the given descriptor, replacing any edge already present for it.
	pub fn add_edge(&mut self, desc: ChannelDesc, update: ChannelUpdateInfo) {
		let edges = self.adjacency.entry(desc.a).or_insert_with(Vec::new);
		for edge in edges.iter_mut() {
			if edge.desc == desc {
				edge.update = update;
				return;
			}
		}
		edges.push(GraphEdge { desc, update });
		self.edge_count += 1;
	}

	/// Removes the edge for the given descriptor. No-op if it isn't present.
	pub fn remove_edge(&mut self, desc: &ChannelDesc) {
		if let Some(edges) = self.adjacency.get_mut(&desc.a) {
			let len_before = edges.len();
			edges.retain(|edge| edge.desc != *desc);
			self.edge_count -= len_before - edges.len();
			if edges.is_empty() {
				self.adjacency.remove(&desc.a);
			}
		}
	}

	/// Removes every edge yielded by the iterator.
	pub fn remove_edges<I: IntoIterator<Item = ChannelDesc>>(&mut self, descs: I) {
		for desc in descs {
			self.remove_edge(&desc);
		}
	}

	/// Whether an edge exists for the given descriptor.
	pub fn contains_edge(&self, desc: &ChannelDesc) -> bool {
		self.adjacency.get(&desc.a).map_or(false, |edges| edges.iter().any(|e| e.desc == *desc))
	}

	/// The number of edges currently in the graph.
	pub fn edge_count(&self) -> usize {
		self.edge_count
	}

	fn edges_from(&self, node: &NodeId) -> &[GraphEdge] {
		self.adjacency.get(node).map_or(&[], |edges| &edges[..])
	}

	/// Dijkstra over the graph plus the extra edges, honoring the various exclusion sets.
	/// `banned_edges`/`banned_nodes` are the transient bans of the spur-path search; the ignored
	/// sets come from the caller's query.
	fn shortest_path(
		&self, source: &NodeId, target: &NodeId, amount_msat: u64,
		extra_adjacency: &HashMap<NodeId, Vec<GraphEdge>>, extra_descs: &HashSet<ChannelDesc>,
		ignored_edges: &HashSet<ChannelDesc>, ignored_nodes: &HashSet<NodeId>,
		banned_edges: &HashSet<ChannelDesc>, banned_nodes: &HashSet<NodeId>,
	) -> Option<WeightedPath> {
		let mut dist: HashMap<NodeId, u64> = HashMap::new();
		let mut prev: HashMap<NodeId, GraphEdge> = HashMap::new();
		let mut heap: BinaryHeap<Reverse<(u64, NodeId)>> = BinaryHeap::new();

		dist.insert(*source, 0);
		heap.push(Reverse((0, *source)));

		while let Some(Reverse((weight, node))) = heap.pop() {
			if node == *target {
				break;
			}
			if weight > *dist.get(&node).unwrap_or(&u64::max_value()) {
				continue;
			}
			// Stored edges overridden by an extra edge for the same descriptor are skipped, so
			// assisted-route parameters take precedence for this query.
			let stored = self.edges_from(&node).iter().filter(|e| !extra_descs.contains(&e.desc));
			let extra = extra_adjacency.get(&node).map_or(&[][..], |e| &e[..]).iter();
			for edge in stored.chain(extra) {
				if ignored_edges.contains(&edge.desc) || banned_edges.contains(&edge.desc) {
					continue;
				}
				if ignored_nodes.contains(&edge.desc.a) || ignored_nodes.contains(&edge.desc.b)
					|| banned_nodes.contains(&edge.desc.b) {
					continue;
				}
				if !edge.update.htlc_fits(amount_msat) {
					continue;
				}
				let next_weight = weight.saturating_add(edge.update.fee_msat(amount_msat));
				if next_weight < *dist.get(&edge.desc.b).unwrap_or(&u64::max_value()) {
					dist.insert(edge.desc.b, next_weight);
					prev.insert(edge.desc.b, edge.clone());
					heap.push(Reverse((next_weight, edge.desc.b)));
				}
			}
		}

		let weight = *dist.get(target)?;
		let mut path = Vec::new();
		let mut node = *target;
		while node != *source {
			let edge = prev.get(&node)?.clone();
			node = edge.desc.a;
			path.push(edge);
		}
		path.reverse();
		Some(WeightedPath { path, weight })
	}

	/// Yen's algorithm: up to `k` loopless paths from `source` to `target` in non-decreasing
	/// weight order. `extra_edges` exist only for this query and take precedence over stored
	/// edges with the same descriptor; `ignored_edges` and `ignored_nodes` are excluded
	/// entirely. Paths longer than [`ROUTE_MAX_LENGTH`] are not returned.
	pub fn k_shortest_paths(
		&self, source: &NodeId, target: &NodeId, amount_msat: u64,
		ignored_edges: &HashSet<ChannelDesc>, ignored_nodes: &HashSet<NodeId>,
		extra_edges: &HashMap<ChannelDesc, ChannelUpdateInfo>, k: usize,
	) -> Vec<WeightedPath> {
		if k == 0 {
			return Vec::new();
		}
		let mut extra_adjacency: HashMap<NodeId, Vec<GraphEdge>> = HashMap::new();
		let mut extra_descs: HashSet<ChannelDesc> = HashSet::new();
		for (desc, update) in extra_edges.iter() {
			extra_descs.insert(*desc);
			extra_adjacency.entry(desc.a).or_insert_with(Vec::new)
				.push(GraphEdge { desc: *desc, update: update.clone() });
		}

		let mut shortest: Vec<WeightedPath> = Vec::new();
		match self.shortest_path(source, target, amount_msat, &extra_adjacency, &extra_descs,
			ignored_edges, ignored_nodes, &HashSet::new(), &HashSet::new()) {
			Some(path) => shortest.push(path),
			None => return Vec::new(),
		}

		let mut candidates: Vec<WeightedPath> = Vec::new();
		for _ in 1..k {
			let prev_path = shortest.last().unwrap().clone();
			for i in 0..prev_path.path.len() {
				let spur_node = if i == 0 { *source } else { prev_path.path[i - 1].desc.b };
				let root = &prev_path.path[..i];
				let root_weight = root.iter()
					.fold(0u64, |acc, e| acc.saturating_add(e.update.fee_msat(amount_msat)));

				// Ban the next edge of every known path sharing this root, so the spur search
				// must branch off here.
				let mut banned_edges = HashSet::new();
				for known in shortest.iter() {
					if known.path.len() > i && same_edges(&known.path[..i], root) {
						banned_edges.insert(known.path[i].desc);
					}
				}
				// Ban the root's nodes (except the spur node) to keep candidates loopless.
				let mut banned_nodes = HashSet::new();
				if i > 0 {
					banned_nodes.insert(*source);
					for edge in root[..i - 1].iter() {
						banned_nodes.insert(edge.desc.b);
					}
				}

				if let Some(spur) = self.shortest_path(&spur_node, target, amount_msat,
					&extra_adjacency, &extra_descs, ignored_edges, ignored_nodes,
					&banned_edges, &banned_nodes) {
					let mut path = root.to_vec();
					path.extend(spur.path);
					let candidate = WeightedPath {
						weight: root_weight.saturating_add(spur.weight),
						path,
					};
					let seen = shortest.iter().chain(candidates.iter())
						.any(|p| same_edges(&p.path, &candidate.path));
					if !seen {
						candidates.push(candidate);
					}
				}
			}
			if candidates.is_empty() {
				break;
			}
			let best = candidates.iter().enumerate()
				.min_by_key(|(_, p)| p.weight).map(|(idx, _)| idx).unwrap();
			shortest.push(candidates.remove(best));
		}

		shortest.retain(|p| p.path.len() <= ROUTE_MAX_LENGTH);
		shortest
	}
}

fn same_edges(a: &[GraphEdge], b: &[GraphEdge]) -> bool {
	a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.desc == y.desc)
}
