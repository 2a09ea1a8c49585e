// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use crate::events::PeerCommand;
use crate::events::TransportHandle;
use crate::graph::{ChannelDesc, ChannelInfo, ChannelUpdateInfo};
use crate::msgs::{
	ChannelAnnouncement, ChannelUpdate, NodeAnnouncement, NodeId, RoutingFees,
	UnsignedChannelAnnouncement, UnsignedChannelUpdate, UnsignedNodeAnnouncement,
};
use crate::storage::NetworkDb;
use crate::util::logger::{Level, Logger, Record};
use crate::util::ser::Writeable;

use bitcoin::blockdata::constants::genesis_block;
use bitcoin::hashes::Hash;
use bitcoin::hashes::sha256d::Hash as Sha256dHash;
use bitcoin::network::constants::Network;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};

use tokio::sync::mpsc;

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

pub struct TestLogger {
	level: Level,
	pub lines: Mutex<HashMap<(String, String), usize>>,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		TestLogger {
			level: Level::Trace,
			lines: Mutex::new(HashMap::new()),
		}
	}
	pub fn enable(&mut self, level: Level) {
		self.level = level;
	}
	pub fn assert_log(&self, module: String, line: String, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		assert_eq!(log_entries.get(&(module, line)), Some(&count));
	}

	/// Search for the number of occurrences of the logged lines which
	/// 1. belong to the specified module and
	/// 2. contain `line` in them.
	/// And asserts if the number of occurrences is the same with the given `count`
	pub fn assert_log_contains(&self, module: String, line: String, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		let l: usize = log_entries.iter().filter(|&(&(ref m, ref l), _c)| {
			m == &module && l.contains(line.as_str())
		}).map(|(_, c)| { c }).sum();
		assert_eq!(l, count)
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		*self.lines.lock().unwrap().entry((record.module_path.to_string(), format!("{}", record.args))).or_insert(0) += 1;
		if self.level >= record.level {
			println!("{:<5} [{} : {}, {}] {}", record.level.to_string(), record.module_path, record.file, record.line, record.args);
		}
	}
}

/// An in-memory network db, also handy for asserting what got persisted.
pub struct MemoryNetworkDb {
	pub channels: Mutex<HashMap<u64, ChannelInfo>>,
	pub updates: Mutex<HashMap<ChannelDesc, ChannelUpdateInfo>>,
	pub nodes: Mutex<HashMap<NodeId, NodeAnnouncement>>,
}

impl MemoryNetworkDb {
	pub fn new() -> Self {
		MemoryNetworkDb {
			channels: Mutex::new(HashMap::new()),
			updates: Mutex::new(HashMap::new()),
			nodes: Mutex::new(HashMap::new()),
		}
	}
}

impl NetworkDb for MemoryNetworkDb {
	fn list_channels(&self) -> Result<Vec<ChannelInfo>, io::Error> {
		Ok(self.channels.lock().unwrap().values().cloned().collect())
	}
	fn list_channel_updates(&self) -> Result<Vec<(ChannelDesc, ChannelUpdateInfo)>, io::Error> {
		Ok(self.updates.lock().unwrap().iter().map(|(desc, update)| (*desc, update.clone())).collect())
	}
	fn add_channel(&self, channel: &ChannelInfo) -> Result<(), io::Error> {
		self.channels.lock().unwrap().insert(channel.short_channel_id, channel.clone());
		Ok(())
	}
	fn remove_channel(&self, short_channel_id: u64) -> Result<(), io::Error> {
		self.channels.lock().unwrap().remove(&short_channel_id);
		self.updates.lock().unwrap().retain(|desc, _| desc.short_channel_id != short_channel_id);
		Ok(())
	}
	fn add_channel_update(&self, desc: &ChannelDesc, update: &ChannelUpdateInfo) -> Result<(), io::Error> {
		self.updates.lock().unwrap().insert(*desc, update.clone());
		Ok(())
	}
	fn update_channel_update(&self, desc: &ChannelDesc, update: &ChannelUpdateInfo) -> Result<(), io::Error> {
		self.updates.lock().unwrap().insert(*desc, update.clone());
		Ok(())
	}
	fn add_node(&self, node: &NodeAnnouncement) -> Result<(), io::Error> {
		self.nodes.lock().unwrap().insert(node.contents.node_id, node.clone());
		Ok(())
	}
	fn update_node(&self, node: &NodeAnnouncement) -> Result<(), io::Error> {
		self.nodes.lock().unwrap().insert(node.contents.node_id, node.clone());
		Ok(())
	}
	fn remove_node(&self, node_id: &NodeId) -> Result<(), io::Error> {
		self.nodes.lock().unwrap().remove(node_id);
		Ok(())
	}
}

/// A transport whose outbound commands the test can inspect.
pub fn test_transport() -> (TransportHandle, mpsc::UnboundedReceiver<PeerCommand>) {
	mpsc::unbounded_channel()
}

/// Orders two secret keys so that the first one maps to the lexicographically lesser public key,
/// i.e. to `node_id_1` of an announcement built from them.
pub fn sorted_node_keys(secp_ctx: &Secp256k1<All>, key_a: &SecretKey, key_b: &SecretKey) -> (SecretKey, SecretKey) {
	let id_a = NodeId::from_pubkey(&PublicKey::from_secret_key(secp_ctx, key_a));
	let id_b = NodeId::from_pubkey(&PublicKey::from_secret_key(secp_ctx, key_b));
	if id_a < id_b { (*key_a, *key_b) } else { (*key_b, *key_a) }
}

pub fn get_signed_node_announcement<F: Fn(&mut UnsignedNodeAnnouncement)>(f: F, node_key: &SecretKey, secp_ctx: &Secp256k1<All>) -> NodeAnnouncement {
	let node_id = NodeId::from_pubkey(&PublicKey::from_secret_key(secp_ctx, node_key));
	let mut unsigned_announcement = UnsignedNodeAnnouncement {
		features: Vec::new(),
		timestamp: 100,
		node_id,
		rgb: [0; 3],
		alias: [0; 32],
		addresses: Vec::new(),
	};
	f(&mut unsigned_announcement);
	let msghash = Message::from_slice(&Sha256dHash::hash(&unsigned_announcement.encode()[..])[..]).unwrap();
	NodeAnnouncement {
		signature: secp_ctx.sign_ecdsa(&msghash, node_key),
		contents: unsigned_announcement,
	}
}

/// Builds a signed channel announcement between the two keys, ordering them so the announcement
/// is well-formed (`node_id_1` lexicographically first). The node keys double as funding keys.
pub fn get_signed_channel_announcement<F: Fn(&mut UnsignedChannelAnnouncement)>(f: F, node_a_key: &SecretKey, node_b_key: &SecretKey, secp_ctx: &Secp256k1<All>) -> ChannelAnnouncement {
	let (node_1_key, node_2_key) = sorted_node_keys(secp_ctx, node_a_key, node_b_key);
	let node_id_1 = NodeId::from_pubkey(&PublicKey::from_secret_key(secp_ctx, &node_1_key));
	let node_id_2 = NodeId::from_pubkey(&PublicKey::from_secret_key(secp_ctx, &node_2_key));
	let mut unsigned_announcement = UnsignedChannelAnnouncement {
		features: Vec::new(),
		chain_hash: genesis_block(Network::Testnet).header.block_hash(),
		short_channel_id: 0,
		node_id_1,
		node_id_2,
		bitcoin_key_1: node_id_1,
		bitcoin_key_2: node_id_2,
	};
	f(&mut unsigned_announcement);
	let msghash = Message::from_slice(&Sha256dHash::hash(&unsigned_announcement.encode()[..])[..]).unwrap();
	ChannelAnnouncement {
		node_signature_1: secp_ctx.sign_ecdsa(&msghash, &node_1_key),
		node_signature_2: secp_ctx.sign_ecdsa(&msghash, &node_2_key),
		bitcoin_signature_1: secp_ctx.sign_ecdsa(&msghash, &node_1_key),
		bitcoin_signature_2: secp_ctx.sign_ecdsa(&msghash, &node_2_key),
		contents: unsigned_announcement,
	}
}

pub fn get_signed_channel_update<F: Fn(&mut UnsignedChannelUpdate)>(f: F, node_key: &SecretKey, secp_ctx: &Secp256k1<All>) -> ChannelUpdate {
	let mut unsigned_channel_update = UnsignedChannelUpdate {
		chain_hash: genesis_block(Network::Testnet).header.block_hash(),
		short_channel_id: 0,
		timestamp: 100,
		message_flags: 1,
		channel_flags: 0,
		cltv_expiry_delta: 144,
		htlc_minimum_msat: 1_000,
		fee_base_msat: 10_000,
		fee_proportional_millionths: 20,
		htlc_maximum_msat: Some(1_000_000_000),
	};
	f(&mut unsigned_channel_update);
	let msghash = Message::from_slice(&Sha256dHash::hash(&unsigned_channel_update.encode()[..])[..]).unwrap();
	ChannelUpdate {
		signature: secp_ctx.sign_ecdsa(&msghash, node_key),
		contents: unsigned_channel_update,
	}
}

/// A synthetic update for direct graph construction in routing tests.
pub fn fee_only_update(fee_base_msat: u32) -> ChannelUpdateInfo {
	ChannelUpdateInfo {
		timestamp: 100,
		message_flags: 0,
		channel_flags: 0,
		cltv_expiry_delta: 144,
		htlc_minimum_msat: 0,
		htlc_maximum_msat: None,
		fees: RoutingFees { base_msat: fee_base_msat, proportional_millionths: 0 },
	}
}
