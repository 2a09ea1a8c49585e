// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Runs a [`Router`] as a long-lived Tokio task consuming an unbounded event queue, which is
//! what gives every handler exclusive access to the state without locks. Peer actors, the chain
//! watcher and payment logic all talk to the task through a cheaply clonable [`RouterHandle`].
//!
//! Two small helper tasks provide the router's sense of time: an hourly prune tick, and one
//! deferred lift per channel exclusion.

use crate::graph::ChannelInfo;
use crate::msgs::NodeAnnouncement;
use crate::router::{DataSnapshot, RouteRequest, RouteResponse, Router, RouterError, RouterEvent};
use crate::storage::NetworkDb;
use crate::util::logger::Logger;

use tokio::sync::{mpsc, oneshot};

use std::ops::Deref;

/// A handle to a running router task. Cloning is cheap; all clones feed the same router.
#[derive(Clone)]
pub struct RouterHandle {
	tx: mpsc::UnboundedSender<RouterEvent>,
}

impl RouterHandle {
	/// Enqueues an event. Returns false if the router task is gone.
	pub fn send(&self, event: RouterEvent) -> bool {
		self.tx.send(event).is_ok()
	}

	/// Computes a route and awaits the result.
	pub async fn find_route(&self, request: RouteRequest) -> Result<RouteResponse, RouterError> {
		let (responder, receiver) = oneshot::channel();
		if self.tx.send(RouterEvent::FindRoute { request, responder }).is_err() {
			return Err(RouterError::RouteNotFound);
		}
		receiver.await.unwrap_or(Err(RouterError::RouteNotFound))
	}

	/// Snapshots the channel table. Empty if the router task is gone.
	pub async fn channels(&self) -> Vec<ChannelInfo> {
		let (responder, receiver) = oneshot::channel();
		if self.tx.send(RouterEvent::GetChannels { responder }).is_err() {
			return Vec::new();
		}
		receiver.await.unwrap_or_default()
	}

	/// Snapshots the node table. Empty if the router task is gone.
	pub async fn nodes(&self) -> Vec<NodeAnnouncement> {
		let (responder, receiver) = oneshot::channel();
		if self.tx.send(RouterEvent::GetNodes { responder }).is_err() {
			return Vec::new();
		}
		receiver.await.unwrap_or_default()
	}

	/// Snapshots all router tables. None if the router task is gone.
	pub async fn data(&self) -> Option<DataSnapshot> {
		let (responder, receiver) = oneshot::channel();
		if self.tx.send(RouterEvent::GetData { responder }).is_err() {
			return None;
		}
		receiver.await.ok()
	}
}

/// Spawns the router's event loop and its timer tasks, returning the handle to feed it with.
/// The tasks live for the rest of the process, as the router does in a running node.
pub fn start<D, L>(mut router: Router<D, L>) -> RouterHandle
where
	D: Deref + Send + 'static, D::Target: NetworkDb,
	L: Deref + Send + 'static, L::Target: Logger,
{
	let (tx, mut rx) = mpsc::unbounded_channel();
	let prune_interval = router.config().prune_interval;
	let exclude_duration = router.config().channel_exclude_duration;

	let tick_tx = tx.clone();
	tokio::spawn(async move {
		loop {
			tokio::time::sleep(prune_interval).await;
			if tick_tx.send(RouterEvent::TickPruneStaleChannels).is_err() {
				break;
			}
		}
	});

	let timer_tx = tx.clone();
	tokio::spawn(async move {
		while let Some(event) = rx.recv().await {
			if let RouterEvent::ExcludeChannel(desc) = &event {
				let desc = *desc;
				let lift_tx = timer_tx.clone();
				tokio::spawn(async move {
					tokio::time::sleep(exclude_duration).await;
					let _ = lift_tx.send(RouterEvent::LiftChannelExclusion(desc));
				});
			}
			router.handle_event(event);
		}
	});

	RouterHandle { tx }
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::graph::ChannelDesc;
	use crate::msgs::NodeId;
	use crate::util::config::RouterConfig;
	use crate::util::test_utils::{get_signed_channel_update, MemoryNetworkDb, TestLogger};

	use bitcoin::network::constants::Network;
	use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

	use std::sync::Arc;
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	#[tokio::test]
	async fn routes_flow_through_the_handle() {
		let secp_ctx = Secp256k1::new();
		let our_key = SecretKey::from_slice(&[99; 32]).unwrap();
		let our_node = NodeId::from_pubkey(&PublicKey::from_secret_key(&secp_ctx, &our_key));
		let remote_key = SecretKey::from_slice(&[42; 32]).unwrap();
		let remote_node = NodeId::from_pubkey(&PublicKey::from_secret_key(&secp_ctx, &remote_key));
		let mut conf = RouterConfig::default();
		conf.channel_exclude_duration = Duration::from_millis(50);
		conf.randomize_route_selection = false;
		let router = Router::new(Network::Testnet, our_node, conf,
			Arc::new(MemoryNetworkDb::new()), Arc::new(TestLogger::new()));
		let handle = start(router);

		// Bring up a local channel so there is something to route over
		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
		let node_1 = if our_node < remote_node { our_node } else { remote_node };
		let update = get_signed_channel_update(|unsigned| {
			unsigned.short_channel_id = 42;
			unsigned.timestamp = (now - 10) as u32;
			unsigned.channel_flags = if our_node == node_1 { 0 } else { 1 };
		}, &our_key, &secp_ctx);
		assert!(handle.send(RouterEvent::LocalChannelUpdate {
			short_channel_id: 42,
			remote_node_id: remote_node,
			update,
		}));

		let response = handle.find_route(RouteRequest::new(our_node, remote_node, 10_000)).await.unwrap();
		assert_eq!(response.hops.len(), 1);
		assert_eq!(response.hops[0].node_id, our_node);
		assert_eq!(response.hops[0].next_node_id, remote_node);

		// Routing to an unknown node fails cleanly
		let unknown = NodeId::from_slice(&[7; 33]).unwrap();
		assert_eq!(handle.find_route(RouteRequest::new(our_node, unknown, 10_000)).await,
			Err(RouterError::RouteNotFound));

		assert!(handle.channels().await.is_empty());
		assert!(handle.nodes().await.is_empty());
		let data = handle.data().await.unwrap();
		assert_eq!(data.private_channels.len(), 1);
	}

	#[tokio::test]
	async fn exclusions_are_lifted_after_the_ban() {
		let secp_ctx = Secp256k1::new();
		let our_key = SecretKey::from_slice(&[99; 32]).unwrap();
		let our_node = NodeId::from_pubkey(&PublicKey::from_secret_key(&secp_ctx, &our_key));
		let remote_key = SecretKey::from_slice(&[42; 32]).unwrap();
		let remote_node = NodeId::from_pubkey(&PublicKey::from_secret_key(&secp_ctx, &remote_key));
		let mut conf = RouterConfig::default();
		conf.channel_exclude_duration = Duration::from_millis(50);
		conf.randomize_route_selection = false;
		let router = Router::new(Network::Testnet, our_node, conf,
			Arc::new(MemoryNetworkDb::new()), Arc::new(TestLogger::new()));
		let handle = start(router);

		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
		let node_1 = if our_node < remote_node { our_node } else { remote_node };
		let update = get_signed_channel_update(|unsigned| {
			unsigned.short_channel_id = 42;
			unsigned.timestamp = (now - 10) as u32;
			unsigned.channel_flags = if our_node == node_1 { 0 } else { 1 };
		}, &our_key, &secp_ctx);
		handle.send(RouterEvent::LocalChannelUpdate {
			short_channel_id: 42,
			remote_node_id: remote_node,
			update,
		});
		let request = RouteRequest::new(our_node, remote_node, 10_000);
		assert!(handle.find_route(request.clone()).await.is_ok());

		let desc = ChannelDesc { short_channel_id: 42, a: our_node, b: remote_node };
		handle.send(RouterEvent::ExcludeChannel(desc));
		assert_eq!(handle.find_route(request.clone()).await, Err(RouterError::RouteNotFound));
		assert_eq!(handle.data().await.unwrap().excluded_channels.len(), 1);

		// After the ban duration the scheduled lift restores the channel
		tokio::time::sleep(Duration::from_millis(150)).await;
		assert!(handle.find_route(request).await.is_ok());
		assert!(handle.data().await.unwrap().excluded_channels.is_empty());
	}
}
