// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The windowed channel-table sync with a peer.
//!
//! We send one `query_channel_range` covering the whole chain, and for every
//! `reply_channel_range` work out which of the peer's short channel ids we want gossip for. The
//! wanted ids are split into fixed-size windows of `query_short_channel_ids` follow-ups, of
//! which exactly one is in flight per peer: each `reply_short_channel_ids_end` releases the
//! next. The per-peer [`Syncing`] record tracks the queue and feeds the progress metric.

use crate::graph::ChannelUpdateInfo;
use crate::msgs::{
	NodeId, QueryShortChannelIds, ReplyChannelRange,
	SCID_QUERY_FLAG_ANNOUNCEMENT, SCID_QUERY_FLAG_UPDATE_1, SCID_QUERY_FLAG_UPDATE_2,
};
use crate::router::{is_almost_stale_timestamp, is_stale_timestamp};
use crate::util::checksum::adler32;
use crate::util::ser::{VecWriter, Writeable};

use bitcoin::hash_types::BlockHash;

use std::cmp;
use std::collections::{HashMap, VecDeque};

/// How many short channel ids each follow-up query asks about. Small enough that a peer's reply
/// burst stays bounded, which is what keeps the dialogue windowed.
pub const SHORTID_WINDOW: usize = 100;

/// Hard upper bound on ids per query chunk, whatever window the caller asks for, so a chunk
/// always fits a wire message.
pub(crate) const MAX_SHORTIDS_PER_CHUNK: usize = 2000;

/// Which flavor of channel range query we open a sync with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelQueryMode {
	/// Ids only; we request everything we don't already have.
	Plain,
	/// Ids with update timestamps; additionally refetch channels the peer has fresher updates
	/// for. Kept for peers that predate checksums.
	WithTimestamps,
	/// Ids with timestamps and checksums; refetch only when content actually differs or ours is
	/// about to go stale.
	WithChecksums,
}

/// Sync state for one peer: the follow-up queries not yet sent, and the total number of queries
/// this sync fanned out to (for progress reporting). One query per peer is in flight at any
/// time and is counted by `total` but not by `pending`.
#[derive(Clone, Debug)]
pub struct Syncing {
	/// Follow-up queries awaiting their turn
	pub pending: VecDeque<QueryShortChannelIds>,
	/// Total queries fanned out for this peer's sync
	pub total: usize,
}

/// Splits ids into chunks of at most `chunk_size` entries (itself capped at
/// [`MAX_SHORTIDS_PER_CHUNK`]). The empty slice yields no chunks.
pub(crate) fn split<T: Clone>(ids: &[T], chunk_size: usize) -> Vec<Vec<T>> {
	let chunk_size = cmp::max(1, cmp::min(chunk_size, MAX_SHORTIDS_PER_CHUNK));
	ids.chunks(chunk_size).map(|chunk| chunk.to_vec()).collect()
}

/// The checksum peers compare channel updates by: Adler-32 over the canonically encoded routing
/// content, leaving out the signature, the chain hash and the timestamp so that re-signed or
/// merely re-timestamped updates compare equal.
pub(crate) fn update_checksum(short_channel_id: u64, update: &ChannelUpdateInfo) -> u32 {
	let mut encoded = VecWriter(Vec::new());
	short_channel_id.write(&mut encoded).unwrap();
	let message_flags = if update.htlc_maximum_msat.is_some() {
		update.message_flags | 1
	} else {
		update.message_flags & !1
	};
	message_flags.write(&mut encoded).unwrap();
	update.channel_flags.write(&mut encoded).unwrap();
	update.cltv_expiry_delta.write(&mut encoded).unwrap();
	update.htlc_minimum_msat.write(&mut encoded).unwrap();
	update.fees.base_msat.write(&mut encoded).unwrap();
	update.fees.proportional_millionths.write(&mut encoded).unwrap();
	update.htlc_maximum_msat.unwrap_or(0).write(&mut encoded).unwrap();
	adler32(&encoded.0)
}

/// Works out which of a range reply's ids we want gossip for, with the per-id query flags to ask
/// with. The reply's own extension records decide the rules applied: a peer that answered with
/// timestamps and checksums gets the checksum treatment whatever we originally asked for.
///
/// `local_info` returns our per-direction `((timestamp_1, timestamp_2), (checksum_1,
/// checksum_2))` for a channel, zeros standing in for missing updates.
pub(crate) fn shortids_to_request<C, L>(
	reply: &ReplyChannelRange, has_channel: C, local_info: L, now: u64,
) -> Vec<(u64, u8)>
where C: Fn(u64) -> bool, L: Fn(u64) -> ((u32, u32), (u32, u32)) {
	let ids = &reply.short_channel_ids;
	// Misaligned extension records are useless; fall back to the plain rules rather than guess
	// at the pairing.
	let timestamps = reply.timestamps.as_ref().filter(|t| t.len() == ids.len());
	let checksums = reply.checksums.as_ref().filter(|c| c.len() == ids.len());
	let all = SCID_QUERY_FLAG_ANNOUNCEMENT | SCID_QUERY_FLAG_UPDATE_1 | SCID_QUERY_FLAG_UPDATE_2;

	let mut result = Vec::new();
	for (i, scid) in ids.iter().copied().enumerate() {
		match (timestamps, checksums) {
			(Some(theirs_ts), Some(theirs_cs)) => {
				if !has_channel(scid) {
					result.push((scid, all));
					continue;
				}
				let ((ours_ts_1, ours_ts_2), (ours_cs_1, ours_cs_2)) = local_info(scid);
				let mut flag = 0u8;
				if theirs_ts[i].timestamp_1 > ours_ts_1
					&& !is_stale_timestamp(theirs_ts[i].timestamp_1, now)
					&& (theirs_cs[i].checksum_1 != ours_cs_1 || is_almost_stale_timestamp(ours_ts_1, now)) {
					flag |= SCID_QUERY_FLAG_UPDATE_1;
				}
				if theirs_ts[i].timestamp_2 > ours_ts_2
					&& !is_stale_timestamp(theirs_ts[i].timestamp_2, now)
					&& (theirs_cs[i].checksum_2 != ours_cs_2 || is_almost_stale_timestamp(ours_ts_2, now)) {
					flag |= SCID_QUERY_FLAG_UPDATE_2;
				}
				if flag != 0 {
					result.push((scid, flag));
				}
			},
			(Some(theirs_ts), None) => {
				if !has_channel(scid) {
					result.push((scid, all));
					continue;
				}
				let ((ours_ts_1, ours_ts_2), _) = local_info(scid);
				let ours = cmp::max(ours_ts_1, ours_ts_2);
				let theirs = cmp::max(theirs_ts[i].timestamp_1, theirs_ts[i].timestamp_2);
				if theirs > ours {
					result.push((scid, SCID_QUERY_FLAG_UPDATE_1 | SCID_QUERY_FLAG_UPDATE_2));
				}
			},
			_ => {
				if !has_channel(scid) {
					result.push((scid, all));
				}
			},
		}
	}
	result
}

/// Packages wanted ids into windowed follow-up queries. Per-id flags are only put on the wire
/// for a checksum-flavored dialogue; the other flavors always mean "everything you have".
pub(crate) fn build_queries(
	chain_hash: BlockHash, ids_flags: &[(u64, u8)], with_flags: bool,
) -> Vec<QueryShortChannelIds> {
	split(ids_flags, SHORTID_WINDOW).into_iter().map(|window| {
		QueryShortChannelIds {
			chain_hash,
			short_channel_ids: window.iter().map(|(scid, _)| *scid).collect(),
			query_flags: if with_flags {
				Some(window.iter().map(|(_, flag)| *flag).collect())
			} else {
				None
			},
		}
	}).collect()
}

/// The aggregate progress of all ongoing syncs: the fraction of fanned-out queries already
/// answered, counting each peer's in-flight query as outstanding. Exactly 1.0 when no peer is
/// syncing.
pub(crate) fn sync_progress(sync: &HashMap<NodeId, Syncing>) -> f64 {
	let (outstanding, total) = sync.values().fold((0usize, 0usize), |(outstanding, total), s| {
		(outstanding + s.pending.len() + 1, total + s.total)
	});
	if total == 0 {
		1.0
	} else {
		total.saturating_sub(outstanding) as f64 / total as f64
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::msgs::{RoutingFees, UpdateChecksums, UpdateTimestamps};
	use crate::router::STALE_CHANNEL_UPDATE_AGE_SECS;

	use bitcoin::blockdata::constants::genesis_block;
	use bitcoin::network::constants::Network;

	fn update_info(timestamp: u32, fee_base_msat: u32) -> ChannelUpdateInfo {
		ChannelUpdateInfo {
			timestamp,
			message_flags: 0,
			channel_flags: 0,
			cltv_expiry_delta: 144,
			htlc_minimum_msat: 1000,
			htlc_maximum_msat: None,
			fees: RoutingFees { base_msat: fee_base_msat, proportional_millionths: 100 },
		}
	}

	fn reply(ids: Vec<u64>, timestamps: Option<Vec<UpdateTimestamps>>, checksums: Option<Vec<UpdateChecksums>>) -> ReplyChannelRange {
		ReplyChannelRange {
			chain_hash: genesis_block(Network::Testnet).header.block_hash(),
			first_blocknum: 0,
			number_of_blocks: u32::max_value(),
			sync_complete: true,
			short_channel_ids: ids,
			timestamps,
			checksums,
		}
	}

	#[test]
	fn split_boundaries() {
		let empty: Vec<u64> = Vec::new();
		assert_eq!(split(&empty, 100).len(), 0);

		let ids: Vec<u64> = (0..250).collect();
		let chunks = split(&ids, 100);
		assert_eq!(chunks.len(), 3);
		assert_eq!(chunks[0].len(), 100);
		assert_eq!(chunks[1].len(), 100);
		assert_eq!(chunks[2].len(), 50);

		// Callers can't exceed the hard cap however large a window they ask for
		let ids: Vec<u64> = (0..5000).collect();
		for chunk in split(&ids, 1_000_000) {
			assert!(chunk.len() <= 2000);
		}
	}

	#[test]
	fn checksum_ignores_timestamp_and_tracks_content() {
		let a = update_info(100, 10);
		let mut later = a.clone();
		later.timestamp = 5000;
		assert_eq!(update_checksum(42, &a), update_checksum(42, &later));

		let mut different_fee = a.clone();
		different_fee.fees.base_msat = 11;
		assert_ne!(update_checksum(42, &a), update_checksum(42, &different_fee));

		assert_ne!(update_checksum(42, &a), update_checksum(43, &a));
	}

	#[test]
	fn plain_reply_requests_unknown_ids() {
		let r = reply(vec![1, 2, 3], None, None);
		let wanted = shortids_to_request(&r, |scid| scid == 2, |_| ((0, 0), (0, 0)), 10_000_000);
		let ids: Vec<u64> = wanted.iter().map(|(id, _)| *id).collect();
		assert_eq!(ids, vec![1, 3]);
	}

	#[test]
	fn timestamped_reply_requests_fresher_ids() {
		let now = 10_000_000u64;
		let r = reply(vec![1, 2, 3], Some(vec![
			UpdateTimestamps { timestamp_1: 500, timestamp_2: 0 },
			UpdateTimestamps { timestamp_1: 100, timestamp_2: 90 },
			UpdateTimestamps { timestamp_1: 0, timestamp_2: 0 },
		]), None);
		// We know all three; only id 1 has a fresher update on their side
		let wanted = shortids_to_request(&r, |_| true, |scid| {
			match scid {
				1 => ((400, 0), (0, 0)),
				2 => ((100, 90), (0, 0)),
				3 => ((50, 0), (0, 0)),
				_ => unreachable!(),
			}
		}, now);
		let ids: Vec<u64> = wanted.iter().map(|(id, _)| *id).collect();
		assert_eq!(ids, vec![1]);
	}

	#[test]
	fn checksummed_reply_requests_by_flag() {
		let now = 100_000_000u64;
		let fresh = (now - 100) as u32;
		let stale = (now - STALE_CHANNEL_UPDATE_AGE_SECS - 1) as u32;
		let ours = update_info(fresh - 50, 10);
		let ours_cs = update_checksum(1, &ours);

		let r = reply(vec![1, 2, 3, 4], Some(vec![
			// fresher timestamp but identical checksum: not requested (ours is not almost stale)
			UpdateTimestamps { timestamp_1: fresh, timestamp_2: 0 },
			// fresher timestamp, different checksum: requested
			UpdateTimestamps { timestamp_1: fresh, timestamp_2: 0 },
			// fresher but itself stale on their side: not requested
			UpdateTimestamps { timestamp_1: stale, timestamp_2: 0 },
			// unknown channel: announcement and both updates
			UpdateTimestamps { timestamp_1: fresh, timestamp_2: fresh },
		]), Some(vec![
			UpdateChecksums { checksum_1: ours_cs, checksum_2: 0 },
			UpdateChecksums { checksum_1: ours_cs ^ 1, checksum_2: 0 },
			UpdateChecksums { checksum_1: ours_cs ^ 1, checksum_2: 0 },
			UpdateChecksums { checksum_1: 1, checksum_2: 2 },
		]));
		let wanted = shortids_to_request(&r, |scid| scid != 4, |_| {
			((ours.timestamp, 0), (ours_cs, 0))
		}, now);
		assert_eq!(wanted, vec![
			(2, SCID_QUERY_FLAG_UPDATE_1),
			(4, SCID_QUERY_FLAG_ANNOUNCEMENT | SCID_QUERY_FLAG_UPDATE_1 | SCID_QUERY_FLAG_UPDATE_2),
		]);
	}

	#[test]
	fn almost_stale_forces_refresh_despite_matching_checksum() {
		let now = 100_000_000u64;
		let fresh = (now - 100) as u32;
		// Our update is 11 days old: within the almost-stale window
		let ours = update_info((now - 11 * 24 * 3600) as u32, 10);
		let ours_cs = update_checksum(1, &ours);
		let r = reply(vec![1], Some(vec![
			UpdateTimestamps { timestamp_1: fresh, timestamp_2: 0 },
		]), Some(vec![
			UpdateChecksums { checksum_1: ours_cs, checksum_2: 0 },
		]));
		let wanted = shortids_to_request(&r, |_| true, |_| ((ours.timestamp, 0), (ours_cs, 0)), now);
		assert_eq!(wanted, vec![(1, SCID_QUERY_FLAG_UPDATE_1)]);
	}

	#[test]
	fn misaligned_records_fall_back_to_plain() {
		let r = reply(vec![1, 2], Some(vec![
			UpdateTimestamps { timestamp_1: 100, timestamp_2: 100 },
		]), None);
		let wanted = shortids_to_request(&r, |scid| scid == 1, |_| ((0, 0), (0, 0)), 10_000_000);
		let ids: Vec<u64> = wanted.iter().map(|(id, _)| *id).collect();
		assert_eq!(ids, vec![2]);
	}

	#[test]
	fn queries_are_windowed() {
		let chain_hash = genesis_block(Network::Testnet).header.block_hash();
		let ids_flags: Vec<(u64, u8)> = (0..250).map(|id| (id, SCID_QUERY_FLAG_UPDATE_1)).collect();
		let queries = build_queries(chain_hash, &ids_flags, true);
		assert_eq!(queries.len(), 3);
		assert_eq!(queries[0].short_channel_ids.len(), 100);
		assert_eq!(queries[1].short_channel_ids.len(), 100);
		assert_eq!(queries[2].short_channel_ids.len(), 50);
		assert_eq!(queries[0].query_flags.as_ref().unwrap().len(), 100);

		let queries = build_queries(chain_hash, &ids_flags, false);
		assert!(queries[0].query_flags.is_none());
	}

	#[test]
	fn progress_counts_in_flight_queries() {
		let mut sync = HashMap::new();
		assert_eq!(sync_progress(&sync), 1.0);

		let chain_hash = genesis_block(Network::Testnet).header.block_hash();
		let query = QueryShortChannelIds { chain_hash, short_channel_ids: vec![1], query_flags: None };
		sync.insert(NodeId::from_slice(&[2; 33]).unwrap(), Syncing {
			pending: vec![query.clone(), query.clone()].into(),
			total: 3,
		});
		assert_eq!(sync_progress(&sync), 0.0);

		sync.insert(NodeId::from_slice(&[3; 33]).unwrap(), Syncing {
			pending: VecDeque::new(),
			total: 2,
		});
		// 5 queries overall, 3 in flight or pending for the first peer, 1 in flight for the second
		assert_eq!(sync_progress(&sync), 0.2);
	}
}
