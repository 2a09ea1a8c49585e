// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Configuration knobs for the router. Everything has a sane default so hosts only override what
//! they care about.

use std::time::Duration;

use crate::sync::ChannelQueryMode;

/// Top-level router configuration.
#[derive(Clone, Copy, Debug)]
pub struct RouterConfig {
	/// How long a channel direction stays excluded from route computation after a transient
	/// payment failure, before a lift event restores it.
	///
	/// Default value: 60 seconds.
	pub channel_exclude_duration: Duration,
	/// How often the stale-channel pruner runs.
	///
	/// Default value: 1 hour.
	pub prune_interval: Duration,
	/// Which flavor of `query_channel_range` we send when (re)starting a sync with a peer. Peers
	/// that don't understand the extension fields simply reply with the plain variant.
	///
	/// Default value: [`ChannelQueryMode::WithChecksums`].
	pub channel_query_mode: ChannelQueryMode,
	/// Whether route requests pick uniformly at random among the returned paths whose cost is
	/// within the allowed spread of the cheapest one, rather than always taking the cheapest.
	/// Randomization improves privacy and spreads load across the graph.
	///
	/// Default value: true.
	pub randomize_route_selection: bool,
}

impl Default for RouterConfig {
	fn default() -> Self {
		RouterConfig {
			channel_exclude_duration: Duration::from_secs(60),
			prune_interval: Duration::from_secs(60 * 60),
			channel_query_mode: ChannelQueryMode::WithChecksums,
			randomize_route_selection: true,
		}
	}
}
