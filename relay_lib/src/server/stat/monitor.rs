/**********************************************************************

Copyright (C) 2021 by reddal

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

**********************************************************************/

use super::Network;
use crate::{prelude::*, utils::relay::Counter};
use parking_lot::Mutex;
use std::collections::HashMap;

type ArcInternal = Arc<Mutex<Internal>>;

/// Accumulates transferred bytes per `(remote, network)` label.
///
/// The monitor is the single byte counting sink shared by the stream
/// relay, the UDP workers and the user traffic sync. Recording is best
/// effort and never blocks the data plane: the map lock is only held
/// long enough to look up a counter, the add itself is atomic.
#[derive(Clone)]
pub struct TrafficMonitor(ArcInternal);

impl TrafficMonitor {
	#[must_use]
	pub fn new() -> Self {
		Self(Arc::new(Mutex::new(Internal {
			flows: HashMap::new(),
		})))
	}

	/// Add `bytes` to the counter labeled `(remote, net)`, creating the
	/// counter on first use.
	pub fn add(&self, remote: &Tag, net: Network, bytes: u64) {
		let counter = {
			let mut internal = self.0.lock();
			internal
				.flows
				.entry((remote.clone(), net))
				.or_insert_with(|| Counter::new(0))
				.clone()
		};
		counter.add(bytes);
	}

	/// Current value of the counter labeled `(remote, net)`, zero if
	/// nothing was recorded for that label yet.
	#[must_use]
	pub fn get(&self, remote: &str, net: Network) -> u64 {
		self.0
			.lock()
			.flows
			.get(&(Tag::new(remote), net))
			.map_or(0, Counter::get)
	}

	/// Snapshot of every label, sorted by remote tag.
	#[must_use]
	pub fn snapshot(&self) -> Vec<FlowSnapshot> {
		let mut result: Vec<FlowSnapshot> = self
			.0
			.lock()
			.flows
			.iter()
			.map(|((remote, net), counter)| FlowSnapshot {
				remote: remote.clone(),
				network: *net,
				bytes: counter.get(),
			})
			.collect();
		result.sort_unstable_by(|a, b| {
			(a.remote.as_str(), a.network.as_str()).cmp(&(b.remote.as_str(), b.network.as_str()))
		});
		result
	}
}

impl Default for TrafficMonitor {
	fn default() -> Self {
		Self::new()
	}
}

struct Internal {
	flows: HashMap<(Tag, Network), Counter>,
}

#[derive(Debug, Clone)]
pub struct FlowSnapshot {
	pub remote: Tag,
	pub network: Network,
	pub bytes: u64,
}
