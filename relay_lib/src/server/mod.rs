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

mod builder;
mod error;
mod serve;
pub mod stat;
mod udp;

pub use builder::{BuildError, Builder, RuleBuilder};
pub use error::Error;

use crate::{prelude::*, utils::pool::BytePool};
use stat::TrafficMonitor;
use std::time::Duration;

/// What a relay rule listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleNetwork {
	Tcp,
	Udp,
	Both,
}

impl RuleNetwork {
	#[inline]
	#[must_use]
	pub fn uses_tcp(self) -> bool {
		matches!(self, RuleNetwork::Tcp | RuleNetwork::Both)
	}

	#[inline]
	#[must_use]
	pub fn uses_udp(self) -> bool {
		matches!(self, RuleNetwork::Udp | RuleNetwork::Both)
	}
}

impl Default for RuleNetwork {
	fn default() -> Self {
		RuleNetwork::Tcp
	}
}

/// One forwarding rule: every connection or datagram flow accepted on
/// `listen` is relayed to `remote`, with its traffic recorded under
/// `tag`.
#[derive(Debug, Clone)]
pub struct RelayRule {
	pub tag: Tag,
	pub listen: SocketAddr,
	pub remote: SocketAddr,
	pub network: RuleNetwork,
}

pub struct Server {
	pub rules: Vec<RelayRule>,
	pool: Arc<BytePool>,
	monitor: TrafficMonitor,
	idle_timeout: Duration,
}

impl Server {
	/// Start running the server.
	///
	/// # Errors
	///
	/// Returns an error if any listener failed to bind or its accept
	/// loop died. Per session errors are only logged.
	pub async fn serve(self: Arc<Self>) -> Result<(), BoxStdErr> {
		self.priv_serve().await
	}

	#[inline]
	#[must_use]
	pub fn monitor(&self) -> &TrafficMonitor {
		&self.monitor
	}

	#[inline]
	#[must_use]
	pub fn pool(&self) -> &Arc<BytePool> {
		&self.pool
	}

	#[inline]
	#[must_use]
	pub fn idle_timeout(&self) -> Duration {
		self.idle_timeout
	}
}
