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

//! Bookkeeping for proxy user accounts.
//!
//! The data plane never looks at users; this module only mirrors the
//! per user traffic counters a third party proxy engine reports into
//! the same byte counting sink the relays use. The engine transport
//! itself stays behind [`TrafficSource`].

use crate::{
	prelude::*,
	server::stat::{Network, TrafficMonitor},
	utils::BytesCount,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::{collections::HashMap, io, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("user not found (id {0})")]
	NotFound(u32),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct User {
	#[serde(rename = "user_id")]
	pub id: u32,
	pub method: Tag,
	pub password: String,
	pub level: u32,
	pub enable: bool,
	pub upload_traffic: u64,
	pub download_traffic: u64,
}

impl User {
	#[inline]
	#[must_use]
	pub fn total_traffic(&self) -> u64 {
		self.upload_traffic + self.download_traffic
	}

	pub fn reset_traffic(&mut self) {
		self.upload_traffic = 0;
		self.download_traffic = 0;
	}
}

/// Traffic used by one user since the engine counters were last reset.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrafficStat {
	pub user_id: u32,
	pub upload: u64,
	pub download: u64,
}

/// Where per user traffic counters come from.
///
/// Implemented outside this crate by whatever speaks the proxy engine's
/// RPC protocol. `reset` asks the engine to zero its counters so the
/// next query returns a delta.
#[async_trait]
pub trait TrafficSource {
	async fn query_traffic(&self, reset: bool) -> io::Result<Vec<TrafficStat>>;
}

/// Thread safe store of proxy user accounts.
#[derive(Default)]
pub struct UserPool {
	users: RwLock<HashMap<u32, User>>,
}

impl UserPool {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Add a new user, replacing any previous user with the same id.
	pub fn create_user(
		&self,
		id: u32,
		method: Tag,
		password: String,
		level: u32,
		enable: bool,
	) -> User {
		let user = User {
			id,
			method,
			password,
			level,
			enable,
			upload_traffic: 0,
			download_traffic: 0,
		};
		self.users.write().insert(id, user.clone());
		user
	}

	/// Look a user up by id.
	///
	/// # Errors
	///
	/// Returns [`Error::NotFound`] for an unknown id.
	pub fn get_user(&self, id: u32) -> Result<User, Error> {
		self.users.read().get(&id).cloned().ok_or(Error::NotFound(id))
	}

	pub fn remove_user(&self, id: u32) {
		self.users.write().remove(&id);
	}

	#[must_use]
	pub fn all_users(&self) -> Vec<User> {
		self.users.read().values().cloned().collect()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.users.read().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.users.read().is_empty()
	}

	/// Record the engine reported counters on the user.
	///
	/// # Errors
	///
	/// Returns [`Error::NotFound`] for an unknown id.
	pub fn set_traffic(&self, id: u32, upload: u64, download: u64) -> Result<(), Error> {
		let mut users = self.users.write();
		let user = users.get_mut(&id).ok_or(Error::NotFound(id))?;
		user.upload_traffic = upload;
		user.download_traffic = download;
		Ok(())
	}

	fn reset_traffic(&self, id: u32) {
		if let Some(user) = self.users.write().get_mut(&id) {
			user.reset_traffic();
		}
	}
}

/// Pull the latest per user counters from `source` once and fold them
/// into `pool` and `monitor`.
///
/// Returns the number of users that used any traffic since the last
/// sync. Unknown user ids are logged and skipped, they are not a
/// failure of the sync itself.
///
/// # Errors
///
/// Returns an error only if querying `source` fails.
pub async fn sync_traffic_once<S>(
	pool: &UserPool,
	source: &S,
	monitor: &TrafficMonitor,
) -> io::Result<usize>
where
	S: TrafficSource + Sync,
{
	let stats = source.query_traffic(true).await?;
	for stat in &stats {
		if let Err(err) = pool.set_traffic(stat.user_id, stat.upload, stat.download) {
			warn!("cannot record traffic reported by engine: {}", err);
		}
	}

	let mut active = 0_usize;
	for user in pool.all_users() {
		let total = user.total_traffic();
		if total == 0 {
			continue;
		}
		info!(
			"user {} used {} since last sync",
			user.id,
			BytesCount(total)
		);
		monitor.add(&user_tag(user.id), Network::Tcp, total);
		pool.reset_traffic(user.id);
		active += 1;
	}
	debug!("traffic sync finished, {} active users", active);
	Ok(active)
}

/// Poll `source` forever on a fixed interval.
///
/// # Errors
///
/// Returns the first error produced by `source`.
pub async fn sync_traffic<S>(
	pool: &UserPool,
	source: &S,
	monitor: &TrafficMonitor,
	interval: Duration,
) -> io::Result<()>
where
	S: TrafficSource + Sync,
{
	loop {
		tokio::time::sleep(interval).await;
		sync_traffic_once(pool, source, monitor).await?;
	}
}

fn user_tag(id: u32) -> Tag {
	Tag::from(format!("user-{}", id))
}

#[cfg(test)]
mod tests {
	use super::*;
	use parking_lot::Mutex;

	#[test]
	fn pool_creates_and_looks_up_users() {
		let pool = UserPool::new();
		assert!(pool.is_empty());

		pool.create_user(7, Tag::from("aes-256-gcm"), "secret".into(), 0, true);
		let user = pool.get_user(7).unwrap();
		assert_eq!(user.password, "secret");
		assert_eq!(user.total_traffic(), 0);
		assert_eq!(pool.len(), 1);

		pool.remove_user(7);
		assert!(matches!(pool.get_user(7), Err(Error::NotFound(7))));
	}

	struct MockSource {
		responses: Mutex<Vec<Vec<TrafficStat>>>,
	}

	#[async_trait]
	impl TrafficSource for MockSource {
		async fn query_traffic(&self, _reset: bool) -> io::Result<Vec<TrafficStat>> {
			Ok(self.responses.lock().remove(0))
		}
	}

	#[test]
	fn sync_folds_traffic_into_pool_and_monitor() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			let pool = UserPool::new();
			pool.create_user(1, Tag::from("chacha20"), "a".into(), 0, true);
			pool.create_user(2, Tag::from("chacha20"), "b".into(), 0, true);
			let monitor = TrafficMonitor::new();
			let source = MockSource {
				responses: Mutex::new(vec![
					vec![
						TrafficStat {
							user_id: 1,
							upload: 100,
							download: 400,
						},
						// Unknown user must be skipped without failing.
						TrafficStat {
							user_id: 9,
							upload: 1,
							download: 1,
						},
					],
					vec![TrafficStat {
						user_id: 1,
						upload: 0,
						download: 50,
					}],
				]),
			};

			let active = sync_traffic_once(&pool, &source, &monitor).await.unwrap();
			assert_eq!(active, 1);
			assert_eq!(monitor.get("user-1", Network::Tcp), 500);
			// Counters were consumed by the sync.
			assert_eq!(pool.get_user(1).unwrap().total_traffic(), 0);

			let active = sync_traffic_once(&pool, &source, &monitor).await.unwrap();
			assert_eq!(active, 1);
			assert_eq!(monitor.get("user-1", Network::Tcp), 550);
			assert_eq!(monitor.get("user-2", Network::Tcp), 0);
		});
	}
}
