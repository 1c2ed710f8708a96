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

use crate::{prelude::*, utils::relay::Switch};
use bytes::Bytes;
use futures::Future;
use parking_lot::Mutex;
use std::{
	collections::HashMap,
	sync::atomic::{AtomicBool, Ordering},
	time::{Duration, Instant},
};
use tokio::sync::mpsc;

const CLAIMED: bool = true;
const NOT_CLAIMED: bool = !CLAIMED;

const STOPPED: bool = true;
const NOT_STOPPED: bool = !STOPPED;

/// Interval between checking timeout status.
const TIMEOUT_GUARD_INTERVAL: Duration = Duration::from_millis(1000);

/// Pending datagrams a session will hold before dropping new ones.
pub(super) const SESSION_QUEUE_SIZE: usize = 100;

/// Per peer state of one UDP flow.
///
/// A session queues datagrams waiting to be forwarded and records which
/// task, if any, is forwarding them. The claim flag is the only
/// serialization point; whoever wins [`try_claim`](Session::try_claim)
/// owns the queue's receiving end and must be the only worker for this
/// peer.
pub(super) struct Session {
	peer: SocketAddr,
	sender: mpsc::Sender<Bytes>,
	receiver: Mutex<Option<mpsc::Receiver<Bytes>>>,
	handled: Switch,
	last_active: Mutex<Instant>,
}

impl Session {
	pub fn new(peer: SocketAddr) -> Arc<Self> {
		let (sender, receiver) = mpsc::channel(SESSION_QUEUE_SIZE);
		Arc::new(Self {
			peer,
			sender,
			receiver: Mutex::new(Some(receiver)),
			handled: Switch::new(NOT_CLAIMED),
			last_active: Mutex::new(Instant::now()),
		})
	}

	#[inline]
	pub fn peer(&self) -> SocketAddr {
		self.peer
	}

	/// Offer a datagram to the session queue without blocking.
	///
	/// Returns `false` if the datagram was dropped because the queue is
	/// full or the receiving end is gone.
	pub fn try_push(&self, data: Bytes) -> bool {
		self.touch();
		match self.sender.try_send(data) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				debug!(
					"queue of UDP session for peer {} is full, dropping datagram",
					self.peer
				);
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}

	/// Atomically claim the session for a forwarding worker.
	///
	/// Only the first caller gets the queue's receiving end; every later
	/// call returns `None` and must leave the queued datagrams to the
	/// worker that won.
	pub fn try_claim(&self) -> Option<mpsc::Receiver<Bytes>> {
		if self.handled.fetch_and_set(CLAIMED) == CLAIMED {
			return None;
		}
		self.receiver.lock().take()
	}

	pub fn touch(&self) {
		*self.last_active.lock() = Instant::now();
	}

	fn is_inactive(&self, now: Instant, max_elapsed: Duration) -> bool {
		now.saturating_duration_since(*self.last_active.lock()) > max_elapsed
	}
}

/// A map that stores the session of every active peer address.
///
/// Two concurrent lookups for one address always yield the same session.
pub(super) struct SessionMap {
	sessions: Arc<Mutex<HashMap<SocketAddr, Arc<Session>>>>,
	stopped: Arc<AtomicBool>,
}

impl Drop for SessionMap {
	fn drop(&mut self) {
		// Start gracefully shutdown
		self.stopped.store(STOPPED, Ordering::Relaxed);
	}
}

impl SessionMap {
	/// Creates the map along with its guard task.
	///
	/// The guard task must be polled; it evicts sessions that have been
	/// inactive for longer than `idle_timeout` and cleans the map up
	/// once it is dropped.
	pub fn new(idle_timeout: Duration) -> (Self, impl Future<Output = ()>) {
		let stopped = Arc::new(AtomicBool::new(NOT_STOPPED));
		let sessions = Arc::new(Mutex::new(HashMap::<SocketAddr, Arc<Session>>::new()));
		let guard_task = {
			let sessions = sessions.clone();
			let stopped = stopped.clone();
			let interval = TIMEOUT_GUARD_INTERVAL.min(idle_timeout);
			async move {
				loop {
					if stopped.load(Ordering::Relaxed) == STOPPED {
						break;
					}
					tokio::time::sleep(interval).await;
					let now = Instant::now();
					sessions.lock().retain(|peer, session| {
						let inactive = session.is_inactive(now, idle_timeout);
						if inactive {
							debug!("UDP session for peer {} is outdated, evicting", peer);
						}
						!inactive
					});
				}
				debug!("shutting down session map guard task, clearing all sessions");
				sessions.lock().clear();
			}
		};
		(Self { sessions, stopped }, guard_task)
	}

	/// Look up the session for `peer`, creating it on first sight.
	pub fn get_or_create(&self, peer: SocketAddr) -> Arc<Session> {
		self.sessions
			.lock()
			.entry(peer)
			.or_insert_with(|| Session::new(peer))
			.clone()
	}

	/// Remove `session` from the map.
	///
	/// A newer session registered for the same peer is left untouched.
	pub fn remove(&self, session: &Arc<Session>) {
		let mut sessions = self.sessions.lock();
		if let Some(current) = sessions.get(&session.peer()) {
			if Arc::ptr_eq(current, session) {
				sessions.remove(&session.peer());
				trace!(
					"removed UDP session for peer {}, remaining: {}",
					session.peer(),
					sessions.len()
				);
			}
		}
	}

	#[allow(dead_code)]
	pub fn len(&self) -> usize {
		self.sessions.lock().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	fn peer_addr() -> SocketAddr {
		"127.0.0.1:4000".parse().unwrap()
	}

	#[test]
	fn queue_drops_newest_when_full() {
		let session = Session::new(peer_addr());
		let mut accepted = 0;
		for i in 0..=SESSION_QUEUE_SIZE {
			if session.try_push(Bytes::copy_from_slice(&(i as u64).to_be_bytes())) {
				accepted += 1;
			}
		}
		assert_eq!(accepted, SESSION_QUEUE_SIZE);

		// The 101st datagram must be the one that was dropped.
		let mut receiver = session.try_claim().unwrap();
		let mut drained = Vec::new();
		while let Ok(data) = receiver.try_recv() {
			drained.push(data);
		}
		assert_eq!(drained.len(), SESSION_QUEUE_SIZE);
		assert_eq!(
			drained.last().unwrap().as_ref(),
			&((SESSION_QUEUE_SIZE - 1) as u64).to_be_bytes()
		);
	}

	#[test]
	fn only_one_claim_wins() {
		const TASKS: usize = 8;
		const ROUNDS: usize = 200;

		for _ in 0..ROUNDS {
			let session = Session::new(peer_addr());
			let claims = Arc::new(AtomicUsize::new(0));
			let handles: Vec<_> = (0..TASKS)
				.map(|_| {
					let session = session.clone();
					let claims = claims.clone();
					std::thread::spawn(move || {
						if session.try_claim().is_some() {
							claims.fetch_add(1, Ordering::SeqCst);
						}
					})
				})
				.collect();
			for handle in handles {
				handle.join().unwrap();
			}
			assert_eq!(claims.load(Ordering::SeqCst), 1);
		}
	}

	#[test]
	fn map_creates_one_session_per_peer() {
		const TASKS: usize = 8;

		let (map, _guard) = SessionMap::new(Duration::from_secs(1));
		let map = Arc::new(map);
		let first = map.get_or_create(peer_addr());
		let handles: Vec<_> = (0..TASKS)
			.map(|_| {
				let map = map.clone();
				std::thread::spawn(move || map.get_or_create(peer_addr()))
			})
			.collect();
		for handle in handles {
			assert!(Arc::ptr_eq(&first, &handle.join().unwrap()));
		}
		assert_eq!(map.len(), 1);
	}

	#[test]
	fn guard_evicts_idle_sessions() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			let (map, guard_task) = SessionMap::new(Duration::from_millis(50));
			tokio::spawn(guard_task);
			let session = map.get_or_create(peer_addr());
			assert_eq!(map.len(), 1);

			tokio::time::sleep(Duration::from_millis(200)).await;
			assert_eq!(map.len(), 0);

			// Refreshed sessions stay.
			drop(session);
			let session = map.get_or_create(peer_addr());
			for _ in 0..4 {
				tokio::time::sleep(Duration::from_millis(30)).await;
				session.touch();
			}
			assert_eq!(map.len(), 1);
		});
	}
}
