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

mod atomic_values;
mod copier;

pub use atomic_values::{Counter, Switch};

use crate::{
	prelude::*,
	server::stat::{Network, TrafficMonitor},
	utils::pool::BytePool,
};
use copier::CopyHalf;
use std::{io, time::Duration};
use tokio::time::sleep;

const STOPPED: bool = true;
const NOT_STOPPED: bool = !STOPPED;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Returns `true` if `err` only signals that the peer tore the
/// connection down, which is expected and must not surface as a failure.
#[must_use]
pub fn is_benign(err: &io::Error) -> bool {
	matches!(
		err.kind(),
		io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
	)
}

/// Moves bytes symmetrically between two connected duplex streams.
///
/// One direction runs on its own task and is never joined; the other
/// runs on the caller's context and decides the returned result. Bytes
/// copied by each direction are reported to the traffic monitor, doubled,
/// once per completed copy. The doubling attributes full round trip
/// traffic to each direction and callers must treat the metric as
/// already bidirectional.
pub struct Relay<'a> {
	pub conn_id: &'a str,
	pub pool: Arc<BytePool>,
	pub monitor: Option<TrafficMonitor>,
	pub remote_tag: Tag,
	pub idle_timeout: Duration,
}

impl<'a> Relay<'a> {
	#[inline]
	#[must_use]
	pub fn new(conn_id: &'a str, pool: Arc<BytePool>, remote_tag: Tag) -> Self {
		Self {
			conn_id,
			pool,
			monitor: None,
			remote_tag,
			idle_timeout: DEFAULT_IDLE_TIMEOUT,
		}
	}

	#[inline]
	pub fn set_monitor(&mut self, monitor: TrafficMonitor) -> &mut Self {
		self.monitor = Some(monitor);
		self
	}

	/// Set the idle timeout used as the read deadline of both copy
	/// directions and as the linger window before the relay returns.
	#[inline]
	pub fn set_idle_timeout(&mut self, idle_timeout: Duration) -> &mut Self {
		self.idle_timeout = idle_timeout;
		self
	}
}

impl Relay<'_> {
	/// Relay bytes between the local stream `(ir, iw)` and the remote
	/// stream `(or, ow)` until both directions stop or the idle deadline
	/// expires.
	///
	/// # Errors
	///
	/// Returns the error of the direction running on the caller's
	/// context, unless it is a benign teardown. Errors of the spawned
	/// direction are logged and discarded.
	pub async fn relay_stream<IR, IW, OR, OW>(
		&self,
		ir: IR,
		iw: IW,
		or: OR,
		ow: OW,
	) -> io::Result<()>
	where
		IR: AsyncRead + Unpin + Send + 'static,
		OR: AsyncRead + Unpin + Send + 'static,
		IW: AsyncWrite + Unpin + Send + 'static,
		OW: AsyncWrite + Unpin + Send + 'static,
	{
		let send_tag = Arc::<str>::from(format!("[{} send]", self.conn_id));
		let recv_tag = Arc::<str>::from(format!("[{} recv]", self.conn_id));

		let is_stopped = Switch::new(NOT_STOPPED);

		// Inbound <--- Outbound
		// Runs on its own task. Its result is only logged; the caller
		// never waits for it.
		let recv_half = CopyHalf {
			r: or,
			w: iw,
			pool: self.pool.clone(),
			tag: recv_tag.clone(),
			is_reading_stopped: is_stopped.clone(),
			idle_timeout: self.idle_timeout,
		};
		{
			let monitor = self.monitor.clone();
			let remote_tag = self.remote_tag.clone();
			tokio::spawn(async move {
				let (count, res) = recv_half.run().await;
				if let Some(monitor) = &monitor {
					monitor.add(&remote_tag, Network::Tcp, count * 2);
				}
				match res {
					Ok(()) => trace!("{} task finished, {} copied", recv_tag, count),
					Err(err) if is_benign(&err) => {
						debug!("{} task closed by peer ({})", recv_tag, err);
					}
					Err(err) => error!("{} task error ({})", recv_tag, err),
				}
			});
		}

		// Inbound ---> Outbound
		// Runs here; its result is the relay's result.
		let send_half = CopyHalf {
			r: ir,
			w: ow,
			pool: self.pool.clone(),
			tag: send_tag.clone(),
			is_reading_stopped: is_stopped,
			idle_timeout: self.idle_timeout,
		};
		let (count, res) = send_half.run().await;
		if let Some(monitor) = &self.monitor {
			monitor.add(&self.remote_tag, Network::Tcp, count * 2);
		}
		trace!("{} task finished, {} copied", send_tag, count);

		// One more idle window so the other task can drain any trailing
		// data before the caller drops the connections.
		sleep(self.idle_timeout).await;

		match res {
			Ok(()) => Ok(()),
			Err(err) if is_benign(&err) => {
				debug!("{} closed by peer ({})", send_tag, err);
				Ok(())
			}
			Err(err) => Err(err),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::{
		task::{Context, Poll},
		time::Instant,
	};
	use tokio::io::ReadBuf;

	const TEST_TIMEOUT: Duration = Duration::from_millis(100);

	/// A read half that fails with the given error kind on first poll.
	struct ErrReader(io::ErrorKind);

	impl AsyncRead for ErrReader {
		fn poll_read(
			self: Pin<&mut Self>,
			_cx: &mut Context<'_>,
			_buf: &mut ReadBuf<'_>,
		) -> Poll<io::Result<()>> {
			Poll::Ready(Err(self.0.into()))
		}
	}

	fn test_relay(pool: &Arc<BytePool>, monitor: &TrafficMonitor) -> Relay<'static> {
		let mut relay = Relay::new("test", pool.clone(), Tag::from("remote"));
		relay
			.set_monitor(monitor.clone())
			.set_idle_timeout(TEST_TIMEOUT);
		relay
	}

	#[test]
	fn relays_both_directions() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			let pool = Arc::new(BytePool::new(8, 1024));
			let monitor = TrafficMonitor::new();

			let in_data: Vec<u8> = (0..64_u32).map(|i| i as u8).collect();
			let out_data: Vec<u8> = (0..128_u32).map(|i| (i + 64) as u8).collect();

			let (local, relay_local) = tokio::io::duplex(1024);
			let (relay_remote, remote) = tokio::io::duplex(1024);
			let (ir, iw) = tokio::io::split(relay_local);
			let (or, ow) = tokio::io::split(relay_remote);

			let client = {
				let in_data = in_data.clone();
				tokio::spawn(async move {
					let (mut r, mut w) = tokio::io::split(local);
					w.write_all(&in_data).await.unwrap();
					w.shutdown().await.unwrap();
					let mut got = Vec::new();
					r.read_to_end(&mut got).await.unwrap();
					got
				})
			};
			let server = {
				let out_data = out_data.clone();
				tokio::spawn(async move {
					let (mut r, mut w) = tokio::io::split(remote);
					w.write_all(&out_data).await.unwrap();
					w.shutdown().await.unwrap();
					let mut got = Vec::new();
					r.read_to_end(&mut got).await.unwrap();
					got
				})
			};

			test_relay(&pool, &monitor)
				.relay_stream(ir, iw, or, ow)
				.await
				.unwrap();

			assert_eq!(client.await.unwrap(), out_data);
			assert_eq!(server.await.unwrap(), in_data);
			// Both directions report doubled byte counts under one label.
			let expected = (in_data.len() as u64 + out_data.len() as u64) * 2;
			assert_eq!(monitor.get("remote", Network::Tcp), expected);
		});
	}

	#[test]
	fn mutes_benign_errors() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			let pool = Arc::new(BytePool::new(4, 256));
			let monitor = TrafficMonitor::new();
			for kind in [io::ErrorKind::ConnectionReset, io::ErrorKind::BrokenPipe] {
				let res = test_relay(&pool, &monitor)
					.relay_stream(
						ErrReader(kind),
						tokio::io::sink(),
						tokio::io::empty(),
						tokio::io::sink(),
					)
					.await;
				assert!(res.is_ok());
			}
		});
	}

	#[test]
	fn returns_transport_errors() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			let pool = Arc::new(BytePool::new(4, 256));
			let monitor = TrafficMonitor::new();
			let err = test_relay(&pool, &monitor)
				.relay_stream(
					ErrReader(io::ErrorKind::InvalidData),
					tokio::io::sink(),
					tokio::io::empty(),
					tokio::io::sink(),
				)
				.await
				.unwrap_err();
			assert_eq!(err.kind(), io::ErrorKind::InvalidData);
		});
	}

	#[test]
	fn lingers_for_one_idle_window() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			let pool = Arc::new(BytePool::new(4, 256));
			let monitor = TrafficMonitor::new();
			let start = Instant::now();
			test_relay(&pool, &monitor)
				.relay_stream(
					tokio::io::empty(),
					tokio::io::sink(),
					tokio::io::empty(),
					tokio::io::sink(),
				)
				.await
				.unwrap();
			assert!(start.elapsed() >= TEST_TIMEOUT);
		});
	}

	#[test]
	fn relays_10mb_without_corruption() {
		const TOTAL: usize = 10_000_000;
		const CHUNK: usize = 64 * 1024;

		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			let pool = Arc::new(BytePool::new(8, 16 * 1024));
			let monitor = TrafficMonitor::new();

			let (local, relay_local) = tokio::io::duplex(64 * 1024);
			let (relay_remote, remote) = tokio::io::duplex(64 * 1024);
			let (ir, iw) = tokio::io::split(relay_local);
			let (or, ow) = tokio::io::split(relay_remote);

			let writer = tokio::spawn(async move {
				let (_r, mut w) = tokio::io::split(local);
				let mut sent = 0_usize;
				let mut chunk = vec![0_u8; CHUNK];
				while sent < TOTAL {
					let len = CHUNK.min(TOTAL - sent);
					for (i, b) in chunk[..len].iter_mut().enumerate() {
						*b = ((sent + i) % 251) as u8;
					}
					w.write_all(&chunk[..len]).await.unwrap();
					sent += len;
				}
				w.shutdown().await.unwrap();
			});
			let reader = tokio::spawn(async move {
				let (mut r, _w) = tokio::io::split(remote);
				let mut got = Vec::with_capacity(TOTAL);
				r.read_to_end(&mut got).await.unwrap();
				got
			});

			test_relay(&pool, &monitor)
				.relay_stream(ir, iw, or, ow)
				.await
				.unwrap();
			writer.await.unwrap();

			let got = reader.await.unwrap();
			assert_eq!(got.len(), TOTAL);
			assert!(got
				.iter()
				.enumerate()
				.all(|(i, b)| *b == ((i % 251) as u8)));
			assert_eq!(monitor.get("remote", Network::Tcp), 20_000_000);
		});
	}
}
