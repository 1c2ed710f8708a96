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

mod session_map;

use super::{
	stat::{Network, TrafficMonitor},
	Error,
};
use crate::{
	prelude::*,
	utils::{pool::BytePool, relay::is_benign},
};
use bytes::Bytes;
use futures::{
	future::{self, Either},
	FutureExt,
};
use session_map::{Session, SessionMap};
use std::{
	io,
	net::{IpAddr, Ipv4Addr, Ipv6Addr},
	time::Duration,
};
use tokio::{net::UdpSocket, sync::mpsc, time::timeout};

pub(super) struct UdpRelayArgs {
	/// The single inbound socket all peers send their datagrams to.
	pub socket: Arc<UdpSocket>,
	pub remote: SocketAddr,
	pub remote_tag: Tag,
	pub pool: Arc<BytePool>,
	pub monitor: Option<TrafficMonitor>,
	pub idle_timeout: Duration,
}

/// Demultiplex datagrams arriving on one inbound socket into independent
/// per peer relay sessions.
///
/// Every datagram is queued on its peer's session; the first datagram of
/// a new peer also claims the session and starts the one forwarding
/// worker that peer is allowed to have. A full session queue drops the
/// newest datagram instead of blocking this loop, so one slow peer
/// cannot stall the others.
pub(super) async fn dispatch(args: UdpRelayArgs) -> Result<(), Error> {
	let (map, guard_task) = SessionMap::new(args.idle_timeout);
	let map = Arc::new(map);
	let guard_task = guard_task.map(|()| Result::<(), Error>::Ok(()));
	futures::try_join!(recv_loop(&map, &args), guard_task).map(|_| ())
}

async fn recv_loop(map: &Arc<SessionMap>, args: &UdpRelayArgs) -> Result<(), Error> {
	let mut buf = args.pool.acquire();
	let res = loop {
		let (len, peer) = match args.socket.recv_from(&mut buf).await {
			Ok(v) => v,
			Err(err) => break Err(err),
		};
		trace!("received {} bytes over UDP from peer {}", len, peer);

		let session = map.get_or_create(peer);
		if !session.try_push(Bytes::copy_from_slice(&buf[..len])) {
			// Dropped; the session already logged why.
			continue;
		}
		if let Some(receiver) = session.try_claim() {
			debug!("starting UDP session worker for peer {}", peer);
			let worker = SessionWorker {
				map: map.clone(),
				session,
				inbound: args.socket.clone(),
				remote: args.remote,
				remote_tag: args.remote_tag.clone(),
				pool: args.pool.clone(),
				monitor: args.monitor.clone(),
				idle_timeout: args.idle_timeout,
			};
			tokio::spawn(worker.run(receiver));
		}
	};
	args.pool.release(buf);
	res.map_err(Error::from)
}

enum Event {
	Idle,
	Queue(Option<Bytes>),
	Upstream(io::Result<usize>),
}

/// Forwards one session's datagrams to the upstream target and relays
/// replies back to the peer.
struct SessionWorker {
	map: Arc<SessionMap>,
	session: Arc<Session>,
	inbound: Arc<UdpSocket>,
	remote: SocketAddr,
	remote_tag: Tag,
	pool: Arc<BytePool>,
	monitor: Option<TrafficMonitor>,
	idle_timeout: Duration,
}

impl SessionWorker {
	async fn run(self, mut receiver: mpsc::Receiver<Bytes>) {
		let peer = self.session.peer();
		match self.relay_packets(&mut receiver).await {
			Ok(()) => debug!("UDP session for peer {} finished", peer),
			Err(err) if is_benign(&err) => {
				debug!("UDP session for peer {} closed by peer ({})", peer, err);
			}
			Err(err) => error!("error in UDP session for peer {} ({})", peer, err),
		}
		self.map.remove(&self.session);
	}

	async fn relay_packets(&self, receiver: &mut mpsc::Receiver<Bytes>) -> io::Result<()> {
		let bind_ip: IpAddr = if self.remote.is_ipv4() {
			Ipv4Addr::UNSPECIFIED.into()
		} else {
			Ipv6Addr::UNSPECIFIED.into()
		};
		let upstream = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
		upstream.connect(self.remote).await?;

		let mut buf = self.pool.acquire();
		let res = loop {
			let event = {
				let queue_fut = receiver.recv();
				let upstream_fut = upstream.recv(&mut buf);
				futures::pin_mut!(queue_fut);
				futures::pin_mut!(upstream_fut);
				match timeout(self.idle_timeout, future::select(queue_fut, upstream_fut)).await {
					Err(_) => Event::Idle,
					Ok(Either::Left((data, _))) => Event::Queue(data),
					Ok(Either::Right((res, _))) => Event::Upstream(res),
				}
			};
			match event {
				Event::Idle => {
					debug!(
						"UDP session for peer {} idle for {} ms, closing",
						self.session.peer(),
						self.idle_timeout.as_millis()
					);
					break Ok(());
				}
				// The session was evicted and its sending end dropped.
				Event::Queue(None) => break Ok(()),
				Event::Queue(Some(data)) => {
					if let Err(err) = upstream.send(&data).await {
						break Err(err);
					}
					self.record(data.len());
				}
				Event::Upstream(Ok(len)) => {
					if let Err(err) = self
						.inbound
						.send_to(&buf[..len], self.session.peer())
						.await
					{
						break Err(err);
					}
					self.session.touch();
					self.record(len);
				}
				Event::Upstream(Err(err)) => break Err(err),
			}
		};
		self.pool.release(buf);
		res
	}

	fn record(&self, len: usize) {
		if let Some(monitor) = &self.monitor {
			monitor.add(&self.remote_tag, Network::Udp, (len as u64) * 2);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn relays_datagrams_end_to_end() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			// Echo upstream.
			let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
			let upstream_addr = upstream.local_addr().unwrap();
			tokio::spawn(async move {
				let mut buf = vec![0_u8; 2048];
				loop {
					let (len, from) = upstream.recv_from(&mut buf).await.unwrap();
					upstream.send_to(&buf[..len], from).await.unwrap();
				}
			});

			let inbound = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
			let inbound_addr = inbound.local_addr().unwrap();
			let monitor = TrafficMonitor::new();
			let args = UdpRelayArgs {
				socket: inbound,
				remote: upstream_addr,
				remote_tag: Tag::from("echo"),
				pool: Arc::new(BytePool::new(4, 2048)),
				monitor: Some(monitor.clone()),
				idle_timeout: Duration::from_millis(500),
			};
			tokio::spawn(async move {
				let _ = dispatch(args).await;
			});

			let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
			client.connect(inbound_addr).await.unwrap();
			let mut buf = [0_u8; 64];
			for i in 0..3_u8 {
				let msg = [b'm', b's', b'g', i];
				client.send(&msg).await.unwrap();
				let len = timeout(Duration::from_secs(5), client.recv(&mut buf))
					.await
					.unwrap()
					.unwrap();
				assert_eq!(&buf[..len], &msg);
			}

			// Worker side accounting may land just after the last reply.
			tokio::time::sleep(Duration::from_millis(100)).await;
			// 3 datagrams of 4 bytes in each direction, doubled.
			assert_eq!(monitor.get("echo", Network::Udp), 3 * 4 * 2 * 2);
		});
	}
}
