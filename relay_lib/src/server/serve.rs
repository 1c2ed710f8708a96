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

use super::{
	stat::Network,
	udp::{self, UdpRelayArgs},
	Error, RelayRule, Server,
};
use crate::{
	prelude::*,
	utils::{relay::Relay, BytesCount},
};
use std::{future::Future, io};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

impl Server {
	pub(super) async fn priv_serve(self: Arc<Self>) -> Result<(), BoxStdErr> {
		type FutVec<T> = Vec<Pin<Box<T>>>;
		let mut tasks: FutVec<dyn Future<Output = Result<(), BoxStdErr>> + Send> =
			Vec::with_capacity(self.rules.len() * 2);

		for rule in &self.rules {
			if rule.network.uses_tcp() {
				tasks.push(Box::pin(self.clone().serve_tcp(rule.clone())));
			}
			if rule.network.uses_udp() {
				tasks.push(Box::pin(self.clone().serve_udp(rule.clone())));
			}
		}

		futures::future::try_join_all(tasks).await?;
		Ok(())
	}

	/// Accept and relay TCP connections for `rule` forever.
	async fn serve_tcp(self: Arc<Self>, rule: RelayRule) -> Result<(), BoxStdErr> {
		let listener = TcpListener::bind(rule.listen).await?;
		warn!(
			"serving TCP relay '{}' on {}, forwarding to {}",
			rule.tag, rule.listen, rule.remote
		);
		let rule = Arc::new(rule);
		loop {
			let (stream, from) = listener.accept().await?;
			// randomly generated connection ID
			let conn_id = rand::thread_rng().next_u64();
			let server = self.clone();
			let rule = rule.clone();
			tokio::spawn(async move {
				if let Err(err) = server.handle_tcp_conn(conn_id, stream, &rule).await {
					if let Error::Inactive(secs) = &err {
						warn!(
							"[{conn_id:x}] connection from {from} closed \
                            due to inactivity for {secs} secs"
						);
					} else {
						error!(
							"[{conn_id:x}] error in relay '{tag}' session from {from}: {err}",
							tag = rule.tag,
						);
					}
				}
			});
		}
	}

	async fn handle_tcp_conn(
		&self,
		conn_id: u64,
		stream: TcpStream,
		rule: &RelayRule,
	) -> Result<(), Error> {
		debug!(
			"[{conn_id:x}] connecting to remote {} for relay '{}'",
			rule.remote, rule.tag
		);
		let remote_stream = TcpStream::connect(rule.remote).await?;
		let (ir, iw) = stream.into_split();
		let (or, ow) = remote_stream.into_split();

		let id = format!("{conn_id:x}");
		let mut relay = Relay::new(&id, self.pool.clone(), rule.tag.clone());
		relay
			.set_monitor(self.monitor.clone())
			.set_idle_timeout(self.idle_timeout);
		let res = relay.relay_stream(ir, iw, or, ow).await;

		debug!(
			"[{conn_id:x}] session closed, {} relayed to '{}' so far",
			BytesCount(self.monitor.get(rule.tag.as_str(), Network::Tcp)),
			rule.tag
		);
		res.map_err(|err| {
			if err.kind() == io::ErrorKind::TimedOut {
				Error::Inactive(self.idle_timeout.as_secs())
			} else {
				Error::Io(err)
			}
		})
	}

	/// Run the datagram dispatch loop for `rule` forever.
	async fn serve_udp(self: Arc<Self>, rule: RelayRule) -> Result<(), BoxStdErr> {
		let socket = Arc::new(UdpSocket::bind(rule.listen).await?);
		warn!(
			"serving UDP relay '{}' on {}, forwarding to {}",
			rule.tag, rule.listen, rule.remote
		);
		udp::dispatch(UdpRelayArgs {
			socket,
			remote: rule.remote,
			remote_tag: rule.tag.clone(),
			pool: self.pool.clone(),
			monitor: Some(self.monitor.clone()),
			idle_timeout: self.idle_timeout,
		})
		.await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::{Builder, RuleBuilder, RuleNetwork};
	use std::time::Duration;
	use tokio::time::timeout;

	#[test]
	fn relays_tcp_end_to_end() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			// Echo upstream.
			let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
			let upstream_addr = upstream.local_addr().unwrap();
			tokio::spawn(async move {
				loop {
					let (mut stream, _) = upstream.accept().await.unwrap();
					tokio::spawn(async move {
						let (mut r, mut w) = stream.split();
						tokio::io::copy(&mut r, &mut w).await.ok();
					});
				}
			});

			// The server binds its own listener, so pick a free port
			// first and hand it over.
			let listen_addr = {
				let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
				probe.local_addr().unwrap()
			};
			let server = Arc::new(
				Builder {
					relays: vec![RuleBuilder {
						tag: Tag::from("echo"),
						listen: listen_addr,
						remote: upstream_addr,
						network: RuleNetwork::Tcp,
					}],
					idle_timeout_secs: 1,
					..Builder::default()
				}
				.build()
				.unwrap(),
			);
			let monitor = server.monitor().clone();
			tokio::spawn(async move {
				server.serve().await.ok();
			});
			// Wait for the listener to come up.
			let mut stream = loop {
				if let Ok(s) = TcpStream::connect(listen_addr).await {
					break s;
				}
				tokio::time::sleep(Duration::from_millis(20)).await;
			};

			let payload = b"relay me";
			stream.write_all(payload).await.unwrap();
			let mut got = [0_u8; 8];
			timeout(Duration::from_secs(5), stream.read_exact(&mut got))
				.await
				.unwrap()
				.unwrap();
			assert_eq!(&got, payload);
			drop(stream);

			// Both directions copied 8 bytes, each reported doubled.
			let deadline = std::time::Instant::now() + Duration::from_secs(5);
			loop {
				if monitor.get("echo", Network::Tcp) == 32 {
					break;
				}
				assert!(std::time::Instant::now() < deadline, "metrics never arrived");
				tokio::time::sleep(Duration::from_millis(50)).await;
			}
		});
	}
}
