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

use super::{atomic_values::Switch, STOPPED};
use crate::{prelude::*, utils::pool::BytePool};
use std::{io, time::Duration};
use tokio::time::timeout;

/// Copy bytes from `r` to `w` using a pooled buffer.
///
/// Every read carries `idle_timeout` as its deadline, so a copy half
/// whose source goes silent ends within one idle window.
pub(super) struct CopyHalf<R, W>
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	pub r: R,
	pub w: W,
	pub pool: Arc<BytePool>,
	pub tag: Arc<str>,
	pub is_reading_stopped: Switch,
	pub idle_timeout: Duration,
}

impl<R, W> CopyHalf<R, W>
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	/// Returns the number of bytes copied along with how the copy ended.
	pub async fn run(mut self) -> (u64, io::Result<()>) {
		let mut buf = self.pool.acquire();
		let mut count = 0_u64;
		let res = self.copy_all(&mut buf, &mut count).await;
		self.pool.release(buf);
		(count, res)
	}

	async fn copy_all(&mut self, buf: &mut [u8], count: &mut u64) -> io::Result<()> {
		loop {
			trace!("{} waiting for read_half...", self.tag);
			let len = match timeout(self.idle_timeout, self.r.read(buf)).await {
				Ok(res) => res?,
				Err(_) => {
					debug!(
						"{} read_half idle for {} ms, closing",
						self.tag,
						self.idle_timeout.as_millis()
					);
					return Err(io::Error::new(
						io::ErrorKind::TimedOut,
						"read half was idle for too long",
					));
				}
			};
			if len == 0 {
				debug!("{} read_half reached EOF, shutting down write_half", self.tag);
				self.is_reading_stopped.set(STOPPED);
				return if let Err(err) = self.w.shutdown().await {
					debug!("{} error when shutting down write_half ({})", self.tag, err);
					Err(err)
				} else {
					Ok(())
				};
			}
			if let Err(err) = self.w.write_all(&buf[..len]).await {
				return if self.is_reading_stopped.get() == STOPPED {
					debug!(
						"{} write_half error ({}), ignored because the other read_half is stopped",
						self.tag, err
					);
					Ok(())
				} else {
					Err(err)
				};
			}
			trace!("{} wrote {} bytes into write_half", self.tag, len);
			*count += len as u64;
		}
	}
}
