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

use parking_lot::Mutex;
use std::collections::VecDeque;

/// A leaky pool of reusable byte buffers.
///
/// [`acquire`](BytePool::acquire) never blocks. It pops an idle buffer if
/// one is queued and allocates a fresh one otherwise. [`release`](BytePool::release)
/// offers a buffer back to the pool; when the pool is already holding
/// `capacity` idle buffers the offered buffer is simply dropped, so the
/// pool never grows past its bound no matter how many buffers are in
/// flight.
///
/// There is no ownership tracking beyond this handshake. A caller must
/// stop using a buffer once it has been released.
pub struct BytePool {
	idle: Mutex<VecDeque<Vec<u8>>>,
	capacity: usize,
	buf_size: usize,
}

impl BytePool {
	#[must_use]
	pub fn new(capacity: usize, buf_size: usize) -> Self {
		Self {
			idle: Mutex::new(VecDeque::with_capacity(capacity)),
			capacity,
			buf_size,
		}
	}

	/// Take a buffer of exactly `buf_size` bytes out of the pool,
	/// allocating a new one if no idle buffer is queued.
	#[must_use]
	pub fn acquire(&self) -> Vec<u8> {
		if let Some(buf) = self.idle.lock().pop_front() {
			return buf;
		}
		vec![0_u8; self.buf_size]
	}

	/// Offer `buf` back to the pool.
	///
	/// Buffers of the wrong size and buffers offered while the pool is
	/// full are dropped instead of being retained.
	pub fn release(&self, buf: Vec<u8>) {
		if buf.len() != self.buf_size {
			return;
		}
		let mut idle = self.idle.lock();
		if idle.len() < self.capacity {
			idle.push_back(buf);
		}
	}

	/// Number of idle buffers currently queued.
	#[must_use]
	pub fn idle_count(&self) -> usize {
		self.idle.lock().len()
	}

	#[inline]
	#[must_use]
	pub fn buf_size(&self) -> usize {
		self.buf_size
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pool_stays_bounded() {
		let pool = BytePool::new(2, 64);
		let bufs: Vec<_> = (0..4).map(|_| pool.acquire()).collect();
		for buf in &bufs {
			assert_eq!(buf.len(), 64);
		}
		for buf in bufs {
			pool.release(buf);
		}
		// Two buffers went back in, the other two were dropped.
		assert_eq!(pool.idle_count(), 2);
	}

	#[test]
	fn pool_reuses_released_buffer() {
		let pool = BytePool::new(1, 32);
		let buf = pool.acquire();
		let ptr = buf.as_ptr();
		pool.release(buf);
		let buf = pool.acquire();
		assert_eq!(buf.as_ptr(), ptr);
		assert_eq!(buf.len(), 32);
	}

	#[test]
	fn pool_rejects_wrong_sized_buffer() {
		let pool = BytePool::new(4, 32);
		pool.release(vec![0_u8; 8]);
		assert_eq!(pool.idle_count(), 0);
		// The next acquire must still hand out a full sized buffer.
		assert_eq!(pool.acquire().len(), 32);
	}
}
