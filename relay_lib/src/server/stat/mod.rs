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

mod monitor;
pub use monitor::{FlowSnapshot, TrafficMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
	Tcp,
	Udp,
}

impl Network {
	#[inline]
	#[must_use]
	pub fn as_str(&self) -> &'static str {
		match self {
			Network::Tcp => "tcp",
			Network::Udp => "udp",
		}
	}
}
