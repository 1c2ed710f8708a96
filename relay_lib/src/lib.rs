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

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

#[forbid(unsafe_code)]
mod prelude;
#[forbid(unsafe_code)]
pub mod server;
#[forbid(unsafe_code)]
pub mod user;
#[forbid(unsafe_code)]
pub mod utils;

pub use server::{
	stat::TrafficMonitor, BuildError as ServerBuildError, Builder as ServerBuilder, Server,
};
pub use utils::{pool::BytePool, relay::Relay, BytesCount};
