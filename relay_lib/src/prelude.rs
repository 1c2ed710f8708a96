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

pub use log::{debug, error, info, trace, warn};
pub use rand::RngCore;
pub use std::{
	borrow::Cow,
	error::Error as StdErr,
	net::SocketAddr,
	pin::Pin,
	sync::Arc,
};
pub use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub type Tag = smol_str::SmolStr;
pub type BoxStdErr = Box<dyn StdErr + Send + Sync>;
