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

use std::fmt;

/// Display bytes number in human readable form.
#[derive(Clone, Copy)]
pub struct BytesCount(pub u64);

impl fmt::Display for BytesCount {
	#[allow(clippy::cast_precision_loss)]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		const BASE: f64 = 1024.0;
		const NAMES: &[&str] = &["KiB", "MiB", "GiB", "TiB"];
		if self.0 < 1024 {
			return write!(f, "{}B", self.0);
		}
		let mut value = self.0 as f64 / BASE;
		let mut index = 0;
		while value >= BASE && index + 1 < NAMES.len() {
			value /= BASE;
			index += 1;
		}
		write!(f, "{:.2}{}", value, NAMES[index])
	}
}
