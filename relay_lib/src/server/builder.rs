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

use super::{RelayRule, RuleNetwork, Server};
use crate::{prelude::*, server::stat::TrafficMonitor, utils::pool::BytePool};
use std::{collections::HashMap, time::Duration};

const DEFAULT_POOL_SIZE: usize = 1024;
const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
	#[error("tag '{tag}' on relay '{ind}' already exists")]
	TagAlreadyExists { ind: usize, tag: Tag },
	#[error("server must have at least one relay rule")]
	NoRules,
	#[error("value of '{0}' cannot be zero")]
	ValueIsZero(Cow<'static, str>),
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Builder {
	pub relays: Vec<RuleBuilder>,
	#[serde(default = "default_pool_size")]
	pub pool_size: usize,
	#[serde(default = "default_buffer_size")]
	pub buffer_size: usize,
	#[serde(default = "default_idle_timeout_secs")]
	pub idle_timeout_secs: u64,
}

impl Default for Builder {
	fn default() -> Self {
		Self {
			relays: Vec::new(),
			pool_size: DEFAULT_POOL_SIZE,
			buffer_size: DEFAULT_BUFFER_SIZE,
			idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
		}
	}
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleBuilder {
	#[serde(default)]
	pub tag: Tag,
	pub listen: SocketAddr,
	pub remote: SocketAddr,
	#[serde(default)]
	pub network: RuleNetwork,
}

impl Builder {
	/// Creates a [`Server`].
	///
	/// # Errors
	///
	/// Returns an error if there are no relay rules, if any explicit tag
	/// repeats, or if any of the process wide values is zero.
	pub fn build(self) -> Result<Server, BuildError> {
		if self.relays.is_empty() {
			return Err(BuildError::NoRules);
		}
		if self.pool_size == 0 {
			return Err(BuildError::ValueIsZero("pool_size".into()));
		}
		if self.buffer_size == 0 {
			return Err(BuildError::ValueIsZero("buffer_size".into()));
		}
		if self.idle_timeout_secs == 0 {
			return Err(BuildError::ValueIsZero("idle_timeout_secs".into()));
		}

		// Explicit tags must be unique. Empty tags default to the remote
		// address and may repeat, pooling their traffic under one label.
		let mut tags = HashMap::new();
		for (ind, rule) in self.relays.iter().enumerate() {
			if rule.tag.is_empty() {
				continue;
			}
			if tags.insert(rule.tag.clone(), ind).is_some() {
				return Err(BuildError::TagAlreadyExists {
					ind,
					tag: rule.tag.clone(),
				});
			}
		}

		let rules = self
			.relays
			.into_iter()
			.map(|rule| {
				let tag = if rule.tag.is_empty() {
					Tag::from(rule.remote.to_string())
				} else {
					rule.tag
				};
				RelayRule {
					tag,
					listen: rule.listen,
					remote: rule.remote,
					network: rule.network,
				}
			})
			.collect();

		Ok(Server {
			rules,
			pool: Arc::new(BytePool::new(self.pool_size, self.buffer_size)),
			monitor: TrafficMonitor::new(),
			idle_timeout: Duration::from_secs(self.idle_timeout_secs),
		})
	}
}

fn default_pool_size() -> usize {
	DEFAULT_POOL_SIZE
}

fn default_buffer_size() -> usize {
	DEFAULT_BUFFER_SIZE
}

fn default_idle_timeout_secs() -> u64 {
	DEFAULT_IDLE_TIMEOUT_SECS
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rule(tag: &str, listen: &str, remote: &str) -> RuleBuilder {
		RuleBuilder {
			tag: Tag::from(tag),
			listen: listen.parse().unwrap(),
			remote: remote.parse().unwrap(),
			network: RuleNetwork::default(),
		}
	}

	#[test]
	fn build_uses_defaults() {
		let builder = Builder {
			relays: vec![rule("a", "127.0.0.1:5000", "127.0.0.1:6000")],
			..Builder::default()
		};
		let server = builder.build().unwrap();
		assert_eq!(server.rules.len(), 1);
		assert_eq!(server.idle_timeout(), Duration::from_secs(10));
		assert_eq!(server.pool().buf_size(), 16 * 1024);
	}

	#[test]
	fn build_rejects_duplicate_tags() {
		let builder = Builder {
			relays: vec![
				rule("a", "127.0.0.1:5000", "127.0.0.1:6000"),
				rule("a", "127.0.0.1:5001", "127.0.0.1:6001"),
			],
			..Builder::default()
		};
		assert!(matches!(
			builder.build(),
			Err(BuildError::TagAlreadyExists { ind: 1, .. })
		));
	}

	#[test]
	fn build_rejects_empty_and_zero_values() {
		assert!(matches!(Builder::default().build(), Err(BuildError::NoRules)));

		let builder = Builder {
			relays: vec![rule("a", "127.0.0.1:5000", "127.0.0.1:6000")],
			pool_size: 0,
			..Builder::default()
		};
		assert!(matches!(builder.build(), Err(BuildError::ValueIsZero(_))));
	}

	#[test]
	fn empty_tags_default_to_remote_address() {
		let builder = Builder {
			relays: vec![
				rule("", "127.0.0.1:5000", "127.0.0.1:6000"),
				rule("", "127.0.0.1:5001", "127.0.0.1:6000"),
			],
			..Builder::default()
		};
		let server = builder.build().unwrap();
		assert_eq!(server.rules[0].tag, Tag::from("127.0.0.1:6000"));
		// Both rules pool their traffic under the same label.
		assert_eq!(server.rules[0].tag, server.rules[1].tag);
	}
}
