#![forbid(unsafe_code)]

//! Compact event descriptors: `type/version:flags`.
//!
//! `flags` is a non-empty, order-independent set of `b` (broadcaster), `m` (moderator)
//! and `u` (user). Each flag selects one condition field filled with the current user id.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
	#[error("invalid event descriptor {input:?}: missing '/' between type and version")]
	MissingVersion { input: String },

	#[error("invalid event descriptor {input:?}: missing ':' before condition flags")]
	MissingFlags { input: String },

	#[error("invalid event descriptor {input:?}: empty event type")]
	EmptyType { input: String },

	#[error("invalid event descriptor {input:?}: empty version")]
	EmptyVersion { input: String },

	#[error("invalid event descriptor {input:?}: at least one of b, m, u is required")]
	NoFlags { input: String },

	#[error("invalid event descriptor {input:?}: unknown condition flag {flag:?}")]
	UnknownFlag { input: String, flag: char },

	#[error("invalid event descriptor {input:?}: condition flag {flag:?} given twice")]
	DuplicateFlag { input: String, flag: char },

	#[error("invalid event descriptor {input:?}: whitespace is not allowed")]
	Whitespace { input: String },
}

/// Which condition fields a subscription needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConditionFlags {
	pub broadcaster: bool,
	pub moderator: bool,
	pub user: bool,
}

impl ConditionFlags {
	fn parse(input: &str, flags: &str) -> Result<Self, DescriptorError> {
		if flags.is_empty() {
			return Err(DescriptorError::NoFlags { input: input.to_string() });
		}

		let mut out = Self::default();
		for flag in flags.chars() {
			let slot = match flag {
				'b' => &mut out.broadcaster,
				'm' => &mut out.moderator,
				'u' => &mut out.user,
				other => {
					return Err(DescriptorError::UnknownFlag {
						input: input.to_string(),
						flag: other,
					});
				}
			};
			if *slot {
				return Err(DescriptorError::DuplicateFlag {
					input: input.to_string(),
					flag,
				});
			}
			*slot = true;
		}

		Ok(out)
	}
}

impl fmt::Display for ConditionFlags {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.broadcaster {
			f.write_str("b")?;
		}
		if self.moderator {
			f.write_str("m")?;
		}
		if self.user {
			f.write_str("u")?;
		}
		Ok(())
	}
}

/// A parsed `type/version:flags` descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventDescriptor {
	kind: String,
	version: String,
	flags: ConditionFlags,
}

impl EventDescriptor {
	pub fn parse(input: &str) -> Result<Self, DescriptorError> {
		if input.chars().any(char::is_whitespace) {
			return Err(DescriptorError::Whitespace { input: input.to_string() });
		}

		let (kind, rest) = input
			.split_once('/')
			.ok_or_else(|| DescriptorError::MissingVersion { input: input.to_string() })?;
		let (version, flags) = rest
			.rsplit_once(':')
			.ok_or_else(|| DescriptorError::MissingFlags { input: input.to_string() })?;

		if kind.is_empty() {
			return Err(DescriptorError::EmptyType { input: input.to_string() });
		}
		if version.is_empty() || version.contains('/') || version.contains(':') {
			return Err(DescriptorError::EmptyVersion { input: input.to_string() });
		}

		Ok(Self {
			kind: kind.to_string(),
			version: version.to_string(),
			flags: ConditionFlags::parse(input, flags)?,
		})
	}

	/// Subscription type, e.g. `channel.follow`.
	pub fn kind(&self) -> &str {
		&self.kind
	}

	pub fn version(&self) -> &str {
		&self.version
	}

	pub fn flags(&self) -> ConditionFlags {
		self.flags
	}

	/// Condition object for a subscription request, every selected field set to `user_id`.
	pub fn condition(&self, user_id: &str) -> BTreeMap<&'static str, String> {
		let mut condition = BTreeMap::new();
		if self.flags.broadcaster {
			condition.insert("broadcaster_user_id", user_id.to_string());
		}
		if self.flags.moderator {
			condition.insert("moderator_user_id", user_id.to_string());
		}
		if self.flags.user {
			condition.insert("user_id", user_id.to_string());
		}
		condition
	}
}

impl FromStr for EventDescriptor {
	type Err = DescriptorError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

impl fmt::Display for EventDescriptor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}:{}", self.kind, self.version, self.flags)
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn parses_type_version_and_flags() {
		let d = EventDescriptor::parse("channel.follow/2:bm").unwrap();
		assert_eq!(d.kind(), "channel.follow");
		assert_eq!(d.version(), "2");
		assert_eq!(
			d.flags(),
			ConditionFlags {
				broadcaster: true,
				moderator: true,
				user: false,
			}
		);
	}

	#[test]
	fn flag_order_does_not_change_condition() {
		let a = EventDescriptor::parse("channel.follow/2:bu").unwrap();
		let b = EventDescriptor::parse("channel.follow/2:ub").unwrap();

		assert_eq!(a, b);
		assert_eq!(a.kind(), "channel.follow");
		assert_eq!(a.version(), "2");

		let condition = a.condition("42");
		assert_eq!(condition, b.condition("42"));
		assert_eq!(condition.len(), 2);
		assert_eq!(condition.get("broadcaster_user_id").map(String::as_str), Some("42"));
		assert_eq!(condition.get("user_id").map(String::as_str), Some("42"));
	}

	#[test]
	fn moderator_flag_maps_to_moderator_user_id() {
		let d = EventDescriptor::parse("channel.follow/2:mb").unwrap();
		let condition = d.condition("7");
		assert_eq!(condition.get("moderator_user_id").map(String::as_str), Some("7"));
		assert_eq!(condition.get("broadcaster_user_id").map(String::as_str), Some("7"));
		assert!(!condition.contains_key("user_id"));
	}

	#[test]
	fn display_is_canonical() {
		let d: EventDescriptor = "channel.chat.message/1:ub".parse().unwrap();
		assert_eq!(d.to_string(), "channel.chat.message/1:bu");
	}

	#[test]
	fn rejects_malformed_descriptors() {
		let cases = [
			("channel.follow", "missing '/'"),
			("channel.follow/2", "missing ':'"),
			("/2:b", "empty event type"),
			("channel.follow/:b", "empty version"),
			("channel.follow/2:", "at least one of"),
			("channel.follow/2:bx", "unknown condition flag"),
			("channel.follow/2:bb", "given twice"),
			("channel.follow/2: b", "whitespace"),
			("channel.follow/2/3:b", "empty version"),
		];

		for (input, needle) in cases {
			let err = EventDescriptor::parse(input).expect_err(input);
			assert!(
				err.to_string().contains(needle),
				"error for {input:?} should mention {needle:?}, got: {err}"
			);
		}
	}

	fn flag_set() -> impl Strategy<Value = Vec<char>> {
		proptest::sample::subsequence(vec!['b', 'm', 'u'], 1..=3).prop_shuffle()
	}

	proptest! {
		#[test]
		fn any_flag_permutation_yields_the_same_condition(
			kind in "[a-z]{1,8}(\\.[a-z_]{1,8}){0,3}",
			version in "[1-9]",
			flags in flag_set(),
			user_id in "[0-9]{1,10}",
		) {
			let flags_str: String = flags.iter().collect();
			let mut sorted = flags.clone();
			sorted.sort_unstable();
			let sorted_str: String = sorted.iter().collect();

			let shuffled = EventDescriptor::parse(&format!("{kind}/{version}:{flags_str}")).unwrap();
			let canonical = EventDescriptor::parse(&format!("{kind}/{version}:{sorted_str}")).unwrap();

			prop_assert_eq!(shuffled.condition(&user_id), canonical.condition(&user_id));
			prop_assert_eq!(shuffled.condition(&user_id).len(), flags.len());
			prop_assert_eq!(shuffled.kind(), kind.as_str());
			prop_assert_eq!(shuffled.version(), version.as_str());
		}
	}
}
