//! File access policy bitmask and the mask/value scope algebra (component B).
//!
//! The composition rule mirrors the priority-ordered whitelist collapsing
//! in the teacher's `VirtualFSTree`/`VirtualFSEntryType` (`sandbox.rs`):
//! there, a subpath can only ever gain permissions relative to its parent.
//! Here that same "only additive, and only within what the mask still
//! allows" shape is made into an explicit algebraic law instead of an
//! ad hoc `PartialOrd` on an enum.

use std::fmt;

macro_rules! policy_bits {
	($($name:ident = $bit:expr;)*) => {
		#[derive(Clone, Copy, PartialEq, Eq, Default)]
		pub struct FileAccessPolicy(u32);

		impl FileAccessPolicy {
			pub const EMPTY: FileAccessPolicy = FileAccessPolicy(0);
			$(pub const $name: FileAccessPolicy = FileAccessPolicy($bit);)*

			pub const fn bits(self) -> u32 {
				self.0
			}
			pub const fn from_bits(bits: u32) -> FileAccessPolicy {
				FileAccessPolicy(bits)
			}
			pub fn contains(self, other: FileAccessPolicy) -> bool {
				self.0 & other.0 == other.0
			}

			/// Individually named bits, in declaration order.
			const NAMED: &'static [(&'static str, FileAccessPolicy)] = &[
				$((stringify!($name), FileAccessPolicy($bit)),)*
			];
		}

		impl std::ops::BitOr for FileAccessPolicy {
			type Output = FileAccessPolicy;
			fn bitor(self, rhs: FileAccessPolicy) -> FileAccessPolicy {
				FileAccessPolicy(self.0 | rhs.0)
			}
		}
		impl std::ops::BitAnd for FileAccessPolicy {
			type Output = FileAccessPolicy;
			fn bitand(self, rhs: FileAccessPolicy) -> FileAccessPolicy {
				FileAccessPolicy(self.0 & rhs.0)
			}
		}
		impl std::ops::Not for FileAccessPolicy {
			type Output = FileAccessPolicy;
			fn not(self) -> FileAccessPolicy {
				FileAccessPolicy(!self.0)
			}
		}
	};
}

policy_bits! {
	DENY = 0x1;
	ALLOW_READ = 0x2;
	ALLOW_READ_IF_NONEXISTENT = 0x4;
	ALLOW_WRITE = 0x8;
	ALLOW_CREATE_DIRECTORY = 0x10;
	ALLOW_SYMLINK_CREATION = 0x20;
	ALLOW_REAL_INPUT_TIMESTAMPS = 0x40;
	OVERRIDE_ALLOW_WRITE_FOR_EXISTING_FILES = 0x80;
	TREAT_DIRECTORY_SYMLINK_AS_DIRECTORY = 0x100;
	ENABLE_FULL_REPARSE_POINT_PARSING = 0x200;
	REPORT_ACCESS = 0x400;
	REPORT_ACCESS_IF_EXISTENT = 0x800;
	REPORT_ACCESS_IF_NONEXISTENT = 0x1000;
	REPORT_DIRECTORY_ENUMERATION_ACCESS = 0x2000;
}

/// Named bit combinations that should print as one token instead of their
/// parts, checked (and cleared) before the single-bit names, per spec
/// §4.B ("composite aliases emitted before their parts").
const COMPOSITE_ALIASES: &[(&str, FileAccessPolicy)] = &[(
	"ReportAccessIfExistent",
	FileAccessPolicy(FileAccessPolicy::REPORT_ACCESS.0 | FileAccessPolicy::REPORT_ACCESS_IF_EXISTENT.0),
)];

impl fmt::Debug for FileAccessPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{self}")
	}
}
impl fmt::Display for FileAccessPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.0 == 0 {
			return write!(f, "(none)");
		}
		let mut remaining = self.0;
		let mut parts = Vec::new();
		for (name, combo) in COMPOSITE_ALIASES {
			if remaining & combo.0 == combo.0 {
				parts.push(*name);
				remaining &= !combo.0;
			}
		}
		for (name, bit) in Self::NAMED {
			if remaining & bit.0 == bit.0 {
				parts.push(*name);
				remaining &= !bit.0;
			}
		}
		write!(f, "{}", parts.join("|"))
	}
}

/// A `(mask, values)` pair. Applying a scope to a policy `p` yields
/// `(p & mask) | values`. See spec §3 for the algebraic laws this upholds:
/// idempotence, associativity, and monotonicity (values only grow, mask
/// only shrinks, as scopes compose root-to-leaf).
#[derive(Clone, Copy, Debug)]
pub struct FileAccessScope {
	pub mask: FileAccessPolicy,
	pub values: FileAccessPolicy,
}

impl FileAccessScope {
	pub const IDENTITY: FileAccessScope = FileAccessScope {
		mask: FileAccessPolicy::from_bits(u32::MAX),
		values: FileAccessPolicy::EMPTY,
	};

	pub fn new(mask: FileAccessPolicy, values: FileAccessPolicy) -> Self {
		Self { mask, values }
	}

	pub fn apply(self, policy: FileAccessPolicy) -> FileAccessPolicy {
		(policy & self.mask) | self.values
	}

	/// Composes `self` followed by `other` (`other` applied after `self`)
	/// into a single scope equivalent to applying both in sequence.
	pub fn then(self, other: FileAccessScope) -> FileAccessScope {
		FileAccessScope {
			mask: self.mask & other.mask,
			values: (self.values & other.mask) | other.values,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn apply_is_idempotent() {
		let scope = FileAccessScope::new(!FileAccessPolicy::DENY, FileAccessPolicy::ALLOW_READ);
		let once = scope.apply(FileAccessPolicy::EMPTY);
		let twice = scope.apply(once);
		assert!(once.contains(FileAccessPolicy::ALLOW_READ));
		assert_eq!(once.bits(), twice.bits());
	}

	#[test]
	fn then_matches_sequential_application() {
		let a = FileAccessScope::new(!FileAccessPolicy::EMPTY, FileAccessPolicy::ALLOW_READ);
		let b = FileAccessScope::new(!FileAccessPolicy::ALLOW_READ, FileAccessPolicy::ALLOW_WRITE);
		let composed = a.then(b);

		let start = FileAccessPolicy::EMPTY;
		let sequential = b.apply(a.apply(start));
		assert_eq!(composed.apply(start).bits(), sequential.bits());
	}

	#[test]
	fn display_prefers_composite_aliases() {
		let formatted = (FileAccessPolicy::REPORT_ACCESS_IF_EXISTENT | FileAccessPolicy::REPORT_ACCESS).to_string();
		assert_eq!(formatted, "ReportAccessIfExistent");
	}
}
