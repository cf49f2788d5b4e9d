//! Reported and observed accesses (shared data model, spec §3).
//!
//! `ReportedAccess` is what the sandbox sends over the wire, one per
//! intercepted operation. `ObservedAccess` is what the Access Classifier
//! (component E) folds many `ReportedAccess` values for the same path into.

use std::fmt;

use crate::path_interner::PathId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperationKind {
	Create,
	Open,
	Read,
	Write,
	Delete,
	Rename,
	Enumerate,
	Probe,
	ProcessStart,
	ProcessExit,
	ProcessBreakaway,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DecisionStatus {
	Allowed,
	Denied,
	CannotDetermine,
}

macro_rules! access_bits {
	($($name:ident = $bit:expr;)*) => {
		#[derive(Clone, Copy, PartialEq, Eq, Default)]
		pub struct RequestedAccess(u8);

		impl RequestedAccess {
			pub const EMPTY: RequestedAccess = RequestedAccess(0);
			$(pub const $name: RequestedAccess = RequestedAccess($bit);)*

			pub fn contains(self, other: RequestedAccess) -> bool {
				self.0 & other.0 == other.0
			}
			pub const fn from_bits(bits: u8) -> RequestedAccess {
				RequestedAccess(bits)
			}
			pub const fn bits(self) -> u8 {
				self.0
			}
		}
		impl std::ops::BitOr for RequestedAccess {
			type Output = RequestedAccess;
			fn bitor(self, rhs: RequestedAccess) -> RequestedAccess {
				RequestedAccess(self.0 | rhs.0)
			}
		}
		impl fmt::Debug for RequestedAccess {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				let mut parts = Vec::new();
				$(if self.contains(Self::$name) { parts.push(stringify!($name)); })*
				write!(f, "{}", parts.join("|"))
			}
		}
	};
}

access_bits! {
	READ = 0x1;
	WRITE = 0x2;
	PROBE = 0x4;
	ENUMERATE = 0x8;
}

/// One line of the sandbox's report stream, after frame parsing (component D)
/// and before classification (component E).
#[derive(Clone, Debug)]
pub struct ReportedAccess {
	pub operation: OperationKind,
	pub pid: u32,
	pub parent_pid: u32,
	pub requested: RequestedAccess,
	pub status: DecisionStatus,
	pub path: PathId,
	pub path_truncated: bool,
	pub is_directory_location: bool,
	pub explicit_report: bool,
	pub requested_usn: Option<u64>,
	pub error_code: Option<i32>,
}

impl ReportedAccess {
	pub fn is_unexpected(&self) -> bool {
		matches!(self.status, DecisionStatus::Denied | DecisionStatus::CannotDetermine)
	}
}

/// Per-path summary of every `ReportedAccess` seen for that path within one
/// execution (spec §4.E step 4/6). Consumed by the fingerprint/cache layer,
/// which is out of scope here; this crate only produces the summary.
#[derive(Clone, Debug)]
pub struct ObservedAccess {
	pub path: PathId,
	pub is_directory_location: bool,
	pub is_probe: bool,
	pub has_enumeration: bool,
	pub is_write_candidate: bool,
	pub accesses: Vec<ReportedAccess>,
}

impl ObservedAccess {
	/// Folds a non-empty group of accesses to the same path into one summary.
	/// Panics if `accesses` is empty or mixes paths; the classifier is the
	/// only caller and both conditions are enforced by its grouping step.
	///
	/// `probes_as_enumerations` mirrors the orchestrator config flag of the
	/// same name (spec §4.E step 4): when set, a `Probe` against a path
	/// already known to be a directory counts as an enumeration in its own
	/// right, not only an explicit `Enumerate` request.
	pub fn fold(path: PathId, accesses: Vec<ReportedAccess>, probes_as_enumerations: bool) -> Self {
		assert!(!accesses.is_empty(), "fold requires at least one access");
		debug_assert!(accesses.iter().all(|a| a.path == path));

		let is_directory_location = accesses.iter().all(|a| a.is_directory_location);
		let is_probe = accesses
			.iter()
			.all(|a| a.requested.contains(RequestedAccess::PROBE) && a.requested == RequestedAccess::PROBE);
		let has_enumeration = accesses.iter().any(|a| a.requested.contains(RequestedAccess::ENUMERATE))
			|| (probes_as_enumerations
				&& is_directory_location
				&& accesses.iter().any(|a| a.requested.contains(RequestedAccess::PROBE)));
		let is_write_candidate = accesses.iter().any(|a| {
			a.requested.contains(RequestedAccess::WRITE)
				&& !matches!(a.operation, OperationKind::Create | OperationKind::Delete)
		});

		Self {
			path,
			is_directory_location,
			is_probe,
			has_enumeration,
			is_write_candidate,
			accesses,
		}
	}
}
