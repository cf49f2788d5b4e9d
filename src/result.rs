//! The data model produced at the end of one job (spec §3 "Execution
//! Result").

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::access::{ObservedAccess, ReportedAccess};
use crate::path_interner::PathId;
use crate::retry::FinalStatus;
use crate::validator::SharedOpaqueWriteClassification;

/// Counters the caller's fingerprint/cache layer consumes (out of scope
/// here, but the Orchestrator assembles them since it is the only
/// component that sees the full run).
#[derive(Clone, Copy, Default, Debug, Serialize)]
pub struct AccountingInfo {
	pub file_accesses_observed: u64,
	pub file_accesses_ignored: u64,
	pub surviving_child_processes: u32,
	pub peak_memory_bytes: Option<u64>,
}

/// Condensed, serializable view of an [`ExecutionOutcome`] for log sinks and
/// external tooling that want a JSON line rather than the full in-memory
/// access lists.
#[derive(Serialize)]
pub struct ExecutionSummary {
	pub status: String,
	pub exit_code: i32,
	pub wall_clock_ms: u128,
	pub warning_count: u32,
	pub accounting: AccountingInfo,
	pub unexpected_count: usize,
}

/// Outcome of running one job (spec §3). `observed` is kept sorted by
/// `PathId` (the Access Classifier already sorts it, spec §4.E).
pub struct ExecutionOutcome {
	pub status: FinalStatus,
	pub exit_code: i32,
	pub wall_clock: Duration,
	pub warning_count: u32,
	pub accounting: AccountingInfo,
	pub observed: Vec<ObservedAccess>,
	/// Shared-opaque root → each write path recorded under it, no-follow
	/// probed (spec §4.F second paragraph) into temporary/required-output/
	/// discarded (spec §8 scenario 6: `/out/so -> { /out/so/dir/a.txt :
	/// Required }`).
	pub shared_opaque_writes: HashMap<PathId, Vec<(PathId, SharedOpaqueWriteClassification)>>,
	pub unexpected: Vec<ReportedAccess>,
}

impl ExecutionOutcome {
	pub fn succeeded(&self) -> bool {
		matches!(self.status, FinalStatus::Succeeded)
	}

	pub fn summary(&self) -> ExecutionSummary {
		ExecutionSummary {
			status: format!("{:?}", self.status),
			exit_code: self.exit_code,
			wall_clock_ms: self.wall_clock.as_millis(),
			warning_count: self.warning_count,
			accounting: self.accounting,
			unexpected_count: self.unexpected.len(),
		}
	}

	/// Renders [`Self::summary`] as a single JSON line, for log sinks that
	/// want a terse per-pip record rather than the full access lists.
	pub fn summary_json(&self) -> serde_json::Result<String> {
		serde_json::to_string(&self.summary())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn succeeded_reflects_status() {
		let outcome = ExecutionOutcome {
			status: FinalStatus::Succeeded,
			exit_code: 0,
			wall_clock: Duration::from_secs(1),
			warning_count: 0,
			accounting: AccountingInfo::default(),
			observed: Vec::new(),
			shared_opaque_writes: HashMap::new(),
			unexpected: Vec::new(),
		};
		assert!(outcome.succeeded());

		let failed = ExecutionOutcome {
			status: FinalStatus::ExecutionFailed,
			..outcome
		};
		assert!(!failed.succeeded());
	}

	#[test]
	fn summary_json_includes_status_and_counts() {
		let outcome = ExecutionOutcome {
			status: FinalStatus::Succeeded,
			exit_code: 0,
			wall_clock: Duration::from_millis(250),
			warning_count: 2,
			accounting: AccountingInfo {
				file_accesses_observed: 5,
				..AccountingInfo::default()
			},
			observed: Vec::new(),
			shared_opaque_writes: HashMap::new(),
			unexpected: vec![],
		};
		let json = outcome.summary_json().unwrap();
		assert!(json.contains("\"status\":\"Succeeded\""));
		assert!(json.contains("\"warning_count\":2"));
		assert!(json.contains("\"file_accesses_observed\":5"));
	}
}
