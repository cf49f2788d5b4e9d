//! Maps reported accesses to {allowed, unexpected, explicit-report,
//! shared-dynamic-write} using the Manifest Tree and static pip
//! declarations (component E, spec §4.E).

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::access::{ObservedAccess, OperationKind, ReportedAccess};
use crate::config::OrchestratorConfig;
use crate::path_interner::{PathId, PathInterner};

/// A declared input directory with a fixed, finite set of contained files
/// known at graph time (spec GLOSSARY: "Sealed directory").
pub struct SealedDirectory {
	pub root: PathId,
	pub contents: HashSet<PathId>,
}

/// A declared output directory whose contents are discovered by
/// observation (spec GLOSSARY: "Shared-opaque directory"). `exclusions`
/// are paths the pip does not own even though they fall under `root`
/// (spec §4.E step 5: "a path inside an exclusion is not owned").
pub struct SharedOpaqueRoot {
	pub root: PathId,
	pub exclusions: HashSet<PathId>,
}

/// Resolves intermediate directory symlinks along a path, synthesizing one
/// read access per traversed link (spec §4.E step 2: "so that changes to
/// the link structure invalidate caches"). Injected so tests can supply a
/// fake filesystem instead of touching the real one.
pub trait SymlinkResolver {
	/// Returns the `PathId`s of every directory symlink traversed on the
	/// way to `path`, in traversal order.
	fn traversed_symlinks(&self, interner: &PathInterner, path: PathId) -> Vec<PathId>;
}

/// Does no resolution; used when `resolve_intermediate_symlinks` is off.
pub struct NoopSymlinkResolver;
impl SymlinkResolver for NoopSymlinkResolver {
	fn traversed_symlinks(&self, _interner: &PathInterner, _path: PathId) -> Vec<PathId> {
		Vec::new()
	}
}

/// Static declarations the classifier checks reported accesses against.
pub struct Declarations<'a> {
	pub inputs: &'a HashSet<PathId>,
	pub sealed_directories: &'a [SealedDirectory],
	pub outputs: &'a HashSet<PathId>,
	pub shared_opaque_roots: &'a [SharedOpaqueRoot],
}

impl Declarations<'_> {
	fn is_declared_input(&self, path: PathId) -> bool {
		self.inputs.contains(&path) || self.sealed_directories.iter().any(|sealed| sealed.contents.contains(&path))
	}

	/// Innermost (deepest) shared-opaque root that owns `path`, if any, per
	/// spec §4.E step 5's "bottom-up search; tie-break: innermost root".
	fn owning_shared_opaque_root(&self, interner: &PathInterner, path: PathId) -> Option<PathId> {
		self
			.shared_opaque_roots
			.iter()
			.filter(|root| interner.is_within(path, root.root))
			.filter(|root| !root.exclusions.iter().any(|&excluded| interner.is_within(path, excluded)))
			.map(|root| root.root)
			.max_by_key(|&root_id| interner.ancestors_bottom_up(root_id).count())
	}
}

/// Outcome of classifying one job's full access stream.
pub struct ClassificationResult {
	/// Per-path summaries for the fingerprint/cache layer (out of scope
	/// here); excludes anything attributed to a shared-opaque root.
	pub observed: Vec<ObservedAccess>,
	/// Shared-opaque root → write paths recorded under it (spec §4.F
	/// consumes this to categorize temporary vs. required-output writes).
	pub shared_opaque_writes: HashMap<PathId, Vec<PathId>>,
	/// Accesses denied or indeterminate (spec §4.E step 7), for the
	/// allowlist check an out-of-scope collaborator performs.
	pub unexpected: Vec<ReportedAccess>,
	/// Paths dropped by an ignore rule (spec §4.E step 3), kept only for
	/// diagnostics/logging, never surfaced as observed or unexpected.
	pub ignored_count: usize,
}

fn file_name(interner: &PathInterner, path: PathId) -> String {
	interner.last_segment(path).map(|s| s.to_string()).unwrap_or_default()
}

/// Ignore rules of spec §4.E step 3: code-coverage side-effect files,
/// tool-temp files matching documented patterns, and injected helper DLLs.
fn is_ignored(interner: &PathInterner, path: PathId, config: &OrchestratorConfig) -> bool {
	let name = file_name(interner, path);
	let lower = name.to_ascii_lowercase();

	if config.ignored_dll_names.contains(&lower) {
		return true;
	}
	if let Some(ext) = name.rsplit('.').next() {
		if name.contains('.') && config.ignored_extensions.contains(&ext.to_ascii_lowercase()) {
			return true;
		}
	}
	config.ignored_filename_prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
}

/// Classifies one job's access stream (spec §4.E). `resolver` synthesizes
/// extra read accesses for traversed directory symlinks when
/// `config.resolve_intermediate_symlinks` is set.
pub fn classify(
	accesses: Vec<ReportedAccess>,
	interner: &PathInterner,
	declarations: &Declarations<'_>,
	config: &OrchestratorConfig,
	resolver: &dyn SymlinkResolver,
) -> ClassificationResult {
	let mut unexpected = Vec::new();
	let mut by_path: HashMap<PathId, Vec<ReportedAccess>> = HashMap::new();
	let mut ignored_count = 0;

	for access in accesses {
		if matches!(
			access.operation,
			OperationKind::ProcessStart | OperationKind::ProcessExit | OperationKind::ProcessBreakaway
		) {
			// lifecycle events are consumed by the report channel's liveness
			// tracker (component D); the classifier only sees file accesses.
			continue;
		}

		if is_ignored(interner, access.path, config) {
			trace!(path = %file_name(interner, access.path), "dropped by ignore rule");
			ignored_count += 1;
			continue;
		}

		if access.is_unexpected() {
			unexpected.push(access.clone());
		}

		if config.resolve_intermediate_symlinks {
			for symlink_path in resolver.traversed_symlinks(interner, access.path) {
				by_path.entry(symlink_path).or_default().push(synthesized_symlink_read(symlink_path, access.pid, access.parent_pid));
			}
		}

		by_path.entry(access.path).or_default().push(access);
	}

	let mut observed = Vec::new();
	let mut shared_opaque_writes: HashMap<PathId, Vec<PathId>> = HashMap::new();

	for (path, path_accesses) in by_path {
		let summary = ObservedAccess::fold(path, path_accesses, config.probes_as_enumerations);

		if summary.is_write_candidate {
			if let Some(root) = declarations.owning_shared_opaque_root(interner, path) {
				shared_opaque_writes.entry(root).or_default().push(path);
				continue;
			}
		}

		observed.push(summary);
	}

	observed.sort_by_key(|o| o.path);
	for writes in shared_opaque_writes.values_mut() {
		writes.sort();
	}

	ClassificationResult {
		observed,
		shared_opaque_writes,
		unexpected,
		ignored_count,
	}
}

fn synthesized_symlink_read(path: PathId, pid: u32, parent_pid: u32) -> ReportedAccess {
	use crate::access::{DecisionStatus, RequestedAccess};
	ReportedAccess {
		operation: OperationKind::Read,
		pid,
		parent_pid,
		requested: RequestedAccess::READ,
		status: DecisionStatus::Allowed,
		path,
		path_truncated: false,
		is_directory_location: true,
		explicit_report: false,
		requested_usn: None,
		error_code: None,
	}
}

/// Whether `path` is a declared input the classifier should not treat as
/// an unexpected write target (used by the orchestrator when composing
/// manifest scopes for declared inputs, spec §4.G step 5).
pub fn is_declared_input(declarations: &Declarations<'_>, path: PathId) -> bool {
	declarations.is_declared_input(path)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::access::{DecisionStatus, RequestedAccess};
	use std::path::Path;

	fn access(path: PathId, op: OperationKind, requested: RequestedAccess, status: DecisionStatus) -> ReportedAccess {
		ReportedAccess {
			operation: op,
			pid: 100,
			parent_pid: 1,
			requested,
			status,
			path,
			path_truncated: false,
			is_directory_location: false,
			explicit_report: false,
			requested_usn: None,
			error_code: None,
		}
	}

	#[test]
	fn scenario_6_shared_opaque_write_excluded_from_observed() {
		let interner = PathInterner::new();
		let so_root = interner.intern(Path::new("/out/so")).unwrap();
		let write_path = interner.intern(Path::new("/out/so/dir/a.txt")).unwrap();

		let roots = vec![SharedOpaqueRoot {
			root: so_root,
			exclusions: HashSet::new(),
		}];
		let inputs = HashSet::new();
		let outputs = HashSet::new();
		let sealed = Vec::new();
		let declarations = Declarations {
			inputs: &inputs,
			sealed_directories: &sealed,
			outputs: &outputs,
			shared_opaque_roots: &roots,
		};
		let config = OrchestratorConfig::default();

		let accesses = vec![access(
			write_path,
			OperationKind::Write,
			RequestedAccess::WRITE,
			DecisionStatus::Allowed,
		)];
		let result = classify(accesses, &interner, &declarations, &config, &NoopSymlinkResolver);

		assert!(result.observed.iter().all(|o| o.path != write_path));
		assert_eq!(result.shared_opaque_writes.get(&so_root).unwrap(), &vec![write_path]);
	}

	#[test]
	fn injected_dll_pattern_is_never_observed() {
		let interner = PathInterner::new();
		let dll_path = interner.intern(Path::new("/windows/system32/mdnsNSP.DLL")).unwrap();
		let inputs = HashSet::new();
		let outputs = HashSet::new();
		let sealed = Vec::new();
		let roots = Vec::new();
		let declarations = Declarations {
			inputs: &inputs,
			sealed_directories: &sealed,
			outputs: &outputs,
			shared_opaque_roots: &roots,
		};
		let config = OrchestratorConfig::default();

		let accesses = vec![access(dll_path, OperationKind::Read, RequestedAccess::READ, DecisionStatus::Allowed)];
		let result = classify(accesses, &interner, &declarations, &config, &NoopSymlinkResolver);

		assert!(result.observed.is_empty());
		assert_eq!(result.ignored_count, 1);
	}

	#[test]
	fn denied_access_is_collected_as_unexpected() {
		let interner = PathInterner::new();
		let path = interner.intern(Path::new("/secret/file")).unwrap();
		let inputs = HashSet::new();
		let outputs = HashSet::new();
		let sealed = Vec::new();
		let roots = Vec::new();
		let declarations = Declarations {
			inputs: &inputs,
			sealed_directories: &sealed,
			outputs: &outputs,
			shared_opaque_roots: &roots,
		};
		let config = OrchestratorConfig::default();

		let accesses = vec![access(path, OperationKind::Read, RequestedAccess::READ, DecisionStatus::Denied)];
		let result = classify(accesses, &interner, &declarations, &config, &NoopSymlinkResolver);

		assert_eq!(result.unexpected.len(), 1);
		assert_eq!(result.observed.len(), 1); // still folded into observed for the fingerprint layer
	}

	#[test]
	fn innermost_shared_opaque_root_wins_tie_break() {
		let interner = PathInterner::new();
		let outer = interner.intern(Path::new("/out")).unwrap();
		let inner = interner.intern(Path::new("/out/nested")).unwrap();
		let write_path = interner.intern(Path::new("/out/nested/f.txt")).unwrap();

		let roots = vec![
			SharedOpaqueRoot { root: outer, exclusions: HashSet::new() },
			SharedOpaqueRoot { root: inner, exclusions: HashSet::new() },
		];
		let inputs = HashSet::new();
		let outputs = HashSet::new();
		let sealed = Vec::new();
		let declarations = Declarations {
			inputs: &inputs,
			sealed_directories: &sealed,
			outputs: &outputs,
			shared_opaque_roots: &roots,
		};
		let config = OrchestratorConfig::default();

		let accesses = vec![access(write_path, OperationKind::Write, RequestedAccess::WRITE, DecisionStatus::Allowed)];
		let result = classify(accesses, &interner, &declarations, &config, &NoopSymlinkResolver);

		assert!(result.shared_opaque_writes.contains_key(&inner));
		assert!(!result.shared_opaque_writes.contains_key(&outer));
	}

	#[test]
	fn exclusion_removes_ownership() {
		let interner = PathInterner::new();
		let root = interner.intern(Path::new("/out/so")).unwrap();
		let excluded = interner.intern(Path::new("/out/so/scratch")).unwrap();
		let write_path = interner.intern(Path::new("/out/so/scratch/tmp.txt")).unwrap();

		let mut exclusions = HashSet::new();
		exclusions.insert(excluded);
		let roots = vec![SharedOpaqueRoot { root, exclusions }];
		let inputs = HashSet::new();
		let outputs = HashSet::new();
		let sealed = Vec::new();
		let declarations = Declarations {
			inputs: &inputs,
			sealed_directories: &sealed,
			outputs: &outputs,
			shared_opaque_roots: &roots,
		};
		let config = OrchestratorConfig::default();

		let accesses = vec![access(write_path, OperationKind::Write, RequestedAccess::WRITE, DecisionStatus::Allowed)];
		let result = classify(accesses, &interner, &declarations, &config, &NoopSymlinkResolver);

		assert!(result.shared_opaque_writes.is_empty());
		assert_eq!(result.observed.len(), 1);
	}
}
