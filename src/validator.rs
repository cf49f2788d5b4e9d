//! Confirms required outputs exist and categorizes shared-opaque writes
//! (component F, spec §4.F).

use std::collections::HashSet;
use std::path::Path;

use crate::path_interner::{PathId, PathInterner};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileKind {
	File,
	Directory,
	Other,
}

/// Filesystem probe, injected so the validator is testable without a real
/// filesystem (spec §9 design notes: avoid singletons, parameterize for
/// tests).
pub trait FileProbe {
	/// Probes `path` without following a trailing symlink (spec §4.F:
	/// "each recorded write path is probed with `no-follow`").
	fn probe_no_follow(&self, path: &Path) -> Option<FileKind>;
}

pub struct RealFileProbe;
impl FileProbe for RealFileProbe {
	fn probe_no_follow(&self, path: &Path) -> Option<FileKind> {
		let metadata = std::fs::symlink_metadata(path).ok()?;
		Some(if metadata.is_dir() {
			FileKind::Directory
		} else if metadata.is_file() {
			FileKind::File
		} else {
			FileKind::Other
		})
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequiredOutputStatus {
	/// Observed as an access during the run; nothing further to check.
	Observed,
	/// Not observed, but exists on disk — spec §4.F: "flagged
	/// `OutputWithNoFileAccessFailed`".
	ExistsButNotObserved,
	/// Not observed and does not exist.
	Missing,
}

/// Checks every statically required output that is not standard-out/err
/// and was not observed as an access (spec §4.F first paragraph).
pub fn validate_required_outputs(
	required: &HashSet<PathId>,
	observed: &HashSet<PathId>,
	interner: &PathInterner,
	probe: &dyn FileProbe,
) -> Vec<(PathId, RequiredOutputStatus)> {
	required
		.iter()
		.filter(|path| !observed.contains(path))
		.map(|&path| {
			let status = match probe.probe_no_follow(&interner.to_path_buf(path)) {
				Some(_) => RequiredOutputStatus::ExistsButNotObserved,
				None => RequiredOutputStatus::Missing,
			};
			(path, status)
		})
		.collect()
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SharedOpaqueWriteClassification {
	TemporaryWrite,
	RequiredOutput,
	Discarded,
}

/// Classifies one recorded shared-opaque write path (spec §4.F second
/// paragraph): gone → temporary, file → required output, directory →
/// discarded (directories carry no tracked content).
pub fn classify_shared_opaque_write(
	path: PathId,
	interner: &PathInterner,
	probe: &dyn FileProbe,
) -> SharedOpaqueWriteClassification {
	match probe.probe_no_follow(&interner.to_path_buf(path)) {
		None => SharedOpaqueWriteClassification::TemporaryWrite,
		Some(FileKind::File) => SharedOpaqueWriteClassification::RequiredOutput,
		Some(FileKind::Directory) => SharedOpaqueWriteClassification::Discarded,
		Some(FileKind::Other) => SharedOpaqueWriteClassification::Discarded,
	}
}

/// Whether any declared output was flagged `ExistsButNotObserved`, the
/// condition `FinalStatus::OutputWithNoFileAccessFailed` reacts to
/// (spec §4.H).
pub fn has_output_with_no_file_access(statuses: &[(PathId, RequiredOutputStatus)]) -> bool {
	statuses.iter().any(|(_, status)| *status == RequiredOutputStatus::ExistsButNotObserved)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::path::PathBuf;

	struct FakeProbe(HashMap<PathBuf, FileKind>);
	impl FileProbe for FakeProbe {
		fn probe_no_follow(&self, path: &Path) -> Option<FileKind> {
			self.0.get(path).copied()
		}
	}

	#[test]
	fn missing_output_is_flagged_missing() {
		let interner = PathInterner::new();
		let out = interner.intern(Path::new("/out/f")).unwrap();
		let required: HashSet<PathId> = [out].into_iter().collect();
		let observed = HashSet::new();
		let probe = FakeProbe(HashMap::new());

		let statuses = validate_required_outputs(&required, &observed, &interner, &probe);
		assert_eq!(statuses, vec![(out, RequiredOutputStatus::Missing)]);
	}

	#[test]
	fn existing_unobserved_output_fails_with_no_file_access() {
		let interner = PathInterner::new();
		let out = interner.intern(Path::new("/out/f")).unwrap();
		let required: HashSet<PathId> = [out].into_iter().collect();
		let observed = HashSet::new();
		let probe = FakeProbe([(PathBuf::from("/out/f"), FileKind::File)].into_iter().collect());

		let statuses = validate_required_outputs(&required, &observed, &interner, &probe);
		assert!(has_output_with_no_file_access(&statuses));
	}

	#[test]
	fn observed_output_is_skipped() {
		let interner = PathInterner::new();
		let out = interner.intern(Path::new("/out/f")).unwrap();
		let required: HashSet<PathId> = [out].into_iter().collect();
		let observed: HashSet<PathId> = [out].into_iter().collect();
		let probe = FakeProbe(HashMap::new());

		let statuses = validate_required_outputs(&required, &observed, &interner, &probe);
		assert!(statuses.is_empty());
	}

	#[test]
	fn shared_opaque_write_classification() {
		let interner = PathInterner::new();
		let gone = interner.intern(Path::new("/out/so/gone.tmp")).unwrap();
		let file = interner.intern(Path::new("/out/so/keep.txt")).unwrap();
		let dir = interner.intern(Path::new("/out/so/subdir")).unwrap();
		let probe = FakeProbe(
			[
				(PathBuf::from("/out/so/keep.txt"), FileKind::File),
				(PathBuf::from("/out/so/subdir"), FileKind::Directory),
			]
			.into_iter()
			.collect(),
		);

		assert_eq!(
			classify_shared_opaque_write(gone, &interner, &probe),
			SharedOpaqueWriteClassification::TemporaryWrite
		);
		assert_eq!(
			classify_shared_opaque_write(file, &interner, &probe),
			SharedOpaqueWriteClassification::RequiredOutput
		);
		assert_eq!(
			classify_shared_opaque_write(dir, &interner, &probe),
			SharedOpaqueWriteClassification::Discarded
		);
	}
}
