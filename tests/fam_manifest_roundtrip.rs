//! Cross-module integration: a manifest tree built, finalized and embedded
//! in a full FAM byte blob survives a write-to-disk/read-back round trip
//! (spec §8 "Serialize-then-deserialize round-trips", exercised here across
//! the whole FAM rather than just the manifest-tree block).

use std::path::Path;

use pip_sandbox::config::BreakawayRule;
use pip_sandbox::fam::{self, DirectoryTranslation, FamHeader, ManifestExtraFlags, ManifestFlags, ReportBlockValue};
use pip_sandbox::manifest::{wire, ManifestTree};
use pip_sandbox::path_interner::PathInterner;
use pip_sandbox::policy::{FileAccessPolicy, FileAccessScope};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

fn allow_read_write() -> FileAccessPolicy {
	FileAccessPolicy::ALLOW_READ | FileAccessPolicy::ALLOW_WRITE | FileAccessPolicy::REPORT_ACCESS
}

#[test]
fn fam_with_embedded_manifest_round_trips_through_a_file() {
	let interner = PathInterner::new();
	let mut tree = ManifestTree::new();

	let src = interner.intern(Path::new("/src")).unwrap();
	tree
		.add_scope(&interner, src, FileAccessScope::new(!FileAccessPolicy::EMPTY, FileAccessPolicy::ALLOW_READ))
		.unwrap();
	let out = interner.intern(Path::new("/out/result.bin")).unwrap();
	tree
		.add_path(&interner, out, FileAccessScope::new(!FileAccessPolicy::EMPTY, allow_read_write()), Some(7))
		.unwrap();
	tree.finalize();

	let mut tree_bytes = Vec::new();
	tree.serialize_wire(&mut tree_bytes).unwrap();

	let header = FamHeader {
		injection_timeout_minutes: 15,
		breakaway_rules: vec![BreakawayRule {
			process_name: "mspdbsrv.exe".to_string(),
			required_cmdline_substring: None,
			ignore_case: true,
		}],
		directory_translations: vec![DirectoryTranslation {
			source: "/mnt/real".into(),
			target: "/mnt/virtual".into(),
		}],
		error_dump_location: None,
		flags: ManifestFlags::REPORT_FILE_ACCESSES | ManifestFlags::MONITOR_CHILD_PROCESSES,
		extra_flags: ManifestExtraFlags::ENABLE_LINUX_PTRACE,
		pip_id: 42,
		report_block: Some(ReportBlockValue::Path("/tmp/job-42/report.fifo".to_string())),
		injected_dll_names: vec!["mdnsNSP.DLL".to_string()],
		process_substitution: None,
	};

	let fam_bytes = fam::serialize_fam(&header, &tree_bytes, false);

	let dir = tempdir().unwrap();
	let fam_path = dir.path().join("fam.bin");
	std::fs::write(&fam_path, &fam_bytes).unwrap();

	let read_back = std::fs::read(&fam_path).unwrap();
	let (decoded_header, decoded_tree_bytes) = fam::deserialize_fam(&read_back, false).unwrap();

	assert_eq!(decoded_header.pip_id, 42);
	assert_eq!(decoded_header.breakaway_rules, header.breakaway_rules);
	assert_eq!(decoded_header.directory_translations, header.directory_translations);
	assert_eq!(decoded_header.flags, header.flags);
	assert_eq!(decoded_header.injected_dll_names, header.injected_dll_names);
	assert_eq!(decoded_tree_bytes, tree_bytes.as_slice());

	let hydrated = wire::deserialize(decoded_tree_bytes);
	let found = wire::find_in_hydrated(&hydrated, &interner, out).unwrap();
	assert_eq!(found.bits(), allow_read_write().bits());

	// root-relative lookup still falls back to the cone policy granted to /src
	let nested = interner.intern(Path::new("/src/deep/header.h")).unwrap();
	let via_src = wire::find_in_hydrated(&hydrated, &interner, nested).unwrap();
	assert!(via_src.contains(FileAccessPolicy::ALLOW_READ));
}
