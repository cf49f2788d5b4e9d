//! Per-path policy tree with cone-vs-node distinction (component C).
//!
//! Shaped after the teacher's `VirtualFSTree` in `sandbox.rs`: a trie keyed
//! by path segment, built by a single thread, then frozen. Where the
//! teacher collapses a `PartialOrd` over five entry kinds into "higher
//! permission wins", this tree keeps the cone/node scopes distinct and
//! defers collapsing them into `cone_policy`/`node_policy` until an
//! explicit `finalize()` pass, because spec §3 requires the *scopes* (not
//! just the resulting policy) to be inspectable before finalization.

pub mod wire;

use std::collections::HashMap;

use crate::error::ConstructionError;
use crate::path_interner::{PathId, PathInterner};
use crate::policy::{FileAccessPolicy, FileAccessScope};

pub struct ManifestNode {
	pub path_id: PathId,
	pub cone_scope: FileAccessScope,
	pub node_scope: Option<FileAccessScope>,
	pub cone_policy: FileAccessPolicy,
	pub node_policy: FileAccessPolicy,
	pub expected_usn: Option<u64>,
	pub children: HashMap<Box<str>, ManifestNode>,
	finalized: bool,
}

impl ManifestNode {
	fn new_root() -> Self {
		Self {
			path_id: PathId::ROOT,
			cone_scope: FileAccessScope::IDENTITY,
			node_scope: None,
			cone_policy: FileAccessPolicy::EMPTY,
			node_policy: FileAccessPolicy::EMPTY,
			expected_usn: None,
			children: HashMap::new(),
			finalized: false,
		}
	}
	fn new_child(path_id: PathId) -> Self {
		Self {
			path_id,
			cone_scope: FileAccessScope::IDENTITY,
			node_scope: None,
			cone_policy: FileAccessPolicy::EMPTY,
			node_policy: FileAccessPolicy::EMPTY,
			expected_usn: None,
			children: HashMap::new(),
			finalized: false,
		}
	}
}

/// A per-pip policy tree over absolute paths. Mutable during construction,
/// frozen on first `serialize_wire` call (spec §3 Manifest lifecycle).
pub struct ManifestTree {
	root: ManifestNode,
	finalized: bool,
	frozen: bool,
}

impl Default for ManifestTree {
	fn default() -> Self {
		Self::new()
	}
}

impl ManifestTree {
	pub fn new() -> Self {
		Self {
			root: ManifestNode::new_root(),
			finalized: false,
			frozen: false,
		}
	}

	pub fn is_frozen(&self) -> bool {
		self.frozen
	}

	/// Applies a cone scope rooted at `path`. `PathId::ROOT` applies to the
	/// synthetic root, matching "If `path` is the invalid/empty identifier,
	/// applies to the synthetic root" in spec §4.C.
	pub fn add_scope(
		&mut self,
		interner: &PathInterner,
		path: PathId,
		scope: FileAccessScope,
	) -> Result<(), ConstructionError> {
		if self.finalized {
			return Err(ConstructionError::AlreadyFinalized);
		}
		let node = self.materialize_path(interner, path);
		node.cone_scope = node.cone_scope.then(scope);
		Ok(())
	}

	/// Applies a node-local scope to exactly `path`.
	pub fn add_path(
		&mut self,
		interner: &PathInterner,
		path: PathId,
		scope: FileAccessScope,
		expected_usn: Option<u64>,
	) -> Result<(), ConstructionError> {
		if self.finalized {
			return Err(ConstructionError::AlreadyFinalized);
		}
		if path.is_root() {
			return Err(ConstructionError::InvalidPath { path });
		}
		let node = self.materialize_path(interner, path);
		node.node_scope = Some(match node.node_scope {
			Some(existing) => existing.then(scope),
			None => scope,
		});
		if let Some(new_usn) = expected_usn {
			match node.expected_usn {
				Some(existing) if existing != 0 && new_usn != 0 && existing != new_usn => {
					return Err(ConstructionError::ConflictingUsn {
						existing,
						new: new_usn,
					});
				}
				Some(0) | None => node.expected_usn = Some(new_usn),
				Some(_) => (),
			}
		}
		Ok(())
	}

	fn materialize_path(&mut self, interner: &PathInterner, path: PathId) -> &mut ManifestNode {
		if path.is_root() {
			return &mut self.root;
		}
		let chain: Vec<PathId> = interner.ancestors_bottom_up(path).collect();
		let mut node = &mut self.root;
		for &id in chain.iter().rev() {
			if id.is_root() {
				continue;
			}
			let segment = interner.last_segment(id).expect("non-root path has a segment");
			node = node
				.children
				.entry(segment)
				.or_insert_with(|| ManifestNode::new_child(id));
		}
		node
	}

	/// Bottom-up policy computation. Idempotent.
	pub fn finalize(&mut self) {
		if self.finalized {
			return;
		}
		Self::finalize_node(&mut self.root, FileAccessPolicy::EMPTY);
		self.finalized = true;
	}

	fn finalize_node(node: &mut ManifestNode, parent_cone_policy: FileAccessPolicy) {
		node.cone_policy = node.cone_scope.apply(parent_cone_policy);
		node.node_policy = match node.node_scope {
			Some(scope) => scope.apply(node.cone_policy),
			None => node.cone_policy,
		};
		node.finalized = true;
		for child in node.children.values_mut() {
			Self::finalize_node(child, node.cone_policy);
		}
	}

	/// Returns the deepest ancestor of `path` (inclusive) that has an
	/// explicit node, and its finalized `node_policy`. Finalizes the tree
	/// if it has not been finalized already.
	pub fn find_policy_for(
		&mut self,
		interner: &PathInterner,
		path: PathId,
	) -> (PathId, FileAccessPolicy) {
		self.finalize();
		let chain: Vec<PathId> = interner.ancestors_bottom_up(path).collect();

		let mut node = &self.root;
		let mut deepest_explicit = (PathId::ROOT, self.root.node_policy);
		for &id in chain.iter().rev().skip(1) {
			let segment = interner.last_segment(id).expect("non-root path has a segment");
			let Some(child) = node.children.get(segment.as_ref()) else {
				break;
			};
			node = child;
			deepest_explicit = (id, node.node_policy);
		}
		deepest_explicit
	}

	/// Pre-order textual dump, re-parsing the wire bytes as the single
	/// source of truth (spec §4.C `describe()` contract).
	pub fn describe(&mut self, interner: &PathInterner) -> String {
		self.finalize();
		let bytes = wire::serialize(&self.root);
		self.frozen = true;
		let hydrated = wire::deserialize(&bytes);
		let mut out = String::new();
		Self::describe_node(&hydrated, interner, 0, &mut out);
		out
	}

	fn describe_node(node: &wire::HydratedNode, interner: &PathInterner, depth: usize, out: &mut String) {
		let label = if node.path_id.is_root() {
			"/".to_string()
		} else {
			interner
				.last_segment(node.path_id)
				.map(|s| s.to_string())
				.unwrap_or_default()
		};
		out.push_str(&"  ".repeat(depth));
		out.push_str(&format!(
			"{label} cone={} node={}\n",
			node.cone_policy, node.node_policy
		));
		for child in &node.children {
			Self::describe_node(child, interner, depth + 1, out);
		}
	}

	/// Serializes the tree and marks it frozen, per spec §3 lifecycle.
	pub fn serialize_wire(&mut self, writer: &mut impl std::io::Write) -> std::io::Result<()> {
		self.finalize();
		let bytes = wire::serialize(&self.root);
		self.frozen = true;
		writer.write_all(&bytes)
	}

	pub fn root(&self) -> &ManifestNode {
		&self.root
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn scope(mask: FileAccessPolicy, values: FileAccessPolicy) -> FileAccessScope {
		FileAccessScope::new(mask, values)
	}

	#[test]
	fn scenario_1_empty_manifest_deny_all() {
		let interner = PathInterner::new();
		let mut tree = ManifestTree::new();
		tree
			.add_scope(
				&interner,
				PathId::ROOT,
				scope(FileAccessPolicy::from_bits(0xFFFF), FileAccessPolicy::EMPTY),
			)
			.unwrap();
		tree.finalize();

		let path = interner.intern(std::path::Path::new("/tmp/x")).unwrap();
		let (manifest_path, policy) = tree.find_policy_for(&interner, path);
		assert_eq!(manifest_path, PathId::ROOT);
		assert_eq!(policy.bits(), 0);
	}

	#[test]
	fn scenario_2_single_allow_cone() {
		let interner = PathInterner::new();
		let mut tree = ManifestTree::new();
		let src = interner.intern(std::path::Path::new("/src")).unwrap();
		tree
			.add_scope(&interner, src, scope(!FileAccessPolicy::EMPTY, FileAccessPolicy::ALLOW_READ))
			.unwrap();

		let inner = interner.intern(std::path::Path::new("/src/a/b.h")).unwrap();
		let (_, policy) = tree.find_policy_for(&interner, inner);
		assert!(policy.contains(FileAccessPolicy::ALLOW_READ));

		let outside = interner.intern(std::path::Path::new("/etc/hosts")).unwrap();
		let (manifest_path, _) = tree.find_policy_for(&interner, outside);
		assert_eq!(manifest_path, PathId::ROOT);
	}

	#[test]
	fn scenario_3_output_declaration_roundtrip() {
		let interner = PathInterner::new();
		let mut tree = ManifestTree::new();
		let out_f = interner.intern(std::path::Path::new("/out/f")).unwrap();
		let allow_all_report = FileAccessPolicy::ALLOW_READ
			| FileAccessPolicy::ALLOW_WRITE
			| FileAccessPolicy::ALLOW_CREATE_DIRECTORY
			| FileAccessPolicy::REPORT_ACCESS;
		tree
			.add_path(
				&interner,
				out_f,
				scope(!FileAccessPolicy::REPORT_ACCESS, allow_all_report),
				None,
			)
			.unwrap();

		let mut bytes = Vec::new();
		tree.serialize_wire(&mut bytes).unwrap();

		let hydrated = wire::deserialize(&bytes);
		let found = wire::find_in_hydrated(&hydrated, &interner, out_f);
		assert_eq!(found.unwrap().bits(), allow_all_report.bits());
	}

	#[test]
	fn idempotent_add_scope() {
		let interner = PathInterner::new();
		let mut tree = ManifestTree::new();
		let p = interner.intern(std::path::Path::new("/a")).unwrap();
		let s = scope(!FileAccessPolicy::EMPTY, FileAccessPolicy::ALLOW_READ);
		tree.add_scope(&interner, p, s).unwrap();
		tree.add_scope(&interner, p, s).unwrap();
		tree.finalize();
		let (_, policy) = tree.find_policy_for(&interner, p);
		assert!(policy.contains(FileAccessPolicy::ALLOW_READ));
	}

	#[test]
	fn mutation_after_finalize_is_an_error() {
		let interner = PathInterner::new();
		let mut tree = ManifestTree::new();
		tree.finalize();
		let p = interner.intern(std::path::Path::new("/a")).unwrap();
		let err = tree.add_scope(&interner, p, FileAccessScope::IDENTITY);
		assert!(matches!(err, Err(ConstructionError::AlreadyFinalized)));
	}

	#[test]
	fn conflicting_usn_is_an_error() {
		let interner = PathInterner::new();
		let mut tree = ManifestTree::new();
		let p = interner.intern(std::path::Path::new("/a")).unwrap();
		tree
			.add_path(&interner, p, FileAccessScope::IDENTITY, Some(5))
			.unwrap();
		let err = tree.add_path(&interner, p, FileAccessScope::IDENTITY, Some(6));
		assert!(matches!(err, Err(ConstructionError::ConflictingUsn { existing: 5, new: 6 })));
	}

	#[test]
	fn sibling_addition_does_not_change_lookup() {
		let interner = PathInterner::new();
		let a = interner.intern(std::path::Path::new("/a")).unwrap();
		let b = interner.intern(std::path::Path::new("/b")).unwrap();

		let mut without_sibling = ManifestTree::new();
		without_sibling
			.add_scope(&interner, a, scope(!FileAccessPolicy::EMPTY, FileAccessPolicy::ALLOW_READ))
			.unwrap();
		let (before_path, before_policy) = without_sibling.find_policy_for(&interner, a);

		let mut with_sibling = ManifestTree::new();
		with_sibling
			.add_scope(&interner, a, scope(!FileAccessPolicy::EMPTY, FileAccessPolicy::ALLOW_READ))
			.unwrap();
		with_sibling
			.add_scope(&interner, b, scope(!FileAccessPolicy::EMPTY, FileAccessPolicy::ALLOW_WRITE))
			.unwrap();
		let (after_path, after_policy) = with_sibling.find_policy_for(&interner, a);

		assert_eq!(before_path, after_path);
		assert_eq!(before_policy.bits(), after_policy.bits());
	}
}
