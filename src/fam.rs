//! Binary File Access Manifest layout beyond the tree block itself: the
//! fixed-order header blocks a real enforcement layer reads before it gets
//! to `manifest::wire`'s tree bytes, and the environment-variable contract
//! the host and sandbox share (component I, spec §6).
//!
//! # Resolved ambiguity: debug-build magic cookies
//!
//! spec §6 says each block is prefixed with "a 32-bit magic cookie" in
//! non-release builds but does not pin down the cookie values. This
//! implementation uses a distinct, documented constant per block
//! (`0xC00C_0000 | block_index`) so a hex dump unambiguously identifies
//! which block a misaligned read landed in — the same spirit as the debug
//! tag spec §4.C mentions for manifest nodes, applied at the header level.
//!
//! # Resolved ambiguity: substitute-process-shim presence
//!
//! spec §6 block 11 leads with a "shim-all" flag but does not say how a
//! reader tells "no shim configured" apart from "shim configured with
//! `shim_all = false`". This implementation adds an explicit presence
//! word ahead of `shim_all` so the two cases are unambiguous on the wire.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use crate::config::BreakawayRule;

/// `__BUILDXL_FAM_PATH` — absolute path to the serialized FAM the sandboxed
/// tool must load (spec §6).
pub const ENV_FAM_PATH: &str = "__BUILDXL_FAM_PATH";
/// `__BUILDXL_MAX_CONCURRENCY` — optional scheduler concurrency hint.
pub const ENV_MAX_CONCURRENCY: &str = "__BUILDXL_MAX_CONCURRENCY";
/// `__BUILDXL_RING_BUFFER_SIZE_MULTIPLIER` — optional sandbox buffer hint.
pub const ENV_RING_BUFFER_SIZE_MULTIPLIER: &str = "__BUILDXL_RING_BUFFER_SIZE_MULTIPLIER";

const DEBUG_MARKER_DEBUG: u32 = 0xDB60_0001;
const DEBUG_MARKER_RELEASE: u32 = 0xDB60_0000;

fn cookie_for_block(block_index: u32) -> u32 {
	0xC00C_0000 | block_index
}

macro_rules! flag_set {
	($vis:vis $name:ident { $($bit_name:ident = $bit:expr;)* }) => {
		#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
		$vis struct $name(u32);
		impl $name {
			pub const EMPTY: $name = $name(0);
			$(pub const $bit_name: $name = $name($bit);)*

			pub fn set(self, other: $name) -> $name {
				$name(self.0 | other.0)
			}
			pub fn contains(self, other: $name) -> bool {
				self.0 & other.0 == other.0
			}
			pub const fn bits(self) -> u32 {
				self.0
			}
			pub const fn from_bits(bits: u32) -> $name {
				$name(bits)
			}
		}
		impl std::ops::BitOr for $name {
			type Output = $name;
			fn bitor(self, rhs: $name) -> $name {
				self.set(rhs)
			}
		}
	};
}

flag_set!(pub ManifestFlags {
	BREAK_ON_ACCESS_DENIED = 0x1;
	FAIL_UNEXPECTED = 0x2;
	DIAGNOSTIC_MESSAGES = 0x4;
	REPORT_FILE_ACCESSES = 0x8;
	REPORT_UNEXPECTED = 0x10;
	MONITOR_NT_CREATE_FILE = 0x20;
	MONITOR_CHILD_PROCESSES = 0x40;
	IGNORE_CODE_COVERAGE = 0x80;
	REPORT_PROCESS_ARGS = 0x100;
	FORCE_READ_ONLY_FOR_READ_WRITE = 0x200;
	IGNORE_REPARSE_POINTS = 0x400;
	NORMALIZE_READ_TIMESTAMPS = 0x800;
	IGNORE_ZW_RENAME = 0x1000;
	IGNORE_SET_FILE_INFO_BY_HANDLE = 0x2000;
	USE_LARGE_NT_CLOSE_PREALLOC = 0x4000;
	USE_EXTRA_THREAD_TO_DRAIN_NT_CLOSE = 0x8000;
	DISABLE_DETOURS = 0x10000;
	LOG_PROCESS_DATA = 0x20000;
	IGNORE_GET_FINAL_PATH_NAME_BY_HANDLE = 0x40000;
	LOG_PROCESS_DETOURING_STATUS = 0x80000;
	HARD_EXIT_ON_ERROR_IN_DETOURS = 0x100000;
	CHECK_MESSAGE_COUNT = 0x200000;
	IGNORE_ZW_OTHER_FILE_INFO = 0x400000;
	MONITOR_ZW_CREATE_OPEN_QUERY_FILE = 0x800000;
	IGNORE_NON_CREATE_FILE_REPARSE = 0x1000000;
	IGNORE_CREATE_PROCESS_REPORT = 0x2000000;
	USE_LARGE_ENUMERATION_BUFFER = 0x4000000;
	IGNORE_PRELOADED_DLLS = 0x8000000;
	ENFORCE_ON_DIRECTORY_CREATION = 0x10000000;
	PROBE_DIR_SYMLINK_AS_DIRECTORY = 0x20000000;
	IGNORE_FULL_REPARSE_POINT_RESOLVING = 0x40000000;
});

flag_set!(pub ManifestExtraFlags {
	EXPLICITLY_REPORT_DIRECTORY_PROBES = 0x1;
	PRESERVE_FILE_SHARING = 0x2;
	ENABLE_LINUX_PTRACE = 0x4;
	ENABLE_LINUX_LOGGING = 0x8;
	ALWAYS_REMOTE_INJECT_FROM_32BIT = 0x10;
	UNCONDITIONAL_PTRACE = 0x20;
	IGNORE_DEVICE_IO_CONTROL_GET_REPARSE_POINT = 0x40;
	IGNORE_UNTRACKED_PATHS_IN_REPARSE_POINT_RESOLVING = 0x80;
});

impl ManifestExtraFlags {
	/// `UnconditionalPTrace` implies `EnableLinuxPTrace` (spec §6 block 7).
	pub fn normalized(self) -> Self {
		if self.contains(Self::UNCONDITIONAL_PTRACE) {
			self | Self::ENABLE_LINUX_PTRACE
		} else {
			self
		}
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryTranslation {
	pub source: PathBuf,
	pub target: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessSubstitutionMatch {
	pub process_name: String,
	pub arg_match: String,
}

#[derive(Clone, Debug, Default)]
pub struct ProcessSubstitutionShim {
	pub shim_all: bool,
	pub shim_executable: PathBuf,
	pub plugin_32: Option<PathBuf>,
	pub plugin_64: Option<PathBuf>,
	pub matches: Vec<ProcessSubstitutionMatch>,
}

/// The report-block value of spec §6 item 9: either a raw handle (kind
/// bit set) or a path (kind bit clear, payload padded to even length).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReportBlockValue {
	RawHandle(u32),
	Path(String),
}

/// Everything in the FAM header blocks except the manifest-tree bytes
/// themselves (spec §6 items 1-11; item 12 is `manifest::wire`'s output).
#[derive(Clone, Debug, Default)]
pub struct FamHeader {
	pub injection_timeout_minutes: u32,
	pub breakaway_rules: Vec<BreakawayRule>,
	pub directory_translations: Vec<DirectoryTranslation>,
	pub error_dump_location: Option<PathBuf>,
	pub flags: ManifestFlags,
	pub extra_flags: ManifestExtraFlags,
	pub pip_id: u64,
	pub report_block: Option<ReportBlockValue>,
	pub injected_dll_names: Vec<String>,
	pub process_substitution: Option<ProcessSubstitutionShim>,
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
	out.extend_from_slice(&value.to_le_bytes());
}
fn write_u64(out: &mut Vec<u8>, value: u64) {
	out.extend_from_slice(&value.to_le_bytes());
}
fn write_encoded_string(out: &mut Vec<u8>, text: &str) {
	let bytes = text.as_bytes();
	write_u32(out, bytes.len() as u32);
	out.extend_from_slice(bytes);
	if bytes.len() % 2 != 0 {
		out.push(0);
	}
}
fn maybe_cookie(out: &mut Vec<u8>, debug_mode: bool, block_index: u32) {
	if debug_mode {
		write_u32(out, cookie_for_block(block_index));
	}
}

/// Serializes the header blocks (spec §6 items 1-11) followed by the
/// already-serialized manifest-tree block (item 12, from `manifest::wire`).
pub fn serialize_fam(header: &FamHeader, manifest_tree_bytes: &[u8], debug_mode: bool) -> Vec<u8> {
	let mut out = Vec::new();

	maybe_cookie(&mut out, debug_mode, 1);
	write_u32(&mut out, if debug_mode { DEBUG_MARKER_DEBUG } else { DEBUG_MARKER_RELEASE });

	maybe_cookie(&mut out, debug_mode, 2);
	write_u32(&mut out, header.injection_timeout_minutes);

	maybe_cookie(&mut out, debug_mode, 3);
	write_u32(&mut out, header.breakaway_rules.len() as u32);
	for rule in &header.breakaway_rules {
		write_encoded_string(&mut out, &rule.process_name);
		write_encoded_string(&mut out, rule.required_cmdline_substring.as_deref().unwrap_or(""));
		write_u32(&mut out, u32::from(rule.ignore_case));
	}

	maybe_cookie(&mut out, debug_mode, 4);
	write_u32(&mut out, header.directory_translations.len() as u32);
	for translation in &header.directory_translations {
		write_encoded_string(&mut out, &translation.source.to_string_lossy());
		write_encoded_string(&mut out, &translation.target.to_string_lossy());
	}

	maybe_cookie(&mut out, debug_mode, 5);
	write_encoded_string(
		&mut out,
		&header
			.error_dump_location
			.as_ref()
			.map(|p| p.to_string_lossy().into_owned())
			.unwrap_or_default(),
	);

	maybe_cookie(&mut out, debug_mode, 6);
	write_u32(&mut out, header.flags.bits());

	maybe_cookie(&mut out, debug_mode, 7);
	write_u32(&mut out, header.extra_flags.normalized().bits());

	maybe_cookie(&mut out, debug_mode, 8);
	write_u64(&mut out, header.pip_id);
	if debug_mode {
		write_u32(&mut out, 0); // 32-bit zero padding, debug builds only
	}

	maybe_cookie(&mut out, debug_mode, 9);
	match &header.report_block {
		None => write_u32(&mut out, 0), // size 0, kind bit clear: empty path
		Some(ReportBlockValue::RawHandle(handle)) => {
			write_u32(&mut out, (4u32 << 1) | 1);
			write_u32(&mut out, *handle);
		}
		Some(ReportBlockValue::Path(path)) => {
			let bytes = path.as_bytes();
			let padded_len = bytes.len() + (bytes.len() % 2);
			write_u32(&mut out, (padded_len as u32) << 1);
			out.extend_from_slice(bytes);
			if bytes.len() % 2 != 0 {
				out.push(0);
			}
		}
	}

	maybe_cookie(&mut out, debug_mode, 10);
	{
		let total_size_offset = out.len();
		write_u32(&mut out, 0); // patched below
		write_u32(&mut out, header.injected_dll_names.len() as u32);
		let offsets_offset = out.len();
		out.extend(std::iter::repeat_n(0u8, header.injected_dll_names.len() * 4));
		let entries_start = out.len();
		for (i, name) in header.injected_dll_names.iter().enumerate() {
			let offset = (out.len() - entries_start) as u32;
			out[offsets_offset + i * 4..offsets_offset + i * 4 + 4].copy_from_slice(&offset.to_le_bytes());
			out.extend_from_slice(name.as_bytes());
		}
		let total_size = (out.len() - total_size_offset) as u32;
		out[total_size_offset..total_size_offset + 4].copy_from_slice(&total_size.to_le_bytes());
	}

	maybe_cookie(&mut out, debug_mode, 11);
	match &header.process_substitution {
		None => write_u32(&mut out, 0),
		Some(shim) => {
			write_u32(&mut out, 1); // presence flag, disambiguates from the "no shim" case below
			write_u32(&mut out, u32::from(shim.shim_all));
			write_encoded_string(&mut out, &shim.shim_executable.to_string_lossy());
			write_encoded_string(&mut out, &shim.plugin_32.as_ref().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default());
			write_encoded_string(&mut out, &shim.plugin_64.as_ref().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default());
			write_u32(&mut out, shim.matches.len() as u32);
			for m in &shim.matches {
				write_encoded_string(&mut out, &m.process_name);
				write_encoded_string(&mut out, &m.arg_match);
			}
		}
	}

	maybe_cookie(&mut out, debug_mode, 12);
	out.extend_from_slice(manifest_tree_bytes);

	out
}

/// Reads a FAM produced by [`serialize_fam`], splitting it back into the
/// header and the remaining manifest-tree bytes.
pub fn deserialize_fam(bytes: &[u8], debug_mode: bool) -> io::Result<(FamHeader, &[u8])> {
	let mut cursor = Cursor { bytes, pos: 0 };
	cursor.skip_cookie(debug_mode);
	let marker = cursor.read_u32()?;
	let observed_debug = marker == DEBUG_MARKER_DEBUG;
	if marker != DEBUG_MARKER_DEBUG && marker != DEBUG_MARKER_RELEASE {
		return Err(io::Error::new(io::ErrorKind::InvalidData, "bad debug marker"));
	}
	let _ = observed_debug;

	cursor.skip_cookie(debug_mode);
	let injection_timeout_minutes = cursor.read_u32()?;

	cursor.skip_cookie(debug_mode);
	let breakaway_count = cursor.read_u32()?;
	let mut breakaway_rules = Vec::with_capacity(breakaway_count as usize);
	for _ in 0..breakaway_count {
		let process_name = cursor.read_encoded_string()?;
		let substring = cursor.read_encoded_string()?;
		let ignore_case = cursor.read_u32()? != 0;
		breakaway_rules.push(BreakawayRule {
			process_name,
			required_cmdline_substring: if substring.is_empty() { None } else { Some(substring) },
			ignore_case,
		});
	}

	cursor.skip_cookie(debug_mode);
	let translation_count = cursor.read_u32()?;
	let mut directory_translations = Vec::with_capacity(translation_count as usize);
	for _ in 0..translation_count {
		let source = PathBuf::from(cursor.read_encoded_string()?);
		let target = PathBuf::from(cursor.read_encoded_string()?);
		directory_translations.push(DirectoryTranslation { source, target });
	}

	cursor.skip_cookie(debug_mode);
	let error_dump_raw = cursor.read_encoded_string()?;
	let error_dump_location = if error_dump_raw.is_empty() { None } else { Some(PathBuf::from(error_dump_raw)) };

	cursor.skip_cookie(debug_mode);
	let flags = ManifestFlags::from_bits(cursor.read_u32()?);

	cursor.skip_cookie(debug_mode);
	let extra_flags = ManifestExtraFlags::from_bits(cursor.read_u32()?);

	cursor.skip_cookie(debug_mode);
	let pip_id = cursor.read_u64()?;
	if debug_mode {
		cursor.read_u32()?; // zero padding
	}

	cursor.skip_cookie(debug_mode);
	let report_size_and_kind = cursor.read_u32()?;
	let report_block = if report_size_and_kind == 0 {
		None
	} else if report_size_and_kind & 1 != 0 {
		Some(ReportBlockValue::RawHandle(cursor.read_u32()?))
	} else {
		let padded_len = (report_size_and_kind >> 1) as usize;
		let bytes = cursor.take(padded_len)?;
		Some(ReportBlockValue::Path(String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string()))
	};

	cursor.skip_cookie(debug_mode);
	let total_size = cursor.read_u32()?;
	let dll_count = cursor.read_u32()?;
	let offsets: Vec<u32> = (0..dll_count).map(|_| cursor.read_u32()).collect::<io::Result<_>>()?;
	let entries_len = total_size.saturating_sub(4 + 4 + dll_count * 4) as usize;
	let entries_bytes = cursor.take(entries_len)?;
	let mut injected_dll_names = Vec::with_capacity(dll_count as usize);
	for (i, &offset) in offsets.iter().enumerate() {
		let start = offset as usize;
		let end = if i + 1 < offsets.len() { offsets[i + 1] as usize } else { entries_bytes.len() };
		injected_dll_names.push(String::from_utf8_lossy(&entries_bytes[start..end]).into_owned());
	}

	cursor.skip_cookie(debug_mode);
	let shim_present = cursor.read_u32()? != 0;
	let process_substitution = if !shim_present {
		None
	} else {
		let shim_all = cursor.read_u32()? != 0;
		let shim_executable = PathBuf::from(cursor.read_encoded_string()?);
		let plugin_32_raw = cursor.read_encoded_string()?;
		let plugin_64_raw = cursor.read_encoded_string()?;
		let match_count = cursor.read_u32()?;
		let mut matches = Vec::with_capacity(match_count as usize);
		for _ in 0..match_count {
			let process_name = cursor.read_encoded_string()?;
			let arg_match = cursor.read_encoded_string()?;
			matches.push(ProcessSubstitutionMatch { process_name, arg_match });
		}
		Some(ProcessSubstitutionShim {
			shim_all,
			shim_executable,
			plugin_32: if plugin_32_raw.is_empty() { None } else { Some(PathBuf::from(plugin_32_raw)) },
			plugin_64: if plugin_64_raw.is_empty() { None } else { Some(PathBuf::from(plugin_64_raw)) },
			matches,
		})
	};

	cursor.skip_cookie(debug_mode);
	let tree_bytes = &bytes[cursor.pos..];

	Ok((
		FamHeader {
			injection_timeout_minutes,
			breakaway_rules,
			directory_translations,
			error_dump_location,
			flags,
			extra_flags,
			pip_id,
			report_block,
			injected_dll_names,
			process_substitution,
		},
		tree_bytes,
	))
}

struct Cursor<'a> {
	bytes: &'a [u8],
	pos: usize,
}
impl<'a> Cursor<'a> {
	fn skip_cookie(&mut self, debug_mode: bool) {
		if debug_mode {
			self.pos += 4;
		}
	}
	fn read_u32(&mut self) -> io::Result<u32> {
		let slice = self.take(4)?;
		Ok(u32::from_le_bytes(slice.try_into().unwrap()))
	}
	fn read_u64(&mut self) -> io::Result<u64> {
		let slice = self.take(8)?;
		Ok(u64::from_le_bytes(slice.try_into().unwrap()))
	}
	fn take(&mut self, len: usize) -> io::Result<&'a [u8]> {
		if self.pos + len > self.bytes.len() {
			return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "FAM header truncated"));
		}
		let slice = &self.bytes[self.pos..self.pos + len];
		self.pos += len;
		Ok(slice)
	}
	fn read_encoded_string(&mut self) -> io::Result<String> {
		let len = self.read_u32()? as usize;
		let bytes = self.take(len)?;
		if len % 2 != 0 {
			self.take(1)?;
		}
		Ok(String::from_utf8_lossy(bytes).into_owned())
	}
}

pub fn write_to(writer: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
	writer.write_all(bytes)
}
pub fn read_from(reader: &mut impl Read) -> io::Result<Vec<u8>> {
	let mut buf = Vec::new();
	reader.read_to_end(&mut buf)?;
	Ok(buf)
}
