//! Caller-owned configuration for one orchestrator (spec §9 design notes:
//! "keep them as a configuration struct owned by the orchestrator ... avoid
//! process-wide singletons so tests can parameterize them").
//!
//! Everything the teacher keeps as a literal inline in `sandbox.rs`
//! (the TIOCSTI blacklist, the `--die-with-parent` choice) is here instead
//! threaded through explicitly, because this crate's ignore lists and
//! breakaway rules vary per pip rather than being fixed at compile time.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Whether the caller must wait for orphaned descendants after the root
/// process of a job exits. Left as an explicit knob per spec §9 Open
/// Questions ("not defined whether the caller must wait for orphans").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OrphanPolicy {
	Wait,
	Kill,
	ReportOnly,
}

/// Local-vs-isolated execution switch (spec §1: "The core sees 'execute
/// locally' or 'execute in isolated environment' as a switch with a
/// documented interface").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExecutionEnvironment {
	Local,
	Isolated,
}

/// One breakaway rule (spec §6 FAM block 3 / §3 Manifest "child-process
/// breakaway rules").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakawayRule {
	pub process_name: String,
	pub required_cmdline_substring: Option<String>,
	pub ignore_case: bool,
}

/// Small counter the Orchestrator consults and decrements across retries
/// of the *same* pip (spec §4.H: "retry budget remains"). The Orchestrator
/// itself is stateless across retries (spec §5), so callers own the
/// `RetryBudget` and hand it back in on each attempt.
#[derive(Clone, Copy, Debug)]
pub struct RetryBudget {
	remaining: u32,
}

impl RetryBudget {
	pub fn new(max_retries: u32) -> Self {
		Self { remaining: max_retries }
	}

	/// Seeds a fresh budget from `config.max_retries` — the call a caller
	/// makes once, at the start of a pip's first attempt, before handing
	/// the budget back into `execute()` on every subsequent retry.
	pub fn from_config(config: &OrchestratorConfig) -> Self {
		Self::new(config.max_retries)
	}

	pub fn has_remaining(&self) -> bool {
		self.remaining > 0
	}

	/// Consumes one retry attempt. Returns whether a retry was actually
	/// available to consume.
	pub fn consume(&mut self) -> bool {
		if self.remaining == 0 {
			return false;
		}
		self.remaining -= 1;
		true
	}
}

/// Default injected helper DLLs the classifier drops accesses to
/// unconditionally (spec §4.E step 3: "injected helper DLLs listed in a
/// fixed set"). Names are compared case-insensitively.
pub fn default_injected_dll_names() -> HashSet<String> {
	["mdnsNSP.DLL", "tiptsf.dll"]
		.into_iter()
		.map(|s| s.to_ascii_lowercase())
		.collect()
}

/// Caller-supplied settings threaded through the orchestrator, classifier,
/// and retry policy. Construct one per build invocation (or per pip, if
/// pips need different policies); never a global.
pub struct OrchestratorConfig {
	/// Injected helper DLLs ignored unconditionally by the classifier.
	pub ignored_dll_names: HashSet<String>,
	/// Coverage/tool-temp-file name patterns ignored by the classifier
	/// (spec §4.E step 3): extensions like `pdb`/`nls`, and resource
	/// compiler temp name prefixes like `RC`.
	pub ignored_extensions: HashSet<String>,
	pub ignored_filename_prefixes: Vec<String>,
	pub breakaway_rules: Vec<BreakawayRule>,
	pub orphan_policy: OrphanPolicy,
	pub environment: ExecutionEnvironment,
	pub timeout: Duration,
	/// Soft deadline producing a warning only (spec §5: "Warning timeout
	/// is a soft deadline producing a warning only").
	pub warning_timeout: Option<Duration>,
	/// Whether a `Probe` against an existing directory counts as
	/// `has_enumeration` (spec §4.E step 4).
	pub probes_as_enumerations: bool,
	/// Root scope default: allow-read-always instead of
	/// allow-read-if-nonexistent (spec §4.G step 5).
	pub allow_undeclared_reads: bool,
	pub resolve_intermediate_symlinks: bool,
	pub fail_on_stderr_writes: bool,
	pub max_captured_stdio_bytes: usize,
	/// Fixed root that isolated-environment temp-dir redirects land under
	/// (spec §4.G step 3: "the redirect target is under a fixed root and
	/// is itself untracked in the manifest").
	pub isolated_temp_root: Option<PathBuf>,
	pub user_retryable_exit_codes: HashSet<i32>,
	pub infra_retries_enabled: bool,
	/// Seed value for a fresh [`RetryBudget`] (see [`RetryBudget::from_config`]).
	pub max_retries: u32,
	/// Process names excluded from the surviving-child-process count taken
	/// after exit (spec §4.G step 9: "filtered against an allowlist").
	pub surviving_child_allowlist: HashSet<String>,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		Self {
			ignored_dll_names: default_injected_dll_names(),
			ignored_extensions: ["pdb", "nls"].into_iter().map(str::to_string).collect(),
			ignored_filename_prefixes: vec!["RC".to_string()],
			breakaway_rules: Vec::new(),
			orphan_policy: OrphanPolicy::ReportOnly,
			environment: ExecutionEnvironment::Local,
			timeout: Duration::from_secs(10 * 60),
			warning_timeout: None,
			probes_as_enumerations: false,
			allow_undeclared_reads: false,
			resolve_intermediate_symlinks: true,
			fail_on_stderr_writes: false,
			max_captured_stdio_bytes: 1024 * 1024,
			isolated_temp_root: None,
			user_retryable_exit_codes: HashSet::new(),
			infra_retries_enabled: true,
			max_retries: 3,
			surviving_child_allowlist: HashSet::new(),
		}
	}
}
