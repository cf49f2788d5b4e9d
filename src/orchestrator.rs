//! Pip Executor (component G, spec §4.G): prepares the working set,
//! constructs the manifest, launches the monitored process, drains its
//! report channel, classifies every access, and assembles a final
//! execution result.
//!
//! Process launch and the TIOCSTI hardening are carried over from the
//! teacher's `sandbox.rs` (`SandboxParameters::run_cmd`, `get_bpf_program`,
//! `convert_exit_status_to_code`): there the filter guards a non-detached
//! `bwrap` child inheriting the controlling terminal; here it guards the
//! directly-launched monitored process for the same reason. Unlike the
//! teacher, the filter is installed via `pre_exec` in the child rather than
//! applied to the orchestrator's own process, since this crate's
//! `execute()` is called repeatedly from a long-lived host rather than once
//! per CLI invocation.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Read};
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::{Command as OsCommand, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use seccompiler::{
	BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter, SeccompRule, TargetArch as SeccompArch,
};
use tracing::{debug, info, info_span, warn};

use crate::channel::ReportChannel;
use crate::classifier::{self, Declarations, NoopSymlinkResolver, SealedDirectory, SharedOpaqueRoot};
use crate::config::{ExecutionEnvironment, OrchestratorConfig, OrphanPolicy, RetryBudget};
use crate::error::{ExecutionError, ExecutionResult as ExecResult, ProcessStartError};
use crate::fam::{self, DirectoryTranslation, FamHeader};
use crate::manifest::ManifestTree;
use crate::path_interner::{PathId, PathInterner};
use crate::policy::{FileAccessPolicy, FileAccessScope};
use crate::result::{AccountingInfo, ExecutionOutcome};
use crate::retry::{self, TerminationOutcome};
use crate::validator::{self, RealFileProbe, SharedOpaqueWriteClassification};

/// Fixed mtime stamped onto private copies of rewritten inputs (spec §9
/// design notes: "Timestamp faking" — "explicitly stamped before spawn").
/// Any fixed instant satisfies the contract; this one has no significance
/// beyond being deterministic across runs.
const OLD_OUTPUT_MTIME_UNIX_SECONDS: i64 = 946_684_800; // 2000-01-01T00:00:00Z

/// Everything the orchestrator needs to run one pip, gathered by the
/// (out-of-scope) caller from the build graph.
pub struct JobSpec {
	pub pip_id: u64,
	pub command: Vec<String>,
	pub working_dir: PathBuf,
	pub temp_dir: PathBuf,
	pub declared_env: HashMap<String, String>,
	pub pass_through_env: Vec<String>,
	pub inputs: HashSet<PathBuf>,
	pub sealed_directories: Vec<(PathBuf, HashSet<PathBuf>)>,
	pub outputs: HashSet<PathBuf>,
	/// Shared-opaque roots paired with their per-pip write exclusions
	/// (spec §4.E step 5).
	pub shared_opaque_roots: Vec<(PathBuf, HashSet<PathBuf>)>,
	pub rewritten_inputs: HashSet<PathBuf>,
	/// Paths the manifest grants broad, unreported access to (e.g. `/proc`,
	/// `/dev`) without tracking them as inputs or outputs.
	pub untracked_scopes: Vec<PathBuf>,
	pub warning_pattern: Option<Regex>,
	pub error_pattern: Option<Regex>,
}

fn merge_environment(job: &JobSpec) -> HashMap<String, String> {
	let mut env = job.declared_env.clone();
	for name in &job.pass_through_env {
		if let Ok(value) = std::env::var(name) {
			env.insert(name.clone(), value);
		}
	}
	let temp = job.temp_dir.to_string_lossy().into_owned();
	for var in ["TMP", "TEMP", "TMPDIR"] {
		env.insert(var.to_string(), temp.clone());
	}
	env
}

fn prepare_temp_dir(job: &JobSpec, config: &OrchestratorConfig) -> io::Result<()> {
	match config.environment {
		ExecutionEnvironment::Local => {
			if job.temp_dir.exists() {
				fs::remove_dir_all(&job.temp_dir)?;
			}
			fs::create_dir_all(&job.temp_dir)
		}
		ExecutionEnvironment::Isolated => {
			let root = config
				.isolated_temp_root
				.as_deref()
				.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "isolated execution requires isolated_temp_root"))?;
			let redirect_target = root.join(job.pip_id.to_string());
			fs::create_dir_all(&redirect_target)?;
			if job.temp_dir.exists() || job.temp_dir.symlink_metadata().is_ok() {
				let _ = fs::remove_file(&job.temp_dir);
			}
			if let Some(parent) = job.temp_dir.parent() {
				fs::create_dir_all(parent)?;
			}
			std::os::unix::fs::symlink(&redirect_target, &job.temp_dir)
		}
	}
}

/// Materializes a private, freshly-stamped copy of each rewritten input
/// under the pip's temp directory (spec §4.G step 4). Returns the copies'
/// paths so the manifest can grant them the same policy as the originals.
fn materialize_rewritten_inputs(job: &JobSpec) -> io::Result<Vec<PathBuf>> {
	let mtime = filetime::FileTime::from_unix_time(OLD_OUTPUT_MTIME_UNIX_SECONDS, 0);
	let staging = job.temp_dir.join("__rewritten_inputs");
	let mut copies = Vec::with_capacity(job.rewritten_inputs.len());
	for original in &job.rewritten_inputs {
		let Some(name) = original.file_name() else {
			continue;
		};
		fs::create_dir_all(&staging)?;
		let copy_path = staging.join(name);
		fs::copy(original, &copy_path)?;
		filetime::set_file_mtime(&copy_path, mtime)?;
		copies.push(copy_path);
	}
	Ok(copies)
}

/// Builds the manifest per spec §4.G step 5.
fn build_manifest(job: &JobSpec, config: &OrchestratorConfig, interner: &PathInterner) -> Result<ManifestTree, ExecutionError> {
	let mut tree = ManifestTree::new();

	let root_values = if config.allow_undeclared_reads {
		FileAccessPolicy::ALLOW_READ | FileAccessPolicy::REPORT_DIRECTORY_ENUMERATION_ACCESS
	} else {
		FileAccessPolicy::ALLOW_READ_IF_NONEXISTENT | FileAccessPolicy::REPORT_DIRECTORY_ENUMERATION_ACCESS
	};
	tree.add_scope(interner, PathId::ROOT, FileAccessScope::new(!FileAccessPolicy::EMPTY, root_values))?;

	for untracked in &job.untracked_scopes {
		if let Some(id) = interner.intern(untracked) {
			tree.add_scope(
				interner,
				id,
				FileAccessScope::new(
					!FileAccessPolicy::EMPTY,
					FileAccessPolicy::ALLOW_READ | FileAccessPolicy::ALLOW_WRITE | FileAccessPolicy::ALLOW_CREATE_DIRECTORY,
				),
			)?;
		}
	}

	let allow_all_report = FileAccessPolicy::ALLOW_READ
		| FileAccessPolicy::ALLOW_WRITE
		| FileAccessPolicy::ALLOW_CREATE_DIRECTORY
		| FileAccessPolicy::ALLOW_SYMLINK_CREATION
		| FileAccessPolicy::REPORT_ACCESS;
	for output in &job.outputs {
		if let Some(id) = interner.intern(output) {
			tree.add_path(interner, id, FileAccessScope::new(!FileAccessPolicy::EMPTY, allow_all_report), None)?;
		}
	}

	let read_only_timestamp_faked = FileAccessPolicy::ALLOW_READ;
	for input in &job.inputs {
		if let Some(id) = interner.intern(input) {
			tree.add_path(
				interner,
				id,
				FileAccessScope::new(!FileAccessPolicy::ALLOW_WRITE & !FileAccessPolicy::ALLOW_REAL_INPUT_TIMESTAMPS, read_only_timestamp_faked),
				None,
			)?;
		}
	}
	for (root, contents) in &job.sealed_directories {
		for member in contents {
			if let Some(id) = interner.intern(member) {
				tree.add_path(
					interner,
					id,
					FileAccessScope::new(!FileAccessPolicy::ALLOW_WRITE & !FileAccessPolicy::ALLOW_REAL_INPUT_TIMESTAMPS, read_only_timestamp_faked),
					None,
				)?;
			}
		}
		let _ = root; // the root itself carries no independent policy beyond its members
	}

	let shared_opaque_values = FileAccessPolicy::ALLOW_READ
		| FileAccessPolicy::ALLOW_WRITE
		| FileAccessPolicy::ALLOW_CREATE_DIRECTORY
		| FileAccessPolicy::REPORT_ACCESS;
	let block_write_to_existing_mask = if config.allow_undeclared_reads {
		!FileAccessPolicy::EMPTY
	} else {
		!FileAccessPolicy::OVERRIDE_ALLOW_WRITE_FOR_EXISTING_FILES
	};
	for (root, _exclusions) in &job.shared_opaque_roots {
		if let Some(id) = interner.intern(root) {
			tree.add_scope(interner, id, FileAccessScope::new(block_write_to_existing_mask, shared_opaque_values))?;
		}
	}

	Ok(tree)
}

fn tiocsti_blacklist() -> BpfProgram {
	#[cfg(target_arch = "x86_64")]
	let arch = SeccompArch::x86_64;
	#[cfg(target_arch = "aarch64")]
	let arch = SeccompArch::aarch64;
	#[cfg(target_arch = "riscv64")]
	let arch = SeccompArch::riscv64;
	#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64", target_arch = "riscv64")))]
	compile_error!("only x86_64, aarch64 and riscv64 are supported");

	let blacklist_syscalls = [(
		libc::SYS_ioctl,
		vec![SeccompRule::new(vec![SeccompCondition::new(1, SeccompCmpArgLen::Dword, SeccompCmpOp::MaskedEq(0xFFFF_FFFF), libc::TIOCSTI).unwrap()]).unwrap()],
	)];
	SeccompFilter::new(blacklist_syscalls.into_iter().collect(), SeccompAction::Allow, SeccompAction::Trap, arch)
		.unwrap()
		.try_into()
		.unwrap()
}

fn spawn_monitored_process(job: &JobSpec, env: &HashMap<String, String>, fam_path: &Path, config: &OrchestratorConfig) -> Result<std::process::Child, ProcessStartError> {
	let mut command = OsCommand::new(&job.command[0]);
	command.args(&job.command[1..]);
	command.current_dir(&job.working_dir);
	command.env_clear();
	command.envs(env);
	command.env(fam::ENV_FAM_PATH, fam_path);
	command.stdout(Stdio::piped());
	command.stderr(Stdio::piped());
	command.process_group(0);

	if matches!(config.environment, ExecutionEnvironment::Local) {
		// Safety: the closure only calls async-signal-safe syscall wrappers
		// (`seccompiler::apply_filter` installs a BPF program via `prctl`),
		// matching the contract `pre_exec` requires.
		unsafe {
			command.pre_exec(|| seccompiler::apply_filter(&tiocsti_blacklist()).map_err(|err| io::Error::other(err.to_string())));
		}
	}

	command.spawn().map_err(|source| ProcessStartError::Spawn { source })
}

fn kill_process_tree(pid: u32) {
	let group = nix::unistd::Pid::from_raw(-(pid as i32));
	let _ = nix::sys::signal::killpg(group, nix::sys::signal::Signal::SIGKILL);
}

/// Drains a pipe fully, keeping only the first `max_bytes`, so the child
/// never blocks on a full stdio pipe even once the captured buffer is full.
fn capture_stdio(mut reader: impl Read + Send + 'static, max_bytes: usize) -> std::thread::JoinHandle<Vec<u8>> {
	std::thread::spawn(move || {
		let mut buf = vec![0u8; max_bytes];
		let mut filled = 0usize;
		let mut chunk = [0u8; 8192];
		loop {
			match reader.read(&mut chunk) {
				Ok(0) => break,
				Ok(n) => {
					let take = n.min(max_bytes.saturating_sub(filled));
					buf[filled..filled + take].copy_from_slice(&chunk[..take]);
					filled += take;
				}
				Err(_) => break,
			}
		}
		buf.truncate(filled);
		buf
	})
}

fn count_matches(bytes: &[u8], pattern: &Option<Regex>) -> u32 {
	let Some(pattern) = pattern else {
		return 0;
	};
	let text = String::from_utf8_lossy(bytes);
	pattern.find_iter(&text).count() as u32
}

/// Best-effort count of still-running descendants of `root_pid`, excluding
/// process names in `allowlist` (spec §4.G step 9).
fn count_surviving_descendants(root_pid: u32, allowlist: &HashSet<String>) -> u32 {
	let Ok(entries) = fs::read_dir("/proc") else {
		return 0;
	};
	let mut children_by_parent: HashMap<u32, Vec<(u32, String)>> = HashMap::new();
	for entry in entries.flatten() {
		let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
			continue;
		};
		let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
			continue;
		};
		let Some((name, ppid)) = parse_proc_stat(&stat) else {
			continue;
		};
		children_by_parent.entry(ppid).or_default().push((pid, name));
	}

	let mut stack = vec![root_pid];
	let mut count = 0;
	while let Some(parent) = stack.pop() {
		for (pid, name) in children_by_parent.get(&parent).into_iter().flatten() {
			if !allowlist.contains(name) {
				count += 1;
			}
			stack.push(*pid);
		}
	}
	count
}

/// `OrphanPolicy::Wait`: blocks until no surviving, non-allowlisted
/// descendant of `root_pid` remains or `max_wait` elapses, whichever comes
/// first — callers that chose `Wait` accept the extra latency themselves.
fn wait_for_surviving_descendants(root_pid: u32, allowlist: &HashSet<String>, max_wait: Duration) {
	let deadline = Instant::now() + max_wait;
	while count_surviving_descendants(root_pid, allowlist) > 0 {
		if Instant::now() >= deadline {
			warn!("surviving descendants still active after waiting out the job timeout, giving up");
			break;
		}
		std::thread::sleep(Duration::from_millis(25));
	}
}

/// Parses `comm` and `ppid` out of a `/proc/<pid>/stat` line. The
/// executable name is parenthesized and may itself contain spaces, so it is
/// located by its matching closing paren rather than naive whitespace
/// splitting.
fn parse_proc_stat(stat: &str) -> Option<(String, u32)> {
	let open = stat.find('(')?;
	let close = stat.rfind(')')?;
	let name = stat.get(open + 1..close)?.to_string();
	let rest = stat.get(close + 1..)?;
	let mut fields = rest.split_whitespace();
	fields.next()?; // state
	let ppid: u32 = fields.next()?.parse().ok()?;
	Some((name, ppid))
}

/// Runs one pip to completion (spec §4.G). `cancel` is polled cooperatively;
/// setting it mid-run triggers the same kill-then-drain sequence as a
/// timeout (spec §5).
pub fn execute(job: &JobSpec, config: &OrchestratorConfig, budget: &mut RetryBudget, cancel: &AtomicBool) -> ExecResult<ExecutionOutcome> {
	let span = info_span!("pip", pip_id = job.pip_id);
	let _enter = span.enter();
	info!("prepared");

	fs::create_dir_all(&job.working_dir).map_err(|err| ExecutionError::Preparation(format!("failed to create working directory: {err}")))?;
	prepare_temp_dir(job, config).map_err(|err| ExecutionError::Preparation(format!("failed to prepare temp directory: {err}")))?;
	let rewritten_copies = materialize_rewritten_inputs(job).map_err(|err| ExecutionError::Preparation(format!("failed to materialize rewritten inputs: {err}")))?;
	let env = merge_environment(job);

	// shared across the drain thread below: PathIds are only comparable
	// against the interner that minted them, so the classifier, validator
	// and the channel reader must all resolve through this one instance.
	let interner = Arc::new(PathInterner::new());
	let mut manifest = build_manifest(job, config, &interner)?;
	for copy in &rewritten_copies {
		if let Some(id) = interner.intern(copy) {
			manifest.add_path(&interner, id, FileAccessScope::new(!FileAccessPolicy::ALLOW_REAL_INPUT_TIMESTAMPS, FileAccessPolicy::ALLOW_READ), None)?;
		}
	}
	manifest.finalize();

	let fifo_path = job.temp_dir.join("report.fifo");
	let fam_path = job.temp_dir.join("fam.bin");
	let error_dump_path = job.temp_dir.join("error_dump.txt");

	let mut tree_bytes = Vec::new();
	manifest.serialize_wire(&mut tree_bytes).map_err(|err| ExecutionError::Preparation(format!("failed to serialize manifest: {err}")))?;
	let fam_header = FamHeader {
		injection_timeout_minutes: (config.timeout.as_secs() / 60).max(1) as u32,
		breakaway_rules: config.breakaway_rules.clone(),
		directory_translations: Vec::<DirectoryTranslation>::new(),
		error_dump_location: Some(error_dump_path.clone()),
		pip_id: job.pip_id,
		report_block: Some(fam::ReportBlockValue::Path(fifo_path.to_string_lossy().into_owned())),
		injected_dll_names: config.ignored_dll_names.iter().cloned().collect(),
		..FamHeader::default()
	};
	let fam_bytes = fam::serialize_fam(&fam_header, &tree_bytes, cfg!(debug_assertions));
	fs::write(&fam_path, &fam_bytes).map_err(|err| ExecutionError::Preparation(format!("failed to write FAM: {err}")))?;

	// the FIFO node must exist before the child starts, but the channel's
	// liveness tracker needs the real root pid at construction, so the
	// node is created here and the channel itself opened only after spawn.
	match nix::unistd::mkfifo(&fifo_path, nix::sys::stat::Mode::from_bits_truncate(0o600)) {
		Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
		Err(err) => return Err(ExecutionError::Preparation(format!("failed to create report fifo: {err}"))),
	}

	let mut child = spawn_monitored_process(job, &env, &fam_path, config)?;
	let child_pid = child.id();
	info!(pid = child_pid, "running");

	let channel = ReportChannel::open(fifo_path, child_pid)?;
	channel.record_process_start(child_pid);

	let stdout_handle = child.stdout.take().map(|r| capture_stdio(r, config.max_captured_stdio_bytes));
	let stderr_handle = child.stderr.take().map(|r| capture_stdio(r, config.max_captured_stdio_bytes));

	let channel = Arc::new(channel);
	let drain_channel = Arc::clone(&channel);
	let drain_interner = Arc::clone(&interner);
	let drain_handle = std::thread::spawn(move || drain_channel.drain(&drain_interner));

	let start = Instant::now();
	let deadline = start + config.timeout;
	let warning_deadline = config.warning_timeout.map(|warning| start + warning);
	let mut warned = false;
	let mut timed_out = false;
	let mut cancelled = false;
	let exit_status: ExitStatus = loop {
		match child.try_wait() {
			Ok(Some(status)) => break status,
			Ok(None) => {}
			Err(err) => return Err(ExecutionError::Preparation(format!("failed to poll child: {err}"))),
		}
		if cancel.load(Ordering::SeqCst) {
			cancelled = true;
			break_on_timeout_or_cancel(&mut child, child_pid);
			break child.wait().map_err(|err| ExecutionError::Preparation(format!("failed to wait for killed child: {err}")))?;
		}
		if Instant::now() >= deadline {
			timed_out = true;
			break_on_timeout_or_cancel(&mut child, child_pid);
			break child.wait().map_err(|err| ExecutionError::Preparation(format!("failed to wait for killed child: {err}")))?;
		}
		// spec §5: "Warning timeout is a soft deadline producing a warning
		// only" — does not cancel or kill the process, just surfaces once.
		if !warned && warning_deadline.is_some_and(|warning_deadline| Instant::now() >= warning_deadline) {
			warned = true;
			warn!(pip_id = job.pip_id, "pip is still running past its warning timeout");
		}
		std::thread::sleep(Duration::from_millis(25));
	};

	channel.close_write_handle();
	let drained = drain_handle.join().map_err(|_| ExecutionError::Preparation("report channel reader thread panicked".to_string()))??;
	if drained.orphans_active {
		match config.orphan_policy {
			OrphanPolicy::ReportOnly => warn!("orphaned descendants remained active after root process exit"),
			OrphanPolicy::Kill => {
				warn!("orphaned descendants remained active after root process exit, killing process group");
				kill_process_tree(child_pid);
			}
			OrphanPolicy::Wait => {
				debug!("orphaned descendants remained active after root process exit, waiting for them to exit");
				wait_for_surviving_descendants(child_pid, &config.surviving_child_allowlist, config.timeout);
			}
		}
	}

	let stdout_bytes = stdout_handle.map(|h| h.join().unwrap_or_default()).unwrap_or_default();
	let stderr_bytes = stderr_handle.map(|h| h.join().unwrap_or_default()).unwrap_or_default();
	let warning_count = count_matches(&stdout_bytes, &job.warning_pattern) + count_matches(&stderr_bytes, &job.warning_pattern);
	let error_pattern_matches = count_matches(&stdout_bytes, &job.error_pattern) + count_matches(&stderr_bytes, &job.error_pattern);
	if error_pattern_matches > 0 {
		debug!(error_pattern_matches, "console output matched the configured error pattern");
	}

	let inputs: HashSet<PathId> = job.inputs.iter().filter_map(|p| interner.intern(p)).collect();
	let outputs: HashSet<PathId> = job.outputs.iter().filter_map(|p| interner.intern(p)).collect();
	let sealed: Vec<SealedDirectory> = job
		.sealed_directories
		.iter()
		.filter_map(|(root, contents)| {
			let root_id = interner.intern(root)?;
			Some(SealedDirectory {
				root: root_id,
				contents: contents.iter().filter_map(|p| interner.intern(p)).collect(),
			})
		})
		.collect();
	let shared_opaque: Vec<SharedOpaqueRoot> = job
		.shared_opaque_roots
		.iter()
		.filter_map(|(root, exclusions)| {
			let root_id = interner.intern(root)?;
			Some(SharedOpaqueRoot {
				root: root_id,
				exclusions: exclusions.iter().filter_map(|p| interner.intern(p)).collect(),
			})
		})
		.collect();
	let declarations = Declarations {
		inputs: &inputs,
		sealed_directories: &sealed,
		outputs: &outputs,
		shared_opaque_roots: &shared_opaque,
	};

	let classified = classifier::classify(drained.accesses, &interner, &declarations, config, &NoopSymlinkResolver);

	// spec §4.F second paragraph: every recorded shared-opaque write is
	// no-follow probed to tell a required output from a discarded
	// temporary/directory, rather than surfacing the bare path list.
	let shared_opaque_writes: HashMap<PathId, Vec<(PathId, SharedOpaqueWriteClassification)>> = classified
		.shared_opaque_writes
		.into_iter()
		.map(|(root, paths)| {
			let classified_paths = paths
				.into_iter()
				.map(|path| (path, validator::classify_shared_opaque_write(path, &interner, &RealFileProbe)))
				.collect();
			(root, classified_paths)
		})
		.collect();

	let observed_paths: HashSet<PathId> = classified.observed.iter().map(|o| o.path).collect();
	let required_output_statuses = validator::validate_required_outputs(&outputs, &observed_paths, &interner, &RealFileProbe);
	let has_output_with_no_file_access = validator::has_output_with_no_file_access(&required_output_statuses);

	let diagnostic_file_nonempty = fs::metadata(&error_dump_path).map(|m| m.len() > 0).unwrap_or(false);

	let exit_code = if timed_out {
		retry::EXIT_CODE_TIMEOUT
	} else {
		exit_status.code().unwrap_or(retry::EXIT_CODE_NOT_INITIALIZED)
	};

	let outcome = TerminationOutcome {
		exit_code,
		cancelled,
		timed_out,
		messages_sent: None,
		messages_received: drained.messages_received,
		diagnostic_file_nonempty,
		has_output_with_no_file_access,
		stderr_has_writes: !stderr_bytes.is_empty(),
	};
	let status = retry::classify(&outcome, config.fail_on_stderr_writes, &config.user_retryable_exit_codes, config.infra_retries_enabled, budget);
	debug!(?status, exit_code, "classified");

	let surviving_child_processes = count_surviving_descendants(child_pid, &config.surviving_child_allowlist);

	Ok(ExecutionOutcome {
		status,
		exit_code,
		wall_clock: start.elapsed(),
		warning_count,
		accounting: AccountingInfo {
			file_accesses_observed: classified.observed.len() as u64,
			file_accesses_ignored: classified.ignored_count as u64,
			surviving_child_processes,
			peak_memory_bytes: None,
		},
		observed: classified.observed,
		shared_opaque_writes,
		unexpected: classified.unexpected,
	})
}

fn break_on_timeout_or_cancel(child: &mut std::process::Child, child_pid: u32) {
	kill_process_tree(child_pid);
	let _ = child.kill();
}
