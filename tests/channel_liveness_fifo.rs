//! Exercises [`pip_sandbox::channel::ReportChannel`] over a real named FIFO
//! (spec §4.D), complementing the in-memory [`LivenessTracker`] unit tests
//! in `src/channel.rs` with the actual POSIX transport.

use std::io::Write as _;
use std::path::PathBuf;

use pip_sandbox::channel::ReportChannel;
use pip_sandbox::path_interner::PathInterner;
use pretty_assertions::assert_eq;
use tempfile::tempdir;

/// Builds one length-prefixed `FileAccess` frame reporting a process-exit
/// for `pid`, matching the wire framing in spec §4.D.
fn process_exit_frame(pid: u32) -> Vec<u8> {
	let payload = format!("0|waitpid|process-exit|{pid}|1||0|allowed|0|0|0|/");
	let mut frame = Vec::with_capacity(4 + payload.len());
	frame.extend_from_slice(&(payload.len() as i32).to_le_bytes());
	frame.extend_from_slice(payload.as_bytes());
	frame
}

/// Installs a `tracing_subscriber` test-writer subscriber so the
/// `trace!`/`debug!` events `channel.rs` emits for the sentinel dance land
/// in the test harness's captured output instead of being silently
/// dropped. Safe to call more than once per process.
fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_test_writer()
		.with_env_filter("pip_sandbox=trace")
		.try_init();
}

#[test]
fn drain_completes_after_root_process_exit_with_no_descendants() {
	init_tracing();
	let dir = tempdir().unwrap();
	let fifo_path: PathBuf = dir.path().join("report.fifo");
	let root_pid = 4_242;

	let channel = ReportChannel::open(fifo_path.clone(), root_pid).unwrap();
	channel.record_process_start(root_pid);

	// Stands in for the (out-of-scope) enforcement layer: a single
	// ProcessExit report for the root pid, written from a second producer
	// opening the same FIFO. The host's own sentinel dance (writing `-21`
	// then `-22` back into the same channel) happens inside `drain()`.
	std::fs::OpenOptions::new()
		.write(true)
		.open(&fifo_path)
		.unwrap()
		.write_all(&process_exit_frame(root_pid))
		.unwrap();

	let interner = PathInterner::new();
	let drained = channel.drain(&interner).unwrap();

	assert_eq!(drained.messages_received, 1);
	assert_eq!(drained.accesses.len(), 1);
	assert!(!drained.orphans_active);
	assert!(channel.orphans_active() == drained.orphans_active);
}

#[test]
fn orphans_flagged_when_root_exits_before_descendant() {
	init_tracing();
	let dir = tempdir().unwrap();
	let fifo_path: PathBuf = dir.path().join("report.fifo");
	let root_pid = 100;
	let child_pid = 101;

	let channel = ReportChannel::open(fifo_path.clone(), root_pid).unwrap();
	channel.record_process_start(root_pid);
	channel.record_process_start(child_pid);

	let mut writer = std::fs::OpenOptions::new().write(true).open(&fifo_path).unwrap();
	writer.write_all(&process_exit_frame(root_pid)).unwrap();
	writer.write_all(&process_exit_frame(child_pid)).unwrap();

	let interner = PathInterner::new();
	let drained = channel.drain(&interner).unwrap();

	assert_eq!(drained.messages_received, 2);
	assert!(drained.orphans_active);
}
