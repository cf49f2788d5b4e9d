//! Per-job report channel: framed message stream plus the liveness/shutdown
//! protocol that decides, without races, when the monitored process tree
//! has truly completed (component D).
//!
//! The hard part — §4.D's sentinel dance — is split out as [`LivenessTracker`],
//! a plain state machine with no I/O, so the scenarios in spec §8 can be
//! tested without a real FIFO. [`ReportChannel`] wraps it with the actual
//! POSIX named-pipe transport; only a FIFO backend is implemented here
//! (the kernel-module/eBPF backends spec §9 calls out as sibling transports
//! are out of this crate's scope, same as the enforcement mechanism itself).

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::access::{DecisionStatus, OperationKind, ReportedAccess, RequestedAccess};
use crate::error::ChannelError;
use crate::path_interner::{PathId, PathInterner};

pub const SENTINEL_NO_ACTIVE_PROCESSES: i32 = -21;
pub const SENTINEL_END_OF_REPORTS: i32 = -22;

/// One report-type tag, the leading field of a `FileAccess`/`DebugMessage`
/// payload (spec §4.D: "whose schema depends on the leading integer").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ReportKind {
	FileAccess = 0,
	DebugMessage = 1,
}

impl ReportKind {
	fn from_tag(tag: &str) -> Result<Self, ChannelError> {
		match tag {
			"0" => Ok(Self::FileAccess),
			"1" => Ok(Self::DebugMessage),
			other => Err(ChannelError::MalformedFrame {
				reason: format!("unknown report type tag `{other}`"),
			}),
		}
	}
}

/// One frame read off the channel, after length-prefix and `|`-field
/// parsing (spec §4.D wire framing).
#[derive(Clone, Debug)]
pub enum Frame {
	FileAccess(RawFileAccess),
	DebugMessage { pid: u32, severity: u32, text: String },
	NoActiveProcesses,
	EndOfReports,
}

/// A `FileAccess` frame with its path still a string — resolved to a
/// [`PathId`] by the caller (the classifier drops anything unparseable,
/// spec §4.E step 1), not by the channel itself.
#[derive(Clone, Debug)]
pub struct RawFileAccess {
	pub system_call: String,
	pub operation: OperationKind,
	pub pid: u32,
	pub parent_pid: u32,
	pub errno: Option<i32>,
	pub requested: RequestedAccess,
	pub status: DecisionStatus,
	pub explicit_report: bool,
	pub is_directory_location: bool,
	pub path_truncated: bool,
	pub path: String,
	pub command_line: Option<String>,
}

impl RawFileAccess {
	/// Resolves `self.path` through `interner`, producing the classifier's
	/// [`ReportedAccess`]. Returns `None` if the path does not intern
	/// (spec §4.E step 1: "Drop entries whose path is unparseable").
	pub fn resolve(&self, interner: &PathInterner) -> Option<ReportedAccess> {
		let path = interner.intern(Path::new(&self.path))?;
		Some(ReportedAccess {
			operation: self.operation,
			pid: self.pid,
			parent_pid: self.parent_pid,
			requested: self.requested,
			status: self.status,
			path,
			path_truncated: self.path_truncated,
			is_directory_location: self.is_directory_location,
			explicit_report: self.explicit_report,
			requested_usn: None,
			error_code: self.errno,
		})
	}
}

fn parse_operation(field: &str) -> Result<OperationKind, ChannelError> {
	Ok(match field {
		"create" => OperationKind::Create,
		"open" => OperationKind::Open,
		"read" => OperationKind::Read,
		"write" => OperationKind::Write,
		"delete" => OperationKind::Delete,
		"rename" => OperationKind::Rename,
		"enumerate" => OperationKind::Enumerate,
		"probe" => OperationKind::Probe,
		"process-start" => OperationKind::ProcessStart,
		"process-exit" => OperationKind::ProcessExit,
		"process-breakaway" => OperationKind::ProcessBreakaway,
		other => {
			return Err(ChannelError::MalformedFrame {
				reason: format!("unknown operation `{other}`"),
			});
		}
	})
}

fn parse_requested_access(field: &str) -> Result<RequestedAccess, ChannelError> {
	let bits: u8 = field.parse().map_err(|_| ChannelError::MalformedFrame {
		reason: format!("requested_access `{field}` is not a number"),
	})?;
	Ok(RequestedAccess::from_bits(bits))
}

fn parse_status(field: &str) -> Result<DecisionStatus, ChannelError> {
	Ok(match field {
		"allowed" => DecisionStatus::Allowed,
		"denied" => DecisionStatus::Denied,
		"cannot-determine" => DecisionStatus::CannotDetermine,
		other => {
			return Err(ChannelError::MalformedFrame {
				reason: format!("unknown status `{other}`"),
			});
		}
	})
}

fn parse_bool_flag(field: &str) -> Result<bool, ChannelError> {
	match field {
		"0" => Ok(false),
		"1" => Ok(true),
		other => Err(ChannelError::MalformedFrame {
			reason: format!("expected 0/1 flag, got `{other}`"),
		}),
	}
}

/// Parses one `|`-delimited payload into a [`Frame`] (spec §4.D).
fn parse_payload(payload: &str) -> Result<Frame, ChannelError> {
	let mut fields = payload.split('|');
	let tag = fields.next().ok_or_else(|| ChannelError::MalformedFrame {
		reason: "empty payload".to_string(),
	})?;
	match ReportKind::from_tag(tag)? {
		ReportKind::FileAccess => {
			let mut next = || {
				fields.next().ok_or_else(|| ChannelError::MalformedFrame {
					reason: "truncated FileAccess payload".to_string(),
				})
			};
			let system_call = next()?.to_string();
			let operation = parse_operation(next()?)?;
			let pid: u32 = next()?.parse().map_err(|_| ChannelError::MalformedFrame {
				reason: "invalid pid".to_string(),
			})?;
			let parent_pid: u32 = next()?.parse().map_err(|_| ChannelError::MalformedFrame {
				reason: "invalid ppid".to_string(),
			})?;
			let errno_field = next()?;
			let errno = if errno_field.is_empty() {
				None
			} else {
				Some(errno_field.parse().map_err(|_| ChannelError::MalformedFrame {
					reason: "invalid errno".to_string(),
				})?)
			};
			let requested = parse_requested_access(next()?)?;
			let status = parse_status(next()?)?;
			let explicit_report = parse_bool_flag(next()?)?;
			let is_directory_location = parse_bool_flag(next()?)?;
			let path_truncated = parse_bool_flag(next()?)?;
			let path = next()?.to_string();
			let command_line = fields.next().map(str::to_string);
			Ok(Frame::FileAccess(RawFileAccess {
				system_call,
				operation,
				pid,
				parent_pid,
				errno,
				requested,
				status,
				explicit_report,
				is_directory_location,
				path_truncated,
				path,
				command_line,
			}))
		}
		ReportKind::DebugMessage => {
			let mut next = || {
				fields.next().ok_or_else(|| ChannelError::MalformedFrame {
					reason: "truncated DebugMessage payload".to_string(),
				})
			};
			let pid: u32 = next()?.parse().map_err(|_| ChannelError::MalformedFrame {
				reason: "invalid pid".to_string(),
			})?;
			let severity: u32 = next()?.parse().map_err(|_| ChannelError::MalformedFrame {
				reason: "invalid severity".to_string(),
			})?;
			let text = fields.collect::<Vec<_>>().join("|");
			Ok(Frame::DebugMessage { pid, severity, text })
		}
	}
}

/// Reads one length-prefixed frame from any byte source, so the framing
/// logic is exercised in tests against an in-memory buffer and in
/// production against the FIFO's `File` handle.
pub fn read_frame<R: Read>(mut reader: R) -> Result<Frame, ChannelError> {
	let mut len_bytes = [0u8; 4];
	match reader.read_exact(&mut len_bytes) {
		Ok(()) => {}
		Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
			return Err(ChannelError::PrematureEof);
		}
		Err(err) => return Err(ChannelError::Read { source: err }),
	}
	let len = i32::from_le_bytes(len_bytes);
	if len == SENTINEL_NO_ACTIVE_PROCESSES {
		return Ok(Frame::NoActiveProcesses);
	}
	if len == SENTINEL_END_OF_REPORTS {
		return Ok(Frame::EndOfReports);
	}
	if len <= 0 {
		return Err(ChannelError::MalformedFrame {
			reason: format!("reserved negative length {len}"),
		});
	}
	let mut payload = vec![0u8; len as usize];
	reader.read_exact(&mut payload).map_err(|err| ChannelError::Read { source: err })?;
	let text = String::from_utf8(payload).map_err(|_| ChannelError::MalformedFrame {
		reason: "payload is not valid UTF-8".to_string(),
	})?;
	parse_payload(&text)
}

fn write_sentinel_frame<W: Write>(mut writer: W, value: i32) -> Result<(), ChannelError> {
	match writer.write_all(&value.to_le_bytes()) {
		Ok(()) => Ok(()),
		Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
			// spec §4.D point 4: "writing when no reader is attached yields
			// a broken-pipe error which is treated as 'already shutting down'".
			Ok(())
		}
		Err(err) => Err(ChannelError::Write { source: err }),
	}
}

/// Outcome of feeding a process-lifecycle event to [`LivenessTracker`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LivenessAction {
	None,
	/// The active-process set just reached zero; the host must write the
	/// `-21` sentinel (spec §4.D point 2).
	EmitNoActiveProcesses,
}

/// Pure liveness/shutdown state machine (spec §4.D), with no I/O. Kept
/// separate from [`ReportChannel`] so the scenarios in spec §8 are plain
/// unit tests.
pub struct LivenessTracker {
	active: HashSet<u32>,
	/// Pids that broke away; re-adding a tombstoned pid (spec §4.D point 5:
	/// "a new process reused the id") clears the tombstone instead of being
	/// treated as a still-live breakaway.
	tombstones: HashSet<u32>,
	root_pid: u32,
	root_start_seen: bool,
	root_abrupt_removal_handled: bool,
	orphans_active: bool,
}

impl LivenessTracker {
	pub fn new(root_pid: u32) -> Self {
		Self {
			active: HashSet::new(),
			tombstones: HashSet::new(),
			root_pid,
			root_start_seen: false,
			root_abrupt_removal_handled: false,
			orphans_active: false,
		}
	}

	pub fn on_process_start(&mut self, pid: u32) {
		self.tombstones.remove(&pid);
		self.active.insert(pid);
		if pid == self.root_pid {
			self.root_start_seen = true;
		}
	}

	pub fn on_process_exit(&mut self, pid: u32) -> LivenessAction {
		self.remove_active(pid)
	}

	pub fn on_process_breakaway(&mut self, pid: u32) -> LivenessAction {
		self.tombstones.insert(pid);
		self.remove_active(pid)
	}

	fn remove_active(&mut self, pid: u32) -> LivenessAction {
		// spec §4.D special case: the root process may be removed before any
		// ProcessStart for it was seen (abrupt termination). Synthesize the
		// drained transition exactly once instead of touching the active set
		// for a pid that was never recorded as started.
		if pid == self.root_pid && !self.root_start_seen {
			if self.root_abrupt_removal_handled {
				return LivenessAction::None;
			}
			self.root_abrupt_removal_handled = true;
		} else {
			self.active.remove(&pid);
		}

		if pid == self.root_pid && !self.active.is_empty() {
			self.orphans_active = true;
		}

		if self.active.is_empty() {
			LivenessAction::EmitNoActiveProcesses
		} else {
			LivenessAction::None
		}
	}

	pub fn is_empty(&self) -> bool {
		self.active.is_empty()
	}

	pub fn orphans_active(&self) -> bool {
		self.orphans_active
	}
}

struct ChannelState {
	liveness: LivenessTracker,
	/// One-shot guard so a second `-22` (e.g. a duplicate wakeup) is not
	/// written twice; serialized with the rest of the critical section per
	/// spec §4.D point 4.
	end_of_reports_sent: bool,
	messages_received: u64,
	/// Set by [`ReportChannel::close_write_handle`]. Once true, a
	/// `PrematureEof` observed by [`ReportChannel::drain`] is the expected
	/// shape of shutdown rather than a monitoring failure.
	shutdown_requested: bool,
}

/// A per-job named-FIFO report channel. Holds both a read and a write
/// handle on the same FIFO (spec §4.D: "The host keeps a write handle open
/// on the channel in addition to the read handle; this prevents spurious
/// EOF"). The write handle is dropped on the cancellation/timeout path
/// (see [`Self::close_write_handle`]) so the reader can observe real EOF,
/// hence it lives behind a lock rather than as a plain field a `&self`
/// method could never close.
pub struct ReportChannel {
	fifo_path: PathBuf,
	read_handle: File,
	write_handle: Mutex<Option<File>>,
	state: Mutex<ChannelState>,
}

impl ReportChannel {
	/// Creates the FIFO at `fifo_path` and opens both ends. `root_pid` seeds
	/// the [`LivenessTracker`] used to drive the shutdown dance.
	pub fn open(fifo_path: PathBuf, root_pid: u32) -> Result<Self, ChannelError> {
		match nix::unistd::mkfifo(&fifo_path, nix::sys::stat::Mode::from_bits_truncate(0o600)) {
			Ok(()) => {}
			Err(nix::errno::Errno::EEXIST) => {}
			Err(err) => {
				return Err(ChannelError::Open {
					path: fifo_path,
					source: io::Error::from_raw_os_error(err as i32),
				});
			}
		}

		// open the write end first so the subsequent read-end open (which
		// would otherwise block waiting for a writer) returns immediately.
		let write_handle = fs::OpenOptions::new()
			.write(true)
			.custom_flags(libc::O_NONBLOCK)
			.open(&fifo_path)
			.map_err(|err| ChannelError::Open {
				path: fifo_path.clone(),
				source: err,
			})?;
		let read_handle = File::open(&fifo_path).map_err(|err| ChannelError::Open {
			path: fifo_path.clone(),
			source: err,
		})?;

		Ok(Self {
			fifo_path,
			read_handle,
			write_handle: Mutex::new(Some(write_handle)),
			state: Mutex::new(ChannelState {
				liveness: LivenessTracker::new(root_pid),
				end_of_reports_sent: false,
				messages_received: 0,
				shutdown_requested: false,
			}),
		})
	}

	pub fn path(&self) -> &Path {
		&self.fifo_path
	}

	pub fn record_process_start(&self, pid: u32) {
		self.state.lock().unwrap().liveness.on_process_start(pid);
	}

	pub fn record_process_exit(&self, pid: u32) -> Result<(), ChannelError> {
		let action = {
			let mut state = self.state.lock().unwrap();
			state.liveness.on_process_exit(pid)
		};
		self.apply_action(action)
	}

	pub fn record_process_breakaway(&self, pid: u32) -> Result<(), ChannelError> {
		let action = {
			let mut state = self.state.lock().unwrap();
			state.liveness.on_process_breakaway(pid)
		};
		self.apply_action(action)
	}

	fn apply_action(&self, action: LivenessAction) -> Result<(), ChannelError> {
		if action == LivenessAction::EmitNoActiveProcesses {
			debug!("active-process set reached zero, emitting -21 sentinel");
			self.write_sentinel(SENTINEL_NO_ACTIVE_PROCESSES)?;
		}
		Ok(())
	}

	/// Writes a sentinel frame if the write handle is still open; a no-op
	/// once [`Self::close_write_handle`] has taken it, same as the
	/// already-swallowed broken-pipe case in [`write_sentinel_frame`].
	fn write_sentinel(&self, value: i32) -> Result<(), ChannelError> {
		match self.write_handle.lock().unwrap().as_ref() {
			Some(handle) => write_sentinel_frame(handle, value),
			None => Ok(()),
		}
	}

	pub fn orphans_active(&self) -> bool {
		self.state.lock().unwrap().liveness.orphans_active()
	}

	/// Reads and classifies frames until `-22` is observed, driving the
	/// liveness dance for `ProcessStart`/`ProcessExit`/`ProcessBreakaway`
	/// frames internally so callers only see `FileAccess`/`DebugMessage`.
	/// Returns the fully resolved accesses plus the message count the
	/// reader actually received, for the orchestrator's message-count check.
	pub fn drain(&self, interner: &PathInterner) -> Result<DrainedReports, ChannelError> {
		let mut accesses = Vec::new();
		let mut debug_messages = Vec::new();
		loop {
			let frame = match read_frame(&self.read_handle) {
				Ok(frame) => frame,
				Err(ChannelError::PrematureEof) if self.state.lock().unwrap().shutdown_requested => {
					// spec §7: downgraded to "end of reports" since shutdown
					// was already underway (`close_write_handle` was called),
					// rather than surfacing as `FileAccessMonitoringFailed`.
					debug!("observed EOF during shutdown, treating as end-of-reports");
					break;
				}
				Err(err) => return Err(err),
			};
			match frame {
				Frame::FileAccess(raw) => {
					trace!(pid = raw.pid, op = ?raw.operation, path = %raw.path, "report frame");
					self.state.lock().unwrap().messages_received += 1;
					match raw.operation {
						OperationKind::ProcessStart => self.record_process_start(raw.pid),
						OperationKind::ProcessExit => self.record_process_exit(raw.pid)?,
						OperationKind::ProcessBreakaway => self.record_process_breakaway(raw.pid)?,
						_ => {}
					}
					if let Some(resolved) = raw.resolve(interner) {
						accesses.push(resolved);
					}
				}
				Frame::DebugMessage { pid, severity, text } => {
					trace!(pid, severity, %text, "debug message frame");
					self.state.lock().unwrap().messages_received += 1;
					debug_messages.push((pid, severity, text));
				}
				Frame::NoActiveProcesses => {
					debug!("observed -21 sentinel, rechecking active-process set");
					let should_close = {
						let mut state = self.state.lock().unwrap();
						if state.liveness.is_empty() && !state.end_of_reports_sent {
							state.end_of_reports_sent = true;
							true
						} else {
							false
						}
					};
					// spec §4.D point 3: if a ProcessStart arrived between the
					// `-21` write and this drain, the active set is non-empty
					// again and the `-21` is simply ignored; the dance repeats
					// next time the set reaches zero.
					if should_close {
						debug!("active-process set still empty, emitting -22 sentinel");
						self.write_sentinel(SENTINEL_END_OF_REPORTS)?;
					} else {
						trace!("active-process set non-empty again, ignoring -21");
					}
				}
				Frame::EndOfReports => {
					debug!("observed -22 sentinel, report channel drained");
					break;
				}
			}
		}
		let messages_received = self.state.lock().unwrap().messages_received;
		Ok(DrainedReports {
			accesses,
			debug_messages,
			messages_received,
			orphans_active: self.orphans_active(),
		})
	}

	/// Cancellation/timeout path: closes the write handle so no further
	/// sentinel writes can occur, and the reader's next blocking
	/// `read_frame` call observes EOF once every other writer (the killed
	/// process tree) has also gone away, rather than hanging forever
	/// waiting for a `-22` that will never arrive. Idempotent — taking an
	/// already-`None` handle is a no-op.
	pub fn close_write_handle(&self) {
		self.state.lock().unwrap().shutdown_requested = true;
		self.write_handle.lock().unwrap().take();
	}
}

/// Result of draining one job's report channel to completion.
pub struct DrainedReports {
	pub accesses: Vec<ReportedAccess>,
	pub debug_messages: Vec<(u32, u32, String)>,
	pub messages_received: u64,
	pub orphans_active: bool,
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn scenario_4_wire_sentinel_dance() {
		// send(-21), ProcessStart pid=7, (-21 again), ProcessExit pid=7, (-22)
		let mut tracker = LivenessTracker::new(7);
		assert_eq!(tracker.on_process_exit(999), LivenessAction::None); // unrelated pid, still empty
		tracker.on_process_start(7);
		assert!(!tracker.is_empty());
		let action = tracker.on_process_exit(7);
		assert_eq!(action, LivenessAction::EmitNoActiveProcesses);
		assert!(tracker.is_empty());
	}

	#[test]
	fn scenario_5_pid_reuse_clears_tombstone() {
		let mut tracker = LivenessTracker::new(1);
		tracker.on_process_start(42);
		tracker.on_process_breakaway(42);
		assert!(tracker.is_empty());
		tracker.on_process_start(42);
		assert!(!tracker.is_empty());
	}

	#[test]
	fn root_abrupt_removal_is_synthesized_once() {
		let mut tracker = LivenessTracker::new(1);
		// root exits without ever having been reported as started
		let first = tracker.on_process_exit(1);
		assert_eq!(first, LivenessAction::EmitNoActiveProcesses);
		// a duplicate exit report for the same never-started pid is a no-op
		let second = tracker.on_process_exit(1);
		assert_eq!(second, LivenessAction::None);
	}

	#[test]
	fn orphans_flagged_when_root_exits_with_descendants_active() {
		let mut tracker = LivenessTracker::new(1);
		tracker.on_process_start(1);
		tracker.on_process_start(2);
		tracker.on_process_exit(1);
		assert!(tracker.orphans_active());
		assert!(!tracker.is_empty());
	}

	#[test]
	fn parses_file_access_payload() {
		let payload = "0|open|123|1|0|3|allowed|1|0|0|/src/a.h";
		let frame = parse_payload(payload).unwrap();
		match frame {
			Frame::FileAccess(raw) => {
				assert_eq!(raw.pid, 123);
				assert_eq!(raw.parent_pid, 1);
				assert_eq!(raw.path, "/src/a.h");
				assert!(raw.explicit_report);
				assert!(matches!(raw.status, DecisionStatus::Allowed));
			}
			_ => panic!("expected FileAccess"),
		}
	}

	#[test]
	fn parses_debug_message_payload() {
		let frame = parse_payload("1|55|2|hello world").unwrap();
		match frame {
			Frame::DebugMessage { pid, severity, text } => {
				assert_eq!(pid, 55);
				assert_eq!(severity, 2);
				assert_eq!(text, "hello world");
			}
			_ => panic!("expected DebugMessage"),
		}
	}

	#[test]
	fn read_frame_recognizes_sentinels() {
		let mut buf = Vec::new();
		buf.extend_from_slice(&SENTINEL_NO_ACTIVE_PROCESSES.to_le_bytes());
		buf.extend_from_slice(&SENTINEL_END_OF_REPORTS.to_le_bytes());
		let mut cursor = Cursor::new(buf);
		assert!(matches!(read_frame(&mut cursor).unwrap(), Frame::NoActiveProcesses));
		assert!(matches!(read_frame(&mut cursor).unwrap(), Frame::EndOfReports));
	}

	#[test]
	fn read_frame_rejects_reserved_negative_length() {
		let buf = (-5i32).to_le_bytes().to_vec();
		let mut cursor = Cursor::new(buf);
		assert!(matches!(read_frame(&mut cursor), Err(ChannelError::MalformedFrame { .. })));
	}
}
