use std::path::PathBuf;

use crate::path_interner::PathId;

/// Errors raised while mutating or finalizing a [`crate::manifest::ManifestTree`].
#[derive(Debug, derive_more::Display)]
pub enum ConstructionError {
	#[display("manifest tree is already finalized and cannot accept new scopes")]
	AlreadyFinalized,
	#[display("path {path:?} is not a valid node to scope directly (use the synthetic root instead)")]
	InvalidPath { path: PathId },
	#[display("conflicting expected USNs for the same node: {existing} vs {new}")]
	ConflictingUsn { existing: u64, new: u64 },
}
impl std::error::Error for ConstructionError {}

/// Errors surfaced by the [`crate::channel::ReportChannel`] transport.
#[derive(Debug, derive_more::Display)]
pub enum ChannelError {
	#[display("failed to open report channel at {path:?}: {source}")]
	Open {
		path: PathBuf,
		source: std::io::Error,
	},
	#[display("report channel read failed: {source}")]
	Read { source: std::io::Error },
	#[display("report channel write failed: {source}")]
	Write { source: std::io::Error },
	#[display("malformed frame: {reason}")]
	MalformedFrame { reason: String },
	#[display("channel closed while shutdown was not yet underway")]
	PrematureEof,
}
impl std::error::Error for ChannelError {}

/// Errors raised when the monitored process could not be started at all.
#[derive(Debug, derive_more::Display)]
pub enum ProcessStartError {
	#[display("OS refused to spawn process: {source}")]
	Spawn { source: std::io::Error },
	#[display("retry budget for partial-copy spawn failures exhausted")]
	RetryBudgetExhausted,
}
impl std::error::Error for ProcessStartError {}

/// Raised when a job's wall-clock deadline elapses.
#[derive(Debug, derive_more::Display)]
#[display("job exceeded its wall-clock timeout")]
pub struct TimeoutError;
impl std::error::Error for TimeoutError {}

/// Errors from the [`crate::validator::OutputValidator`] and report-count checks.
#[derive(Debug, derive_more::Display)]
pub enum ValidationError {
	#[display("declared output {path:?} was never observed and does not exist")]
	OutputMissing { path: PathId },
	#[display("declared output {path:?} exists but was never observed as an access")]
	OutputWithNoFileAccess { path: PathId },
	#[display("message count mismatch: sandbox sent {sent}, host received {received}")]
	MismatchedMessageCount { sent: u64, received: u64 },
}
impl std::error::Error for ValidationError {}

/// Raised when a job is cancelled by an external token.
#[derive(Debug, derive_more::Display)]
#[display("job was cancelled")]
pub struct CancellationError;
impl std::error::Error for CancellationError {}

/// Aggregate error returned by the orchestrator's preparation path.
///
/// Errors from manifest construction propagate immediately (per spec §7);
/// this enum exists for the orchestrator's own `?`-based plumbing.
#[derive(Debug, derive_more::Display, derive_more::From)]
pub enum ExecutionError {
	#[display("{_0}")]
	Construction(ConstructionError),
	#[display("{_0}")]
	Channel(ChannelError),
	#[display("{_0}")]
	ProcessStart(ProcessStartError),
	#[display("{_0}")]
	Timeout(TimeoutError),
	#[display("{_0}")]
	Validation(ValidationError),
	#[display("{_0}")]
	Cancellation(CancellationError),
	#[display("preparation failed: {_0}")]
	Preparation(String),
}
impl std::error::Error for ExecutionError {}

pub type ExecutionResult<T> = Result<T, ExecutionError>;
