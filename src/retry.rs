//! Classifies a terminated job into a final status and, where applicable,
//! a retry kind (component H, spec §4.H).

use std::collections::HashSet;

use crate::config::RetryBudget;

/// Pip exceeded its timeout.
pub const EXIT_CODE_TIMEOUT: i32 = 27_021_977;
/// A surviving child process was killed after its parent exited.
pub const EXIT_CODE_CHILD_KILLED_AFTER_PARENT_EXIT: i32 = 2_721_977;
/// Pip was killed due to an internal sandbox error.
pub const EXIT_CODE_SANDBOX_INTERNAL_ERROR: i32 = 2_271_977;
/// Sandbox report processing failure.
pub const EXIT_CODE_SANDBOX_REPORT_PROCESSING_FAILURE: i32 = 2_271_978;
/// Exit-code-not-initialized sentinel used for logs.
pub const EXIT_CODE_NOT_INITIALIZED: i32 = 0xBAAA_AAADu32 as i32;
/// Fixed Watson code the infra uses to terminate a process it considers
/// unrecoverable.
pub const EXIT_CODE_INFRA_WATSON: i32 = 0xDEAD;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FinalStatus {
	Succeeded,
	PreparationFailed,
	ExecutionFailed,
	Canceled,
	FileAccessMonitoringFailed,
	OutputWithNoFileAccessFailed,
	MismatchedMessageCount,
	RetryDueToUserExitCode,
	RetryDueToInfraExitCode,
}

impl FinalStatus {
	pub fn is_retryable(self) -> bool {
		matches!(self, Self::RetryDueToUserExitCode | Self::RetryDueToInfraExitCode)
	}
}

/// Everything the Retry Policy needs to know about a terminated job. Built
/// by the Orchestrator from the process exit, the channel drain, and the
/// Output Validator (spec §4.G step 9).
pub struct TerminationOutcome {
	pub exit_code: i32,
	pub cancelled: bool,
	/// Set when the job was killed for exceeding its wall-clock timeout;
	/// carried for diagnostics, the resulting status is still
	/// `ExecutionFailed` tagged with `exit_code == EXIT_CODE_TIMEOUT`
	/// (spec §5: "the result is tagged with the timeout exit code").
	pub timed_out: bool,
	/// The semaphore-counted number of reports the sandbox claims to have
	/// sent, if the sandbox reports that count at all.
	pub messages_sent: Option<u64>,
	pub messages_received: u64,
	/// Whether the enforcement layer's diagnostic dump file is non-empty.
	pub diagnostic_file_nonempty: bool,
	pub has_output_with_no_file_access: bool,
	pub stderr_has_writes: bool,
}

/// Classifies a terminated job, consuming from `budget` when a retry is
/// actually granted (spec §4.H; budget ownership per spec §9 supplemented
/// feature: the Orchestrator decrements a caller-owned counter).
pub fn classify(
	outcome: &TerminationOutcome,
	fail_on_stderr_writes: bool,
	user_retryable_exit_codes: &HashSet<i32>,
	infra_retries_enabled: bool,
	budget: &mut RetryBudget,
) -> FinalStatus {
	if outcome.cancelled {
		return FinalStatus::Canceled;
	}
	if let Some(sent) = outcome.messages_sent {
		if sent != outcome.messages_received {
			return FinalStatus::MismatchedMessageCount;
		}
	}
	if outcome.diagnostic_file_nonempty {
		return FinalStatus::FileAccessMonitoringFailed;
	}
	if outcome.exit_code == EXIT_CODE_INFRA_WATSON && infra_retries_enabled && budget.consume() {
		return FinalStatus::RetryDueToInfraExitCode;
	}
	if user_retryable_exit_codes.contains(&outcome.exit_code) && budget.consume() {
		return FinalStatus::RetryDueToUserExitCode;
	}
	if outcome.has_output_with_no_file_access {
		return FinalStatus::OutputWithNoFileAccessFailed;
	}
	let stderr_clean = !fail_on_stderr_writes || !outcome.stderr_has_writes;
	if outcome.exit_code == 0 && stderr_clean {
		return FinalStatus::Succeeded;
	}
	FinalStatus::ExecutionFailed
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base() -> TerminationOutcome {
		TerminationOutcome {
			exit_code: 0,
			cancelled: false,
			timed_out: false,
			messages_sent: Some(3),
			messages_received: 3,
			diagnostic_file_nonempty: false,
			has_output_with_no_file_access: false,
			stderr_has_writes: false,
		}
	}

	#[test]
	fn clean_exit_succeeds() {
		let mut budget = RetryBudget::new(0);
		let status = classify(&base(), false, &HashSet::new(), true, &mut budget);
		assert_eq!(status, FinalStatus::Succeeded);
	}

	#[test]
	fn cancellation_takes_priority_over_everything() {
		let mut outcome = base();
		outcome.cancelled = true;
		outcome.exit_code = 1;
		let mut budget = RetryBudget::new(5);
		let status = classify(&outcome, false, &HashSet::new(), true, &mut budget);
		assert_eq!(status, FinalStatus::Canceled);
	}

	#[test]
	fn mismatched_message_count_detected() {
		let mut outcome = base();
		outcome.messages_sent = Some(4);
		let mut budget = RetryBudget::new(0);
		let status = classify(&outcome, false, &HashSet::new(), true, &mut budget);
		assert_eq!(status, FinalStatus::MismatchedMessageCount);
	}

	#[test]
	fn infra_watson_code_retries_while_budget_remains() {
		let mut outcome = base();
		outcome.exit_code = EXIT_CODE_INFRA_WATSON;
		let mut budget = RetryBudget::new(1);
		let status = classify(&outcome, false, &HashSet::new(), true, &mut budget);
		assert_eq!(status, FinalStatus::RetryDueToInfraExitCode);
		assert!(!budget.has_remaining());
	}

	#[test]
	fn infra_watson_code_fails_once_budget_exhausted() {
		let mut outcome = base();
		outcome.exit_code = EXIT_CODE_INFRA_WATSON;
		let mut budget = RetryBudget::new(0);
		let status = classify(&outcome, false, &HashSet::new(), true, &mut budget);
		assert_eq!(status, FinalStatus::ExecutionFailed);
	}

	#[test]
	fn user_declared_retryable_exit_code_retries() {
		let mut outcome = base();
		outcome.exit_code = 17;
		let retryable: HashSet<i32> = [17].into_iter().collect();
		let mut budget = RetryBudget::new(2);
		let status = classify(&outcome, false, &retryable, true, &mut budget);
		assert_eq!(status, FinalStatus::RetryDueToUserExitCode);
	}

	#[test]
	fn output_with_no_file_access_overrides_zero_exit_code() {
		let mut outcome = base();
		outcome.has_output_with_no_file_access = true;
		let mut budget = RetryBudget::new(0);
		let status = classify(&outcome, false, &HashSet::new(), true, &mut budget);
		assert_eq!(status, FinalStatus::OutputWithNoFileAccessFailed);
	}

	#[test]
	fn stderr_writes_fail_when_configured() {
		let mut outcome = base();
		outcome.stderr_has_writes = true;
		let mut budget = RetryBudget::new(0);
		let status = classify(&outcome, true, &HashSet::new(), true, &mut budget);
		assert_eq!(status, FinalStatus::ExecutionFailed);
	}

	#[test]
	fn nonzero_exit_without_other_flags_is_execution_failed() {
		let mut outcome = base();
		outcome.exit_code = 1;
		let mut budget = RetryBudget::new(0);
		let status = classify(&outcome, false, &HashSet::new(), true, &mut budget);
		assert_eq!(status, FinalStatus::ExecutionFailed);
	}
}
