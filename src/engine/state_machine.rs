//! Task instance transition table
//!
//! Pure: given the current state and a [`TaskEvent`], returns the next state or
//! an invalid-transition error. The runnable logs and drops events that fail here.

use super::errors::{StateMachineError, StateMachineResult};
use super::event::TaskEvent;
use super::state::ExecutionStatus;

pub fn determine_target_state(
    current_state: ExecutionStatus,
    event: &TaskEvent,
) -> StateMachineResult<ExecutionStatus> {
    use ExecutionStatus::*;

    let target = match (current_state, event) {
        (SubmittedSuccess, TaskEvent::Dispatch) => Dispatch,

        // A running report can overtake the dispatch acknowledgement
        (SubmittedSuccess | Dispatch, TaskEvent::Ack) => RunningExecution,

        (SubmittedSuccess | Dispatch | RunningExecution, TaskEvent::Succeed) => Success,
        (SubmittedSuccess | Dispatch | RunningExecution, TaskEvent::Fail { retry: true }) => {
            DelayExecution
        }
        (SubmittedSuccess | Dispatch | RunningExecution, TaskEvent::Fail { retry: false }) => {
            Failure
        }
        (SubmittedSuccess | Dispatch | RunningExecution, TaskEvent::Killed) => Kill,

        (SubmittedSuccess, TaskEvent::DispatchFail) => Failure,

        (
            SubmittedSuccess | Dispatch | RunningExecution,
            TaskEvent::Failover { budget_left: true },
        ) => SubmittedSuccess,
        (
            SubmittedSuccess | Dispatch | RunningExecution,
            TaskEvent::Failover { budget_left: false },
        ) => Failure,

        (DelayExecution, TaskEvent::RetryTimer) => SubmittedSuccess,

        (RunningExecution, TaskEvent::Timeout) => Failure,

        (
            SubmittedSuccess | Dispatch | RunningExecution | DelayExecution | NeedFaultTolerance,
            TaskEvent::Pause,
        ) => Pause,
        (
            SubmittedSuccess | Dispatch | RunningExecution | DelayExecution | NeedFaultTolerance,
            TaskEvent::Kill,
        ) => Kill,

        (Pause | Stop | Kill | Failure | NeedFaultTolerance, TaskEvent::Recover) => {
            SubmittedSuccess
        }

        (Failure | Kill, TaskEvent::ForceSuccess) => ForcedSuccess,

        (from_state, _) => {
            return Err(StateMachineError::InvalidTransition {
                from: from_state,
                event: event.event_type().to_string(),
            })
        }
    };

    Ok(target)
}
