use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution state shared by workflow instances and task instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created and handed to dispatch
    SubmittedSuccess,
    /// Accepted by a worker, not yet reported running
    Dispatch,
    RunningExecution,
    Success,
    Failure,
    Kill,
    /// Holding state reached through an operator stop
    Stop,
    /// Holding state reached through an operator pause
    Pause,
    /// Counted as successful by operator decision after failing or being killed
    ForcedSuccess,
    /// Owner died; must be re-dispatched on recovery
    NeedFaultTolerance,
    /// Waiting for a retry timer
    DelayExecution,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Kill | Self::ForcedSuccess
        )
    }

    /// States whose work is lost when the owning node dies
    pub fn is_should_failover(&self) -> bool {
        matches!(
            self,
            Self::SubmittedSuccess | Self::Dispatch | Self::RunningExecution | Self::DelayExecution
        )
    }

    /// Work is outstanding; the workflow cannot settle yet
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::SubmittedSuccess | Self::Dispatch | Self::RunningExecution | Self::DelayExecution
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::ForcedSuccess)
    }

    pub fn is_holding(&self) -> bool {
        matches!(self, Self::Pause | Self::Stop)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SubmittedSuccess => "submitted_success",
            Self::Dispatch => "dispatch",
            Self::RunningExecution => "running_execution",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Kill => "kill",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::ForcedSuccess => "forced_success",
            Self::NeedFaultTolerance => "need_fault_tolerance",
            Self::DelayExecution => "delay_execution",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted_success" => Ok(Self::SubmittedSuccess),
            "dispatch" => Ok(Self::Dispatch),
            "running_execution" => Ok(Self::RunningExecution),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "kill" => Ok(Self::Kill),
            "stop" => Ok(Self::Stop),
            "pause" => Ok(Self::Pause),
            "forced_success" => Ok(Self::ForcedSuccess),
            "need_fault_tolerance" => Ok(Self::NeedFaultTolerance),
            "delay_execution" => Ok(Self::DelayExecution),
            _ => Err(format!("Invalid execution status: {s}")),
        }
    }
}
