use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::{JobTask, TaskOutcome};

/// Master → queue control verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum M2Q {
    Terminate,
    Enqueue,
    Retrieve,
    UpdateReal,
}

/// Queue → master replies to `Retrieve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Q2M {
    RetrieveAccepted,
    RetrieveLater,
    RetrieveRejected,
}

/// Queue → worker control verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Q2W {
    Terminate,
    DequeueRejected,
    DequeueAccepted,
    UpdateReal,
    ResultReceived,
}

/// Worker → queue requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum W2Q {
    Dequeue,
    SendResult,
}

/// Connection-test ping/pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum X2X {
    Ping,
    Pong,
}

/// Payload of `UpdateReal`: one parameter of one job changed on the master.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterUpdate {
    pub job_id: u64,
    pub index: usize,
    pub value: f64,
    pub is_constant: bool,
}

/// Payload of `SendResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub job_task: JobTask,
    pub outcome: TaskOutcome,
}

/// Payload following `RetrieveAccepted`: every job's buffered results,
/// tasks in ascending `task_id` order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultBundle {
    pub jobs: Vec<JobResultSet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultSet {
    pub job_id: u64,
    pub results: Vec<(u64, TaskOutcome)>,
}

impl fmt::Display for M2Q {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            M2Q::Terminate => write!(f, "terminate"),
            M2Q::Enqueue => write!(f, "enqueue"),
            M2Q::Retrieve => write!(f, "retrieve"),
            M2Q::UpdateReal => write!(f, "update_real"),
        }
    }
}

impl fmt::Display for Q2M {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Q2M::RetrieveAccepted => write!(f, "retrieve_accepted"),
            Q2M::RetrieveLater => write!(f, "retrieve_later"),
            Q2M::RetrieveRejected => write!(f, "retrieve_rejected"),
        }
    }
}

impl fmt::Display for Q2W {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Q2W::Terminate => write!(f, "terminate"),
            Q2W::DequeueRejected => write!(f, "dequeue_rejected"),
            Q2W::DequeueAccepted => write!(f, "dequeue_accepted"),
            Q2W::UpdateReal => write!(f, "update_real"),
            Q2W::ResultReceived => write!(f, "result_received"),
        }
    }
}

impl fmt::Display for W2Q {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            W2Q::Dequeue => write!(f, "dequeue"),
            W2Q::SendResult => write!(f, "send_result"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_render_their_protocol_names() {
        assert_eq!(M2Q::UpdateReal.to_string(), "update_real");
        assert_eq!(M2Q::Terminate.to_string(), "terminate");
        assert_eq!(Q2M::RetrieveLater.to_string(), "retrieve_later");
        assert_eq!(Q2W::DequeueAccepted.to_string(), "dequeue_accepted");
        assert_eq!(W2Q::SendResult.to_string(), "send_result");
    }
}
