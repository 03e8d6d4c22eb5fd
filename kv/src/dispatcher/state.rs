//! Job and pipeline state machines, persisted through the MVCC store by
//! callers (`dispatcher::server`/`dispatcher::client`) inside a
//! transaction so a state read always reflects a fully-applied
//! transition.

use serde::{Deserialize, Serialize};

use crate::error::{CResult, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    /// Validates and applies `to`, rejecting any edge not in
    /// `Pending -> Running -> {Completed | Failed}`.
    pub fn transition(self, to: JobState) -> CResult<JobState> {
        use JobState::*;
        let allowed = matches!(
            (self, to),
            (Pending, Running) | (Running, Completed) | (Running, Failed)
        );
        if allowed {
            Ok(to)
        } else {
            Err(Error::ProtocolError(format!("invalid job transition {self:?} -> {to:?}")))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Scheduled,
    Running,
    Paused,
    Completed,
}

impl PipelineState {
    /// Validates and applies `to`, rejecting any edge not in
    /// `Scheduled -> Running -> {Paused <-> Running} -> Completed`.
    pub fn transition(self, to: PipelineState) -> CResult<PipelineState> {
        use PipelineState::*;
        let allowed = matches!(
            (self, to),
            (Scheduled, Running) | (Running, Paused) | (Paused, Running) | (Running, Completed)
        );
        if allowed {
            Ok(to)
        } else {
            Err(Error::ProtocolError(format!("invalid pipeline transition {self:?} -> {to:?}")))
        }
    }
}
