use super::DecodeError;

/// Frame capacity used for the first state allocation, so typical utterances
/// replay captured programs without a reallocation.
pub const INITIAL_MAX_TIME: usize = 375;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Staged implementation dispatched step by step, no captured programs.
    Eager,
    /// Init and step programs captured separately, the outer loop stays in code.
    PartialGraphs,
    /// One captured program with the decode loop inside, needs conditional
    /// capture support.
    FullGraph,
}

/// Capabilities of the execution target, checked before enabling full capture.
#[derive(Clone, Copy, Debug)]
pub struct DevicePlatform {
    pub supports_conditional_nodes: bool,
}

impl DevicePlatform {
    pub fn host() -> Self {
        DevicePlatform {
            supports_conditional_nodes: false,
        }
    }

    pub fn with_conditional_nodes() -> Self {
        DevicePlatform {
            supports_conditional_nodes: true,
        }
    }
}

pub(crate) type Stage<T> = fn(&mut T) -> Result<(), DecodeError>;

/// A recorded sequence of stages. Configuration branches are resolved when
/// the program is recorded, never during replay.
pub(crate) struct CapturedProgram<T> {
    stages: Vec<Stage<T>>,
}

impl<T> CapturedProgram<T> {
    pub(crate) fn record(stages: Vec<Stage<T>>) -> Self {
        CapturedProgram { stages }
    }

    pub(crate) fn replay(&self, target: &mut T) -> Result<(), DecodeError> {
        for stage in &self.stages {
            stage(target)?;
        }
        Ok(())
    }
}

/// Captured init and step programs; the caller drives the outer loop.
pub(crate) struct SeparateGraphs<T> {
    pub(crate) before_loop: CapturedProgram<T>,
    pub(crate) loop_body: CapturedProgram<T>,
}

/// One captured program with the loop inside, gated by a condition read from
/// the target after every iteration.
pub(crate) struct FullGraph<T> {
    pub(crate) before_loop: CapturedProgram<T>,
    pub(crate) loop_body: CapturedProgram<T>,
    pub(crate) condition: fn(&T) -> bool,
}

impl<T> FullGraph<T> {
    pub(crate) fn replay(&self, target: &mut T) -> Result<(), DecodeError> {
        self.before_loop.replay(target)?;
        while (self.condition)(target) {
            self.loop_body.replay(target)?;
        }
        Ok(())
    }
}
