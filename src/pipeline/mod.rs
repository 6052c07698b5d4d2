//! Pipeline stages. Each stage runs on its own named OS thread and talks to
//! its neighbours only through channel bundles.

pub mod evaluator;
pub mod sink;
pub mod source;

use crate::error::PipelineResult;

/// Outcome of one driver step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StepOutcome {
    /// One unit of work was processed; call `step` again.
    Stepped,
    /// Inputs are exhausted and completion has been signalled downstream.
    Drained,
}

/// Uniform stepping interface of the evaluator variants.
pub trait StepDriver: Send {
    /// Processes one unit of work, blocking on inputs as needed.
    fn step(&mut self) -> PipelineResult<StepOutcome>;

    fn is_done(&self) -> bool;

    /// Steps until drained.
    fn run(&mut self) -> PipelineResult<()> {
        while !self.is_done() {
            if self.step()? == StepOutcome::Drained {
                break;
            }
        }
        Ok(())
    }
}
