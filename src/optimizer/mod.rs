//! Optimizer collaborator used by hybrid evaluation: adjusts the excitations
//! of one frame so the model output follows the measured joint torques.

mod annealing;

pub use annealing::*;

use crate::model::{ModelFrame, NmsModel};
use anyhow::Result;

/// Result of one recalibration.
#[derive(Debug, Clone)]
pub struct Calibration {
    /// Input frame with its excitations replaced by the calibrated ones.
    pub frame: ModelFrame,
    /// Model trials spent.
    pub evaluations: usize,
    pub objective: f64,
}

pub trait Optimizer: Send {
    /// Called exactly once per hybrid step. Must only use
    /// [`NmsModel::trial`] so the model state is not advanced.
    fn recalibrate(&mut self, frame: &ModelFrame, model: &dyn NmsModel) -> Result<Calibration>;
}
