//! Model collaborator: the per-step biomechanical evaluation consumed by the
//! evaluator. The pipeline treats it as opaque; [`muscle::MuscleModel`] is the
//! reference implementation wired in by the strategy registry.

pub mod muscle;

use crate::series::TimeSeriesRecord;
use anyhow::{Result, anyhow};
use std::collections::BTreeMap;

/// Input channel carrying muscle excitations.
pub const EXCITATIONS: &str = "excitations";
/// Input channel carrying musculotendon lengths.
pub const LENGTHS: &str = "lengths";
/// Input channel carrying external joint torques.
pub const EXTERNAL_TORQUES: &str = "external_torques";
/// Prefix of the per-DoF moment arm input channels.
pub const MOMENT_ARMS_PREFIX: &str = "moment_arms.";

pub const ACTIVATIONS: &str = "Activations";
pub const FIBER_LENGTHS: &str = "FiberLengths";
pub const FIBER_VELOCITIES: &str = "FiberVelocities";
pub const MUSCLE_FORCES: &str = "MuscleForces";
pub const TORQUES: &str = "Torques";
/// Excitations as recorded, before hybrid calibration.
pub const RECORDED_EXCITATIONS: &str = "Excitations";
/// Excitations after hybrid calibration.
pub const ADJUSTED_EXCITATIONS: &str = "AdjustedExcitations";

pub fn moment_arms_channel(dof: &str) -> String {
    format!("{MOMENT_ARMS_PREFIX}{dof}")
}

/// One aligned cross-section of every required input at a single step.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFrame {
    step: usize,
    time: f64,
    records: BTreeMap<String, TimeSeriesRecord>,
}

impl ModelFrame {
    pub fn new(step: usize, time: f64) -> Self {
        Self {
            step,
            time,
            records: BTreeMap::new(),
        }
    }

    pub fn with_record(mut self, channel: impl Into<String>, record: TimeSeriesRecord) -> Self {
        self.insert(channel, record);
        self
    }

    /// Inserts or replaces the record of `channel`.
    pub fn insert(&mut self, channel: impl Into<String>, record: TimeSeriesRecord) {
        self.records.insert(channel.into(), record);
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn record(&self, channel: &str) -> Option<&TimeSeriesRecord> {
        self.records.get(channel)
    }

    /// Like [`record`](Self::record) but missing channels are errors.
    pub fn require(&self, channel: &str) -> Result<&TimeSeriesRecord> {
        self.records
            .get(channel)
            .ok_or_else(|| anyhow!("frame {} has no '{channel}' record", self.step))
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Moment arm records keyed by DoF name, in name order.
    pub fn moment_arms(&self) -> impl Iterator<Item = (&str, &TimeSeriesRecord)> {
        self.records
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(MOMENT_ARMS_PREFIX).map(|dof| (dof, v)))
    }
}

/// Named output groups produced by one model evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOutput {
    groups: BTreeMap<String, TimeSeriesRecord>,
}

impl ModelOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: impl Into<String>, record: TimeSeriesRecord) {
        self.groups.insert(group.into(), record);
    }

    pub fn group(&self, name: &str) -> Option<&TimeSeriesRecord> {
        self.groups.get(name)
    }

    pub fn take(&mut self, name: &str) -> Option<TimeSeriesRecord> {
        self.groups.remove(name)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }
}

/// Per-step model evaluation.
pub trait NmsModel: Send {
    /// Evaluates `frame` and commits any state carried to the next step.
    fn evaluate(&mut self, frame: &ModelFrame) -> Result<ModelOutput>;

    /// Evaluates `frame` without touching internal state. Optimizers call
    /// this many times per step while searching.
    fn trial(&self, frame: &ModelFrame) -> Result<ModelOutput>;
}
