//! Execution-mode dispatch. Every supported combination of model variants is
//! registered once as a [`Recipe`]; anything else is rejected before the
//! pipeline is built.

use crate::error::{PipelineError, PipelineResult};
use crate::model::muscle::{MuscleModel, SubjectConfig};
use crate::model::{
    ACTIVATIONS, ADJUSTED_EXCITATIONS, FIBER_LENGTHS, FIBER_VELOCITIES, MUSCLE_FORCES, NmsModel,
    RECORDED_EXCITATIONS, TORQUES,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationModel {
    Exponential,
    Piecewise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TendonModel {
    Stiff,
    Elastic,
    #[serde(alias = "elastic_bisection")]
    ElasticBiSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveMode {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    OpenLoop,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionMode {
    pub activation: ActivationModel,
    pub tendon: TendonModel,
    pub curve: CurveMode,
    pub loop_kind: LoopKind,
}

impl ExecutionMode {
    pub fn new(
        activation: ActivationModel,
        tendon: TendonModel,
        curve: CurveMode,
        loop_kind: LoopKind,
    ) -> Self {
        Self {
            activation,
            tendon,
            curve,
            loop_kind,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?}/{:?}/{:?}",
            self.activation, self.tendon, self.curve, self.loop_kind
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorKind {
    Online,
    Offline,
    Hybrid,
}

impl EvaluatorKind {
    pub fn needs_optimizer(self) -> bool {
        self == EvaluatorKind::Hybrid
    }
}

pub type ModelFactory = fn(&ExecutionMode, &SubjectConfig) -> Box<dyn NmsModel>;

/// How to build the evaluator for one supported mode.
#[derive(Clone)]
pub struct Recipe {
    pub evaluator: EvaluatorKind,
    pub build_model: ModelFactory,
    /// Output groups published per step, one channel each.
    pub outputs: Vec<&'static str>,
}

impl fmt::Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipe")
            .field("evaluator", &self.evaluator)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

fn muscle_model(mode: &ExecutionMode, subject: &SubjectConfig) -> Box<dyn NmsModel> {
    Box::new(MuscleModel::new(
        mode.activation,
        mode.tendon,
        mode.curve,
        subject.clone(),
    ))
}

const MODEL_OUTPUTS: [&str; 5] = [
    ACTIVATIONS,
    FIBER_LENGTHS,
    FIBER_VELOCITIES,
    MUSCLE_FORCES,
    TORQUES,
];

#[derive(Debug, Default)]
pub struct StrategyRegistry {
    recipes: HashMap<ExecutionMode, Recipe>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The twelve supported modes. Plain `Elastic` tendons and hybrid
    /// offline runs are intentionally absent.
    pub fn standard() -> Self {
        let mut reg = Self::empty();
        let activations = [ActivationModel::Exponential, ActivationModel::Piecewise];
        let tendons = [TendonModel::Stiff, TendonModel::ElasticBiSection];

        for activation in activations {
            for tendon in tendons {
                for curve in [CurveMode::Online, CurveMode::Offline] {
                    let evaluator = match curve {
                        CurveMode::Online => EvaluatorKind::Online,
                        CurveMode::Offline => EvaluatorKind::Offline,
                    };
                    reg.register(
                        ExecutionMode::new(activation, tendon, curve, LoopKind::OpenLoop),
                        Recipe {
                            evaluator,
                            build_model: muscle_model,
                            outputs: MODEL_OUTPUTS.to_vec(),
                        },
                    );
                }

                let mut outputs = MODEL_OUTPUTS.to_vec();
                outputs.extend([RECORDED_EXCITATIONS, ADJUSTED_EXCITATIONS]);
                reg.register(
                    ExecutionMode::new(activation, tendon, CurveMode::Online, LoopKind::Hybrid),
                    Recipe {
                        evaluator: EvaluatorKind::Hybrid,
                        build_model: muscle_model,
                        outputs,
                    },
                );
            }
        }
        reg
    }

    /// Adds or replaces the recipe of `mode`.
    pub fn register(&mut self, mode: ExecutionMode, recipe: Recipe) {
        self.recipes.insert(mode, recipe);
    }

    pub fn lookup(&self, mode: &ExecutionMode) -> PipelineResult<&Recipe> {
        self.recipes.get(mode).ok_or_else(|| {
            PipelineError::Configuration(format!("execution mode {mode} is not supported"))
        })
    }

    pub fn supported(&self) -> impl Iterator<Item = &ExecutionMode> {
        self.recipes.keys()
    }
}
