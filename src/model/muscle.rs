use crate::model::{
    ACTIVATIONS, EXCITATIONS, FIBER_LENGTHS, FIBER_VELOCITIES, LENGTHS, MUSCLE_FORCES, ModelFrame,
    ModelOutput, NmsModel, TORQUES,
};
use crate::series::{SeriesNames, TimeSeriesRecord};
use crate::strategy::{ActivationModel, CurveMode, TendonModel};
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Excitation level where the piecewise activation turns linear.
const PIECEWISE_BREAK: f64 = 0.3;
const BISECTION_STEPS: usize = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuscleParameters {
    /// N
    pub max_isometric_force: f64,
    /// m
    pub optimal_fiber_length: f64,
    /// m
    pub tendon_slack_length: f64,
    /// rad, at optimal fiber length
    pub pennation_angle: f64,
    /// Activation non-linearity, in (-3, 0]; 0 is linear.
    pub shape_factor: f64,
    /// optimal fiber lengths per second
    pub max_contraction_velocity: f64,
    /// Tendon strain at maximum isometric force.
    pub tendon_strain_at_max: f64,
    /// s, used when activation is integrated across steps.
    pub activation_time_constant: f64,
}

impl Default for MuscleParameters {
    fn default() -> Self {
        Self {
            max_isometric_force: 1000.0,
            optimal_fiber_length: 0.1,
            tendon_slack_length: 0.25,
            pennation_angle: 0.0,
            shape_factor: -1.0,
            max_contraction_velocity: 10.0,
            tendon_strain_at_max: 0.033,
            activation_time_constant: 0.04,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedMuscle {
    pub name: String,
    #[serde(default)]
    pub params: MuscleParameters,
}

/// Per-muscle parameters of the simulated subject. Muscles without an entry
/// use `defaults`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectConfig {
    #[serde(default)]
    pub defaults: MuscleParameters,
    #[serde(default)]
    pub muscles: Vec<NamedMuscle>,
}

impl SubjectConfig {
    pub fn parameters(&self, muscle: &str) -> &MuscleParameters {
        self.muscles
            .iter()
            .find(|m| m.name == muscle)
            .map(|m| &m.params)
            .unwrap_or(&self.defaults)
    }
}

#[derive(Debug, Clone)]
struct MuscleState {
    time: f64,
    activations: Vec<f64>,
    fiber_lengths: Vec<f64>,
}

/// Reference Hill-type model. Activation and tendon variants follow the
/// execution mode; `CurveMode::Offline` integrates activation across steps,
/// `CurveMode::Online` solves every step in closed form.
pub struct MuscleModel {
    activation: ActivationModel,
    tendon: TendonModel,
    curve: CurveMode,
    subject: SubjectConfig,
    previous: Option<MuscleState>,
}

impl MuscleModel {
    pub fn new(
        activation: ActivationModel,
        tendon: TendonModel,
        curve: CurveMode,
        subject: SubjectConfig,
    ) -> Self {
        Self {
            activation,
            tendon,
            curve,
            subject,
            previous: None,
        }
    }

    fn compute(&self, frame: &ModelFrame) -> Result<(ModelOutput, MuscleState)> {
        let excitations = frame.require(EXCITATIONS)?;
        let lengths = frame.require(LENGTHS)?;
        let muscles = excitations.shared_names().clone();
        let time = frame.time();

        let previous = self
            .previous
            .as_ref()
            .filter(|p| p.activations.len() == muscles.len() && time > p.time);
        let dt = previous.map(|p| time - p.time);

        let n = muscles.len();
        let mut activations = Vec::with_capacity(n);
        let mut fiber_lengths = Vec::with_capacity(n);
        let mut velocities = Vec::with_capacity(n);
        let mut forces = Vec::with_capacity(n);

        for (i, (name, &u)) in muscles.iter().zip(excitations.values()).enumerate() {
            let p = self.subject.parameters(name);
            let u = u.clamp(0.0, 1.0);

            let mut a = self.activate(u, p);
            if self.curve == CurveMode::Offline
                && let (Some(prev), Some(dt)) = (previous, dt)
            {
                let a_prev = prev.activations[i];
                let blend = 1.0 - (-dt / p.activation_time_constant.max(1e-6)).exp();
                a = a_prev + (a - a_prev) * blend;
            }

            let lmt = lengths
                .value(name)
                .ok_or_else(|| anyhow!("no musculotendon length for '{name}'"))?;
            let lm = match self.tendon {
                TendonModel::Stiff => stiff_fiber_length(lmt, p),
                TendonModel::Elastic | TendonModel::ElasticBiSection => {
                    equilibrium_fiber_length(a, lmt, p)
                }
            };
            let v = match (previous, dt) {
                (Some(prev), Some(dt)) => (lm - prev.fiber_lengths[i]) / dt,
                _ => 0.0,
            };

            forces.push(fiber_force(a, lm, v, p) * pennation(lm, p).cos());
            activations.push(a);
            fiber_lengths.push(lm);
            velocities.push(v);
        }

        let mut dofs = Vec::new();
        let mut torques = Vec::new();
        for (dof, arms) in frame.moment_arms() {
            let torque = muscles
                .iter()
                .zip(&forces)
                .map(|(m, f)| f * arms.value(m).unwrap_or(0.0))
                .sum::<f64>();
            dofs.push(dof.to_string());
            torques.push(torque);
        }

        let mut out = ModelOutput::new();
        out.insert(ACTIVATIONS, record(time, &muscles, activations.clone()));
        out.insert(FIBER_LENGTHS, record(time, &muscles, fiber_lengths.clone()));
        out.insert(FIBER_VELOCITIES, record(time, &muscles, velocities));
        out.insert(MUSCLE_FORCES, record(time, &muscles, forces));
        out.insert(
            TORQUES,
            TimeSeriesRecord::from_parts(time, SeriesNames::from(dofs), torques),
        );

        let state = MuscleState {
            time,
            activations,
            fiber_lengths,
        };
        Ok((out, state))
    }

    fn activate(&self, u: f64, p: &MuscleParameters) -> f64 {
        let shape = p.shape_factor;
        match self.activation {
            ActivationModel::Exponential => exponential_activation(u, shape),
            ActivationModel::Piecewise => {
                if u < PIECEWISE_BREAK {
                    exponential_activation(u, shape)
                } else {
                    let knee = exponential_activation(PIECEWISE_BREAK, shape);
                    knee + (1.0 - knee) * (u - PIECEWISE_BREAK) / (1.0 - PIECEWISE_BREAK)
                }
            }
        }
    }
}

impl NmsModel for MuscleModel {
    fn evaluate(&mut self, frame: &ModelFrame) -> Result<ModelOutput> {
        let (out, state) = self.compute(frame)?;
        self.previous = Some(state);
        Ok(out)
    }

    fn trial(&self, frame: &ModelFrame) -> Result<ModelOutput> {
        self.compute(frame).map(|(out, _)| out)
    }
}

fn record(time: f64, names: &SeriesNames, values: Vec<f64>) -> TimeSeriesRecord {
    TimeSeriesRecord::from_parts(time, names.clone(), values)
}

fn exponential_activation(u: f64, shape: f64) -> f64 {
    if shape.abs() < 1e-6 {
        return u;
    }
    ((shape * u).exp() - 1.0) / (shape.exp() - 1.0)
}

/// Pennation angle at fiber length `lm`, keeping the muscle thickness constant.
fn pennation(lm: f64, p: &MuscleParameters) -> f64 {
    let height = p.optimal_fiber_length * p.pennation_angle.sin();
    (height / lm.max(1e-9)).clamp(0.0, 1.0).asin()
}

fn stiff_fiber_length(lmt: f64, p: &MuscleParameters) -> f64 {
    let along = (lmt - p.tendon_slack_length).max(1e-3 * p.optimal_fiber_length);
    let height = p.optimal_fiber_length * p.pennation_angle.sin();
    (along * along + height * height).sqrt()
}

fn active_force_length(norm: f64) -> f64 {
    (-((norm - 1.0) / 0.45).powi(2)).exp()
}

fn passive_force_length(norm: f64) -> f64 {
    if norm <= 1.0 {
        0.0
    } else {
        ((4.0 * (norm - 1.0) / 0.6).exp() - 1.0) / (4.0f64.exp() - 1.0)
    }
}

fn force_velocity(v: f64, p: &MuscleParameters) -> f64 {
    let vmax = p.max_contraction_velocity * p.optimal_fiber_length;
    let vn = (v / vmax.max(1e-9)).clamp(-1.0, 1.0);
    if vn <= 0.0 {
        (1.0 + vn) / (1.0 - vn / 0.25)
    } else {
        1.0 + 0.8 * vn / (vn + 0.05)
    }
}

fn fiber_force(a: f64, lm: f64, v: f64, p: &MuscleParameters) -> f64 {
    let norm = lm / p.optimal_fiber_length;
    p.max_isometric_force
        * (a * active_force_length(norm) * force_velocity(v, p) + passive_force_length(norm))
}

fn tendon_force(lt: f64, p: &MuscleParameters) -> f64 {
    let strain = (lt - p.tendon_slack_length) / p.tendon_slack_length;
    if strain <= 0.0 {
        0.0
    } else {
        p.max_isometric_force * strain / p.tendon_strain_at_max
    }
}

/// Fiber length where tendon force balances the fiber force along the
/// tendon, found by bisection. Falls back to the stiff solution when the
/// bracket holds no root (slack tendon).
fn equilibrium_fiber_length(a: f64, lmt: f64, p: &MuscleParameters) -> f64 {
    let imbalance = |lm: f64| {
        let lt = lmt - lm * pennation(lm, p).cos();
        tendon_force(lt, p) - fiber_force(a, lm, 0.0, p) * pennation(lm, p).cos()
    };

    let mut lo = 0.2 * p.optimal_fiber_length;
    let mut hi = 2.0 * p.optimal_fiber_length;
    let mut g_lo = imbalance(lo);
    if g_lo.signum() == imbalance(hi).signum() {
        return stiff_fiber_length(lmt, p);
    }

    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        let g_mid = imbalance(mid);
        if g_mid == 0.0 {
            return mid;
        }
        if g_mid.signum() == g_lo.signum() {
            lo = mid;
            g_lo = g_mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}
