use crate::model::{EXCITATIONS, EXTERNAL_TORQUES, ModelFrame, NmsModel, TORQUES};
use crate::optimizer::{Calibration, Optimizer};
use anyhow::{Result, anyhow};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Simulated annealing schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnealingParams {
    /// Step-size adjustments per temperature.
    pub nt: usize,
    /// Sweeps over every variable between step-size adjustments.
    pub ns: usize,
    /// Temperature reduction factor.
    pub rt: f64,
    /// Initial temperature.
    pub t: f64,
    pub max_evaluations: usize,
    /// Convergence tolerance on the objective.
    pub epsilon: f64,
    /// Consecutive temperatures that must agree within `epsilon`.
    pub no_epsilon: usize,
}

impl Default for AnnealingParams {
    fn default() -> Self {
        Self {
            nt: 5,
            ns: 20,
            rt: 0.3,
            t: 20.0,
            max_evaluations: 20_000,
            epsilon: 1e-3,
            no_epsilon: 4,
        }
    }
}

/// Objective weights: torque tracking, excitation tracking, predicted effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridWeightings {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for HybridWeightings {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 2.0,
            gamma: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HybridConfig {
    #[serde(default)]
    pub weightings: HybridWeightings,
    #[serde(default)]
    pub annealing: AnnealingParams,
    /// Muscles whose recorded excitations are adjusted but kept close.
    #[serde(default)]
    pub tracked: Vec<String>,
    /// Muscles whose excitations are synthesized from scratch.
    #[serde(default)]
    pub predicted: Vec<String>,
    /// Fixed RNG seed for reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Corana-style simulated annealing over the excitations of the tracked and
/// predicted muscles, each bounded to `[0, 1]`.
pub struct AnnealingOptimizer {
    cfg: HybridConfig,
    rng: StdRng,
}

impl AnnealingOptimizer {
    pub fn new(cfg: HybridConfig) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { cfg, rng }
    }
}

struct Problem<'a> {
    frame: &'a ModelFrame,
    model: &'a dyn NmsModel,
    weights: &'a HybridWeightings,
    /// (column in the excitation record, recorded value, tracked?)
    vars: Vec<(usize, f64, bool)>,
}

impl Problem<'_> {
    fn candidate(&self, x: &[f64]) -> Result<ModelFrame> {
        let recorded = self.frame.require(EXCITATIONS)?;
        let mut values = recorded.values().to_vec();
        for (&(col, _, _), &v) in self.vars.iter().zip(x) {
            values[col] = v;
        }
        let mut frame = self.frame.clone();
        frame.insert(EXCITATIONS, recorded.with_values(recorded.time(), values)?);
        Ok(frame)
    }

    fn objective(&self, x: &[f64]) -> Result<f64> {
        let out = self.model.trial(&self.candidate(x)?)?;
        let torques = out
            .group(TORQUES)
            .ok_or_else(|| anyhow!("model produced no torques"))?;
        let external = self.frame.require(EXTERNAL_TORQUES)?;

        let torque_error: f64 = torques
            .iter()
            .filter_map(|(dof, t)| external.value(dof).map(|ext| (t - ext).powi(2)))
            .sum();

        let mut tracked = 0.0;
        let mut predicted = 0.0;
        for (&(_, recorded, is_tracked), &v) in self.vars.iter().zip(x) {
            if is_tracked {
                tracked += (v - recorded).powi(2);
            } else {
                predicted += v * v;
            }
        }

        Ok(self.weights.alpha * torque_error
            + self.weights.beta * tracked
            + self.weights.gamma * predicted)
    }
}

impl Optimizer for AnnealingOptimizer {
    fn recalibrate(&mut self, frame: &ModelFrame, model: &dyn NmsModel) -> Result<Calibration> {
        let recorded = frame.require(EXCITATIONS)?;

        let mut vars = Vec::new();
        for (names, tracked) in [(&self.cfg.tracked, true), (&self.cfg.predicted, false)] {
            for name in names {
                let col = recorded
                    .index_of(name)
                    .ok_or_else(|| anyhow!("muscle '{name}' has no recorded excitation"))?;
                vars.push((col, recorded.values()[col], tracked));
            }
        }

        let problem = Problem {
            frame,
            model,
            weights: &self.cfg.weightings,
            vars,
        };

        if problem.vars.is_empty() {
            return Ok(Calibration {
                frame: frame.clone(),
                evaluations: 0,
                objective: problem.objective(&[])?,
            });
        }

        let p = &self.cfg.annealing;
        let rng = &mut self.rng;
        let n = problem.vars.len();

        let mut x: Vec<f64> = problem.vars.iter().map(|v| v.1.clamp(0.0, 1.0)).collect();
        let mut f = problem.objective(&x)?;
        let mut evaluations = 1;
        let mut best = (x.clone(), f);
        let mut step = vec![0.5; n];
        let mut temperature = p.t;
        let mut history: VecDeque<f64> = VecDeque::with_capacity(p.no_epsilon + 1);

        'search: loop {
            for _ in 0..p.nt {
                let mut accepted = vec![0usize; n];
                for _ in 0..p.ns {
                    for h in 0..n {
                        if evaluations >= p.max_evaluations {
                            break 'search;
                        }
                        let mut xp = x.clone();
                        xp[h] = x[h] + rng.gen_range(-1.0..=1.0) * step[h];
                        if !(0.0..=1.0).contains(&xp[h]) {
                            xp[h] = rng.gen_range(0.0..=1.0);
                        }

                        let fp = problem.objective(&xp)?;
                        evaluations += 1;

                        let accept =
                            fp <= f || rng.gen_range(0.0..1.0) < ((f - fp) / temperature).exp();
                        if accept {
                            x = xp;
                            f = fp;
                            accepted[h] += 1;
                            if f < best.1 {
                                best = (x.clone(), f);
                            }
                        }
                    }
                }

                for (v, &a) in step.iter_mut().zip(&accepted) {
                    let ratio = a as f64 / p.ns.max(1) as f64;
                    if ratio > 0.6 {
                        *v *= 1.0 + 2.0 * (ratio - 0.6) / 0.4;
                    } else if ratio < 0.4 {
                        *v /= 1.0 + 2.0 * (0.4 - ratio) / 0.4;
                    }
                    *v = v.clamp(1e-6, 1.0);
                }
            }

            history.push_front(f);
            history.truncate(p.no_epsilon.max(1));
            let settled = history.len() >= p.no_epsilon.max(1)
                && history.iter().all(|h| (h - f).abs() <= p.epsilon)
                && (f - best.1).abs() <= p.epsilon;
            if settled {
                break;
            }

            temperature *= p.rt;
            x = best.0.clone();
            f = best.1;
        }

        tracing::trace!(
            "[Annealing] step {}: objective {:.6} after {} trials",
            frame.step(),
            best.1,
            evaluations
        );

        Ok(Calibration {
            frame: problem.candidate(&best.0)?,
            evaluations,
            objective: best.1,
        })
    }
}
