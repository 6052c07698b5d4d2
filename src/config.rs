use crate::model::muscle::SubjectConfig;
use crate::optimizer::HybridConfig;
use crate::strategy::ExecutionMode;
use crate::utils::logger::LoggerConfig;
use anyhow::Context;
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for overrides, e.g. `NMSRT__PIPELINE__STALL_TIMEOUT_MS=500`.
pub const ENV_PREFIX: &str = "NMSRT";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    pub mode: ExecutionMode,
    pub inputs: InputFiles,
    #[serde(default)]
    pub subject: SubjectConfig,
    /// Required for hybrid modes.
    #[serde(default)]
    pub hybrid: Option<HybridConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub logger: Option<LoggerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MomentArmFile {
    pub dof: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputFiles {
    pub excitations: PathBuf,
    pub lengths: PathBuf,
    #[serde(default)]
    pub moment_arms: Vec<MomentArmFile>,
    /// Measured joint torques; required for hybrid modes.
    #[serde(default)]
    pub external_torques: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-channel capacity; `None` or 0 means unbounded.
    pub channel_capacity: Option<usize>,
    pub stall_timeout_ms: Option<u64>,
    /// Max timestamp spread inside one frame; `None` disables the check.
    pub alignment_tolerance: Option<f64>,
    /// Also store every input record as read.
    pub log_inputs: bool,
    pub pace_realtime: bool,
    /// Sinks allowed to write to storage at the same time.
    pub max_parallel_flushes: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: None,
            stall_timeout_ms: None,
            alignment_tolerance: Some(1e-6),
            log_inputs: false,
            pace_realtime: false,
            max_parallel_flushes: None,
        }
    }
}

impl PipelineConfig {
    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }
}

impl SimulationConfig {
    /// Loads `path` (TOML, JSON or YAML by extension) and applies
    /// `NMSRT__`-prefixed environment overrides on top.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::load_with_env(path, Some(ENV_PREFIX))
    }

    pub fn load_with_env(path: impl AsRef<Path>, env_prefix: Option<&str>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("config file {} does not exist", path.display());
        }

        let mut builder = Config::builder().add_source(File::from(path));
        if let Some(prefix) = env_prefix {
            builder = builder.add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let cfg = builder
            .build()
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let mut des: Self = cfg
            .try_deserialize()
            .with_context(|| format!("failed to deserialize config from {}", path.display()))?;

        des.resolve_paths(path.parent().unwrap_or(Path::new(".")));
        Ok(des)
    }

    /// Relative input and output paths are taken relative to the config file.
    fn resolve_paths(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.inputs.excitations);
        fix(&mut self.inputs.lengths);
        for ma in &mut self.inputs.moment_arms {
            fix(&mut ma.path);
        }
        if let Some(p) = self.inputs.external_torques.as_mut() {
            fix(p);
        }
        fix(&mut self.output_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{LoopKind, TendonModel};
    use std::io::Write;

    const TOML: &str = r#"
output_dir = "out"

[mode]
activation = "exponential"
tendon = "elastic_bisection"
curve = "online"
loop_kind = "hybrid"

[inputs]
excitations = "emg.sto"
lengths = "/abs/lmt.sto"
external_torques = "torques.sto"
moment_arms = [{ dof = "knee", path = "ma_knee.sto" }]

[pipeline]
channel_capacity = 64
stall_timeout_ms = 250

[hybrid]
tracked = ["soleus"]
predicted = ["tibant"]
seed = 3

[hybrid.weightings]
alpha = 1.0
beta = 4.0
gamma = 0.5

[[subject.muscles]]
name = "soleus"
params = { max_isometric_force = 3500.0 }
"#;

    fn write(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("sim.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_and_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SimulationConfig::load_with_env(write(dir.path(), TOML), None).unwrap();

        assert_eq!(cfg.mode.tendon, TendonModel::ElasticBiSection);
        assert_eq!(cfg.mode.loop_kind, LoopKind::Hybrid);
        assert_eq!(cfg.inputs.excitations, dir.path().join("emg.sto"));
        assert_eq!(cfg.inputs.lengths, PathBuf::from("/abs/lmt.sto"));
        assert_eq!(cfg.inputs.moment_arms[0].dof, "knee");
        assert_eq!(cfg.output_dir, dir.path().join("out"));

        assert_eq!(cfg.pipeline.channel_capacity, Some(64));
        assert_eq!(cfg.pipeline.stall_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(cfg.pipeline.alignment_tolerance, Some(1e-6));

        let hybrid = cfg.hybrid.unwrap();
        assert_eq!(hybrid.weightings.beta, 4.0);
        assert_eq!(hybrid.annealing.max_evaluations, 20_000);
        assert_eq!(hybrid.seed, Some(3));
        assert_eq!(cfg.subject.parameters("soleus").max_isometric_force, 3500.0);
        assert_eq!(cfg.subject.parameters("tibant").max_isometric_force, 1000.0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = SimulationConfig::load("/no/such/sim.toml").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn unknown_mode_value_fails_to_deserialize() {
        let dir = tempfile::tempdir().unwrap();
        let bad = TOML.replace("\"exponential\"", "\"cubic\"");
        assert!(SimulationConfig::load_with_env(write(dir.path(), &bad), None).is_err());
    }
}
