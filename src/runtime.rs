use crate::config::SimulationConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::io::{ChannelBundle, WaitPolicy};
use crate::model::{EXCITATIONS, EXTERNAL_TORQUES, LENGTHS, moment_arms_channel};
use crate::optimizer::{AnnealingOptimizer, Optimizer};
use crate::pipeline::evaluator::{EvaluatorReport, EvaluatorSetup, ModelEvaluator};
use crate::pipeline::sink::{Sink, SinkReport};
use crate::pipeline::source::{Source, SourceReport};
use crate::series::{TimeSeriesReader, TimeSeriesRecord};
use crate::storage::{FileStorage, StorageWriter};
use crate::strategy::{ExecutionMode, StrategyRegistry};
use crate::utils::{CancelToken, CountingGate};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::{SigId, flag, low_level};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const JOIN_POLL: Duration = Duration::from_millis(5);

/// Which sink a storage writer is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkRole {
    /// Model output groups.
    Outputs,
    /// Input records echoed as read.
    InputEcho,
}

pub type StorageFactory = Box<dyn Fn(SinkRole) -> Box<dyn StorageWriter> + Send>;

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub mode: ExecutionMode,
    pub sources: Vec<SourceReport>,
    pub evaluator: EvaluatorReport,
    pub sinks: Vec<SinkReport>,
    pub elapsed: Duration,
}

/// Builds the pipeline for one configured run, starts every stage on its own
/// thread and joins them.
///
/// The execution mode is validated against the registry before any input is
/// opened or any thread is started. Once running, the first failing stage
/// cancels the shared root token; the error it reported is what `run`
/// returns.
pub struct Orchestrator {
    cfg: SimulationConfig,
    registry: StrategyRegistry,
    optimizer: Option<Box<dyn Optimizer>>,
    storage: StorageFactory,
    cancel: CancelToken,
}

enum Worker {
    Source(String, JoinHandle<PipelineResult<SourceReport>>),
    Evaluator(JoinHandle<PipelineResult<EvaluatorReport>>),
    Sink(String, JoinHandle<PipelineResult<SinkReport>>),
}

impl Orchestrator {
    pub fn new(cfg: SimulationConfig) -> Self {
        let dir = cfg.output_dir.clone();
        Self {
            cfg,
            registry: StrategyRegistry::standard(),
            optimizer: None,
            storage: Box::new(move |role| default_storage(&dir, role)),
            cancel: CancelToken::new_root(),
        }
    }

    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the annealing optimizer built from the `hybrid` section.
    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_storage(
        mut self,
        factory: impl Fn(SinkRole) -> Box<dyn StorageWriter> + Send + 'static,
    ) -> Self {
        self.storage = Box::new(factory);
        self
    }

    /// Links the run under `parent`: cancelling the parent stops the run,
    /// while a failing stage cancels only this run.
    pub fn with_parent_cancel(mut self, parent: &CancelToken) -> Self {
        self.cancel = parent.new_child();
        self
    }

    /// Root token of the run; cancelling it stops every stage.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run(mut self) -> PipelineResult<RunReport> {
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let mode = self.cfg.mode;

        let recipe = self.registry.lookup(&mode)?.clone();
        let optimizer = if recipe.evaluator.needs_optimizer() {
            Some(self.hybrid_optimizer()?)
        } else {
            None
        };

        tracing::info!("[Orchestrator] run {} starting, mode {}", run_id, mode);

        let inputs = self.input_files()?;
        let mut readers = Vec::with_capacity(inputs.len());
        for (channel, path) in &inputs {
            readers.push((channel.clone(), TimeSeriesReader::open(path)?));
        }
        let steps: BTreeSet<usize> = readers.iter().map(|(_, r)| r.total_steps()).collect();
        if steps.len() > 1 {
            tracing::warn!(
                "[Orchestrator] inputs declare row counts {:?}, run stops at the shortest",
                steps
            );
        }

        let pcfg = &self.cfg.pipeline;
        let policy = WaitPolicy::new(self.cancel.clone(), pcfg.stall_timeout());
        let channels: Vec<String> = inputs.iter().map(|(c, _)| c.clone()).collect();
        let outputs: Vec<String> = recipe.outputs.iter().map(|g| g.to_string()).collect();

        let mut input_bundle = ChannelBundle::<TimeSeriesRecord>::builder("inputs")
            .channels(channels.iter())
            .obligations(channels.len())
            .capacity(pcfg.channel_capacity)
            .wait_policy(policy.clone())
            .build();
        let mut output_bundle = ChannelBundle::<TimeSeriesRecord>::builder("outputs")
            .channels(outputs.iter())
            .obligations(1)
            .capacity(pcfg.channel_capacity)
            .wait_policy(policy.clone())
            .build();
        let mut echo_bundle = pcfg.log_inputs.then(|| {
            ChannelBundle::<TimeSeriesRecord>::builder("input-echo")
                .channels(channels.iter())
                .obligations(channels.len())
                .capacity(pcfg.channel_capacity)
                .wait_policy(policy)
                .build()
        });

        let model = (recipe.build_model)(&mode, &self.cfg.subject);
        let evaluator = ModelEvaluator::new(EvaluatorSetup {
            kind: recipe.evaluator,
            inputs: input_bundle.receiver(&channels)?,
            input_channels: channels.clone(),
            outputs: output_bundle.sender(&outputs)?,
            output_groups: outputs.clone(),
            sink_subscribers: 1,
            model,
            optimizer,
            alignment_tolerance: pcfg.alignment_tolerance,
            cancel: self.cancel.clone(),
        })?;

        let mut sources = Vec::with_capacity(readers.len());
        for (channel, reader) in readers {
            let mut source = Source::new(channel.clone(), reader, self.cancel.clone())
                .feed(input_bundle.sender([&channel])?, channel.clone())
                .pace_realtime(pcfg.pace_realtime);
            if let Some(echo) = &echo_bundle {
                source = source.feed(echo.sender([&channel])?, channel.clone());
            }
            sources.push(source);
        }

        let flush_gate = pcfg
            .max_parallel_flushes
            .map(|n| Arc::new(CountingGate::new(n.max(1))));
        let mut sinks = vec![Sink::new(
            "outputs",
            output_bundle.receiver(&outputs)?,
            (self.storage)(SinkRole::Outputs),
            self.cancel.clone(),
        )];
        if let Some(echo) = echo_bundle.as_mut() {
            sinks.push(Sink::new(
                "input-echo",
                echo.receiver(&channels)?,
                (self.storage)(SinkRole::InputEcho),
                self.cancel.clone(),
            ));
        }
        if let Some(gate) = &flush_gate {
            sinks = sinks
                .into_iter()
                .map(|s| s.with_flush_gate(gate.clone()))
                .collect();
        }

        // stages hold the only senders from here on, so a channel closes
        // when its producer finishes
        drop(input_bundle);
        drop(output_bundle);
        drop(echo_bundle);

        let term = Arc::new(AtomicBool::new(false));
        let sig_ids: Vec<SigId> = TERM_SIGNALS
            .iter()
            .filter_map(|sig| flag::register(*sig, term.clone()).ok())
            .collect();

        let (workers, spawn_err) = self.spawn_all(sources, evaluator, sinks);
        let joined = self.join_all(workers, &term);

        for id in sig_ids {
            low_level::unregister(id);
        }

        let (sources, evaluator, sinks, join_err) = joined;
        if let Some(e) = spawn_err.or(join_err) {
            tracing::error!("[Orchestrator] run {} failed: {}", run_id, e);
            return Err(e);
        }
        let evaluator = evaluator.ok_or(PipelineError::Cancelled)?;

        let report = RunReport {
            run_id,
            mode,
            sources,
            evaluator,
            sinks,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "[Orchestrator] run {} finished: {} steps in {:?}",
            report.run_id,
            report.evaluator.steps,
            report.elapsed
        );
        Ok(report)
    }

    fn hybrid_optimizer(&mut self) -> PipelineResult<Box<dyn Optimizer>> {
        if self.cfg.inputs.external_torques.is_none() {
            return Err(PipelineError::Configuration(format!(
                "mode {} needs inputs.external_torques",
                self.cfg.mode
            )));
        }
        if let Some(opt) = self.optimizer.take() {
            return Ok(opt);
        }
        let hybrid = self.cfg.hybrid.clone().ok_or_else(|| {
            PipelineError::Configuration(format!("mode {} needs a [hybrid] section", self.cfg.mode))
        })?;
        Ok(Box::new(AnnealingOptimizer::new(hybrid)))
    }

    /// Input channel names and their files.
    fn input_files(&self) -> PipelineResult<Vec<(String, PathBuf)>> {
        let inputs = &self.cfg.inputs;
        let mut files = vec![
            (EXCITATIONS.to_string(), inputs.excitations.clone()),
            (LENGTHS.to_string(), inputs.lengths.clone()),
        ];
        let mut dofs = BTreeSet::new();
        for ma in &inputs.moment_arms {
            if !dofs.insert(ma.dof.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "moment arms for '{}' listed twice",
                    ma.dof
                )));
            }
            files.push((moment_arms_channel(&ma.dof), ma.path.clone()));
        }
        if let Some(path) = &inputs.external_torques {
            files.push((EXTERNAL_TORQUES.to_string(), path.clone()));
        }
        Ok(files)
    }

    /// Consumers first, so producers never wait on a stage that is not up yet.
    fn spawn_all<R>(
        &self,
        sources: Vec<Source<R>>,
        evaluator: ModelEvaluator,
        sinks: Vec<Sink>,
    ) -> (Vec<Worker>, Option<PipelineError>)
    where
        R: std::io::BufRead + Send + 'static,
    {
        let mut workers = Vec::new();
        let fail = |e: PipelineError| {
            self.cancel.cancel_because(format!("spawn failed: {e}"));
            Some(e)
        };

        for sink in sinks {
            let name = format!("sink {}", sink.name());
            match sink.spawn() {
                Ok(h) => workers.push(Worker::Sink(name, h)),
                Err(e) => return (workers, fail(e)),
            }
        }
        match evaluator.spawn() {
            Ok(h) => workers.push(Worker::Evaluator(h)),
            Err(e) => return (workers, fail(e)),
        }
        for source in sources {
            let name = format!("source {}", source.name());
            match source.spawn() {
                Ok(h) => workers.push(Worker::Source(name, h)),
                Err(e) => return (workers, fail(e)),
            }
        }
        (workers, None)
    }

    /// Joins sources, then the evaluator, then sinks. Returns the first
    /// error that is not a cancellation echo.
    #[allow(clippy::type_complexity)]
    fn join_all(
        &self,
        workers: Vec<Worker>,
        term: &AtomicBool,
    ) -> (
        Vec<SourceReport>,
        Option<EvaluatorReport>,
        Vec<SinkReport>,
        Option<PipelineError>,
    ) {
        let (mut srcs, mut evals, mut snks) = (Vec::new(), Vec::new(), Vec::new());
        for w in workers {
            match w {
                Worker::Source(n, h) => srcs.push((n, h)),
                Worker::Evaluator(h) => evals.push(h),
                Worker::Sink(n, h) => snks.push((n, h)),
            }
        }

        let mut errors = Vec::new();
        let mut keep = |res: PipelineResult<()>| {
            if let Err(e) = res {
                errors.push(e);
            }
        };

        let mut sources = Vec::new();
        for (name, h) in srcs {
            keep(self.join(&name, h, term).map(|r| sources.push(r)));
        }
        let mut evaluator = None;
        for h in evals {
            keep(self.join("evaluator", h, term).map(|r| evaluator = Some(r)));
        }
        let mut sinks = Vec::new();
        for (name, h) in snks {
            keep(self.join(&name, h, term).map(|r| sinks.push(r)));
        }

        let root = match errors.iter().position(|e| !e.is_cancelled()) {
            Some(i) => Some(errors.swap_remove(i)),
            None => errors.pop(),
        };
        (sources, evaluator, sinks, root)
    }

    fn join<T>(
        &self,
        name: &str,
        handle: JoinHandle<PipelineResult<T>>,
        term: &AtomicBool,
    ) -> PipelineResult<T> {
        while !handle.is_finished() {
            if term.load(Ordering::Relaxed) && !self.cancel.is_cancelled() {
                tracing::warn!("[Orchestrator] termination signal received");
                self.cancel.cancel_because("termination signal");
            }
            thread::sleep(JOIN_POLL);
        }
        handle
            .join()
            .unwrap_or_else(|_| Err(PipelineError::ThreadPanic(name.to_string())))
    }
}

fn default_storage(dir: &std::path::Path, role: SinkRole) -> Box<dyn StorageWriter> {
    match role {
        SinkRole::Outputs => Box::new(FileStorage::new(dir)),
        SinkRole::InputEcho => Box::new(FileStorage::new(dir).with_prefix("input_")),
    }
}
