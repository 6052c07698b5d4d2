use crate::error::{PipelineError, PipelineResult};
use crate::io::{BundleReceiver, BundleSender, Popped};
use crate::model::{
    ADJUSTED_EXCITATIONS, EXCITATIONS, ModelFrame, ModelOutput, NmsModel, RECORDED_EXCITATIONS,
};
use crate::optimizer::Optimizer;
use crate::pipeline::{StepDriver, StepOutcome};
use crate::series::TimeSeriesRecord;
use crate::strategy::EvaluatorKind;
use crate::utils::CancelToken;
use anyhow::anyhow;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EvaluatorState {
    Running,
    Draining,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluatorReport {
    pub steps: usize,
    pub calibrations: usize,
}

/// Everything an evaluator is wired with.
pub struct EvaluatorSetup {
    pub kind: EvaluatorKind,
    pub inputs: BundleReceiver<TimeSeriesRecord>,
    /// Channels gathered into every frame, in gather order.
    pub input_channels: Vec<String>,
    pub outputs: BundleSender<TimeSeriesRecord>,
    /// Output groups published per step; each is also the channel name.
    pub output_groups: Vec<String>,
    /// Completion signals owed to the output bundle.
    pub sink_subscribers: usize,
    pub model: Box<dyn NmsModel>,
    pub optimizer: Option<Box<dyn Optimizer>>,
    /// Max timestamp spread inside one frame; `None` disables the check.
    pub alignment_tolerance: Option<f64>,
    pub cancel: CancelToken,
}

/// Gathers one record per input channel into a frame, optionally
/// recalibrates it, evaluates the model and publishes every output group.
///
/// Online and offline evaluation differ only in the model they run; hybrid
/// evaluation calls the optimizer once per frame before the model.
pub struct ModelEvaluator {
    kind: EvaluatorKind,
    inputs: BundleReceiver<TimeSeriesRecord>,
    input_channels: Vec<String>,
    outputs: BundleSender<TimeSeriesRecord>,
    output_groups: Vec<String>,
    sink_subscribers: usize,
    model: Box<dyn NmsModel>,
    optimizer: Option<Box<dyn Optimizer>>,
    alignment_tolerance: Option<f64>,
    cancel: CancelToken,
    state: EvaluatorState,
    steps: usize,
    calibrations: usize,
}

impl ModelEvaluator {
    pub fn new(setup: EvaluatorSetup) -> PipelineResult<Self> {
        if setup.kind.needs_optimizer() && setup.optimizer.is_none() {
            return Err(PipelineError::Configuration(
                "hybrid evaluation needs an optimizer".into(),
            ));
        }
        if setup.input_channels.is_empty() {
            return Err(PipelineError::Configuration(
                "evaluator has no input channels".into(),
            ));
        }

        Ok(Self {
            kind: setup.kind,
            inputs: setup.inputs,
            input_channels: setup.input_channels,
            outputs: setup.outputs,
            output_groups: setup.output_groups,
            sink_subscribers: setup.sink_subscribers,
            model: setup.model,
            optimizer: setup.optimizer,
            alignment_tolerance: setup.alignment_tolerance,
            cancel: setup.cancel,
            state: EvaluatorState::Running,
            steps: 0,
            calibrations: 0,
        })
    }

    pub fn state(&self) -> EvaluatorState {
        self.state
    }

    pub fn report(&self) -> EvaluatorReport {
        EvaluatorReport {
            steps: self.steps,
            calibrations: self.calibrations,
        }
    }

    /// Steps until done. Any failure other than cancellation cancels the
    /// whole pipeline before it is returned.
    pub fn execute(mut self) -> PipelineResult<EvaluatorReport> {
        // must drop before `self` releases the output senders
        let guard = self.cancel.guard("evaluator");
        let res = match StepDriver::run(&mut self) {
            Ok(()) => {
                tracing::info!(
                    "[Evaluator] {:?}: {} steps, {} calibrations",
                    self.kind,
                    self.steps,
                    self.calibrations
                );
                Ok(self.report())
            }
            Err(e) => {
                if !e.is_cancelled() {
                    tracing::error!("[Evaluator] failed at step {}: {}", self.steps, e);
                    self.cancel
                        .cancel_because(format!("evaluator failed at step {}: {e}", self.steps));
                }
                Err(e)
            }
        };
        guard.disarm();
        res
    }

    pub fn spawn(self) -> PipelineResult<JoinHandle<PipelineResult<EvaluatorReport>>> {
        let handle = thread::Builder::new()
            .name("nms-evaluator".into())
            .spawn(move || self.execute())?;
        Ok(handle)
    }

    /// One record from every input channel, or `None` once any channel ends.
    fn gather(&self) -> PipelineResult<Option<ModelFrame>> {
        let mut frame: Option<ModelFrame> = None;

        for (i, channel) in self.input_channels.iter().enumerate() {
            let record = match self.inputs.pop(channel)? {
                Popped::Record(r) => r,
                Popped::EndOfStream => {
                    if i > 0 {
                        tracing::warn!(
                            "[Evaluator] '{}' ended mid-frame at step {}, partial frame dropped",
                            channel,
                            self.steps
                        );
                    }
                    return Ok(None);
                }
            };

            let frame = frame.get_or_insert_with(|| ModelFrame::new(self.steps, record.time()));
            if let Some(tol) = self.alignment_tolerance
                && (record.time() - frame.time()).abs() > tol
            {
                return Err(PipelineError::Misaligned {
                    step: self.steps,
                    channel: channel.clone(),
                    expected: frame.time(),
                    found: record.time(),
                });
            }
            frame.insert(channel.as_str(), record);
        }
        Ok(frame)
    }

    fn evaluate(&mut self, frame: ModelFrame) -> PipelineResult<ModelOutput> {
        let Some(optimizer) = self.optimizer.as_mut() else {
            return self.model.evaluate(&frame).map_err(PipelineError::Model);
        };

        let recorded = frame.record(EXCITATIONS).cloned();
        let calibration = optimizer
            .recalibrate(&frame, self.model.as_ref())
            .map_err(PipelineError::Optimizer)?;
        self.calibrations += 1;

        crate::debug_throttled!(
            Duration::from_secs(2),
            "[Evaluator] step {} calibrated: objective {:.6}, {} trials",
            frame.step(),
            calibration.objective,
            calibration.evaluations
        );

        let adjusted = calibration.frame;
        let mut out = self.model.evaluate(&adjusted).map_err(PipelineError::Model)?;
        if let Some(recorded) = recorded {
            out.insert(RECORDED_EXCITATIONS, recorded);
        }
        if let Some(rec) = adjusted.record(EXCITATIONS) {
            out.insert(ADJUSTED_EXCITATIONS, rec.clone());
        }
        Ok(out)
    }

    fn publish(&self, mut out: ModelOutput) -> PipelineResult<()> {
        for group in &self.output_groups {
            let record = out.take(group).ok_or_else(|| {
                PipelineError::Model(anyhow!(
                    "model produced no '{group}' group at step {}",
                    self.steps
                ))
            })?;
            self.outputs.push(group, record)?;
        }
        Ok(())
    }

    /// Consumes what is left on the inputs so bounded producers can finish,
    /// then signals every sink subscriber.
    fn drain(&mut self) -> PipelineResult<()> {
        let mut discarded = 0usize;
        for channel in &self.input_channels {
            while let Popped::Record(_) = self.inputs.pop(channel)? {
                discarded += 1;
            }
        }
        if discarded > 0 {
            tracing::warn!(
                "[Evaluator] inputs have unequal lengths, {} trailing records ignored",
                discarded
            );
        }

        for _ in 0..self.sink_subscribers {
            self.outputs.signal_producer_done();
        }
        self.state = EvaluatorState::Done;
        Ok(())
    }
}

impl StepDriver for ModelEvaluator {
    fn step(&mut self) -> PipelineResult<StepOutcome> {
        match self.state {
            EvaluatorState::Done => return Ok(StepOutcome::Drained),
            EvaluatorState::Draining => {
                self.drain()?;
                return Ok(StepOutcome::Drained);
            }
            EvaluatorState::Running => {}
        }

        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let Some(frame) = self.gather()? else {
            self.state = EvaluatorState::Draining;
            self.drain()?;
            return Ok(StepOutcome::Drained);
        };

        crate::debug_throttled!(
            Duration::from_secs(5),
            "[Evaluator] step {} t={}",
            frame.step(),
            frame.time()
        );

        let out = self.evaluate(frame)?;
        self.publish(out)?;
        self.steps += 1;
        Ok(StepOutcome::Stepped)
    }

    fn is_done(&self) -> bool {
        self.state == EvaluatorState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ChannelBundle, WaitPolicy};
    use crate::model::{LENGTHS, TORQUES};
    use crate::optimizer::Calibration;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Torque = sum of excitations.
    struct SumModel {
        evaluated: Arc<Mutex<Vec<f64>>>,
    }

    impl NmsModel for SumModel {
        fn evaluate(&mut self, frame: &ModelFrame) -> anyhow::Result<ModelOutput> {
            self.evaluated.lock().push(frame.time());
            self.trial(frame)
        }

        fn trial(&self, frame: &ModelFrame) -> anyhow::Result<ModelOutput> {
            let sum: f64 = frame.require(EXCITATIONS)?.values().iter().sum();
            let mut out = ModelOutput::new();
            out.insert(TORQUES, TimeSeriesRecord::from_pairs(frame.time(), [("knee", sum)]));
            Ok(out)
        }
    }

    /// Doubles every excitation.
    struct Doubler;

    impl Optimizer for Doubler {
        fn recalibrate(
            &mut self,
            frame: &ModelFrame,
            _model: &dyn NmsModel,
        ) -> anyhow::Result<Calibration> {
            let rec = frame.require(EXCITATIONS)?;
            let doubled = rec.values().iter().map(|v| v * 2.0).collect();
            let mut frame = frame.clone();
            frame.insert(EXCITATIONS, rec.with_values(rec.time(), doubled)?);
            Ok(Calibration {
                frame,
                evaluations: 1,
                objective: 0.0,
            })
        }
    }

    struct Rig {
        input: ChannelBundle<TimeSeriesRecord>,
        output: ChannelBundle<TimeSeriesRecord>,
        cancel: CancelToken,
        evaluated: Arc<Mutex<Vec<f64>>>,
    }

    fn rig(outputs: &[&str]) -> Rig {
        let cancel = CancelToken::new_root();
        let policy = WaitPolicy::new(cancel.clone(), Some(Duration::from_secs(2)));
        Rig {
            input: ChannelBundle::builder("inputs")
                .channels([EXCITATIONS, LENGTHS])
                .obligations(2)
                .wait_policy(policy.clone())
                .build(),
            output: ChannelBundle::builder("outputs")
                .channels(outputs.iter().copied())
                .obligations(1)
                .wait_policy(policy)
                .build(),
            cancel,
            evaluated: Arc::default(),
        }
    }

    fn evaluator(
        r: &mut Rig,
        kind: EvaluatorKind,
        groups: &[&str],
    ) -> PipelineResult<ModelEvaluator> {
        let model = Box::new(SumModel {
            evaluated: r.evaluated.clone(),
        });
        evaluator_with(r, kind, groups, model)
    }

    fn evaluator_with(
        r: &mut Rig,
        kind: EvaluatorKind,
        groups: &[&str],
        model: Box<dyn NmsModel>,
    ) -> PipelineResult<ModelEvaluator> {
        ModelEvaluator::new(EvaluatorSetup {
            kind,
            inputs: r.input.receiver([EXCITATIONS, LENGTHS])?,
            input_channels: vec![EXCITATIONS.into(), LENGTHS.into()],
            outputs: r.output.sender(groups.iter().copied())?,
            output_groups: groups.iter().map(|g| g.to_string()).collect(),
            sink_subscribers: 1,
            model,
            optimizer: (kind == EvaluatorKind::Hybrid)
                .then(|| Box::new(Doubler) as Box<dyn Optimizer>),
            alignment_tolerance: Some(1e-6),
            cancel: r.cancel.clone(),
        })
    }

    fn feed(r: &Rig, channel: &str, times: &[f64]) {
        let tx = r.input.sender([channel]).unwrap();
        for &t in times {
            tx.push(channel, TimeSeriesRecord::from_pairs(t, [("m1", 0.25), ("m2", 0.5)]))
                .unwrap();
        }
        tx.signal_producer_done();
    }

    fn drain(r: &mut Rig, channel: &str) -> Vec<TimeSeriesRecord> {
        let rx = r.output.receiver([channel]).unwrap();
        std::iter::from_fn(|| rx.pop(channel).unwrap().into_record()).collect()
    }

    #[test]
    fn online_steps_once_per_aligned_frame() {
        let mut r = rig(&[TORQUES]);
        let mut ev = evaluator(&mut r, EvaluatorKind::Online, &[TORQUES]).unwrap();
        feed(&r, EXCITATIONS, &[0.0, 0.01, 0.02]);
        feed(&r, LENGTHS, &[0.0, 0.01, 0.02]);

        assert_eq!(ev.step().unwrap(), StepOutcome::Stepped);
        assert_eq!(ev.state(), EvaluatorState::Running);
        ev.run().unwrap();
        assert!(ev.is_done());
        assert_eq!(ev.report(), EvaluatorReport { steps: 3, calibrations: 0 });

        let torques = drain(&mut r, TORQUES);
        assert_eq!(torques.len(), 3);
        assert_eq!(torques[2].time(), 0.02);
        assert_eq!(torques[0].value("knee"), Some(0.75));
    }

    #[test]
    fn hybrid_recalibrates_every_frame_and_publishes_both_excitations() {
        let groups = [TORQUES, RECORDED_EXCITATIONS, ADJUSTED_EXCITATIONS];
        let mut r = rig(&groups);
        let ev = evaluator(&mut r, EvaluatorKind::Hybrid, &groups).unwrap();
        feed(&r, EXCITATIONS, &[0.0, 0.01]);
        feed(&r, LENGTHS, &[0.0, 0.01]);

        assert_eq!(ev.execute().unwrap().calibrations, 2);
        assert_eq!(drain(&mut r, TORQUES)[0].value("knee"), Some(1.5));
        assert_eq!(drain(&mut r, RECORDED_EXCITATIONS)[1].value("m2"), Some(0.5));
        assert_eq!(drain(&mut r, ADJUSTED_EXCITATIONS)[1].value("m2"), Some(1.0));
    }

    #[test]
    fn hybrid_without_optimizer_is_rejected() {
        let mut r = rig(&[TORQUES]);
        let res = ModelEvaluator::new(EvaluatorSetup {
            kind: EvaluatorKind::Hybrid,
            inputs: r.input.receiver([EXCITATIONS]).unwrap(),
            input_channels: vec![EXCITATIONS.into()],
            outputs: r.output.sender([TORQUES]).unwrap(),
            output_groups: vec![TORQUES.into()],
            sink_subscribers: 1,
            model: Box::new(SumModel {
                evaluated: r.evaluated.clone(),
            }),
            optimizer: None,
            alignment_tolerance: None,
            cancel: r.cancel.clone(),
        });
        assert!(matches!(res, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn misaligned_inputs_fail_and_cancel() {
        let mut r = rig(&[TORQUES]);
        let ev = evaluator(&mut r, EvaluatorKind::Online, &[TORQUES]).unwrap();
        feed(&r, EXCITATIONS, &[0.0, 0.01]);
        feed(&r, LENGTHS, &[0.0, 0.02]);

        let err = ev.execute().unwrap_err();
        assert!(matches!(err, PipelineError::Misaligned { step: 1, .. }), "{err}");
        assert!(r.cancel.is_cancelled());
    }

    #[test]
    fn shorter_input_ends_the_run_and_rest_is_drained() {
        let mut r = rig(&[TORQUES]);
        let ev = evaluator(&mut r, EvaluatorKind::Online, &[TORQUES]).unwrap();
        feed(&r, EXCITATIONS, &[0.0, 0.01, 0.02]);
        feed(&r, LENGTHS, &[0.0]);

        assert_eq!(ev.execute().unwrap().steps, 1);
        assert_eq!(drain(&mut r, TORQUES).len(), 1);
        assert_eq!(*r.evaluated.lock(), vec![0.0]);
    }

    #[test]
    fn missing_output_group_is_a_model_error() {
        let mut r = rig(&["Activations"]);
        let ev = evaluator(&mut r, EvaluatorKind::Online, &["Activations"]).unwrap();
        feed(&r, EXCITATIONS, &[0.0]);
        feed(&r, LENGTHS, &[0.0]);

        assert!(matches!(ev.execute(), Err(PipelineError::Model(_))));
    }

    struct Exploding;

    impl NmsModel for Exploding {
        fn evaluate(&mut self, _frame: &ModelFrame) -> anyhow::Result<ModelOutput> {
            panic!("model blew up");
        }

        fn trial(&self, _frame: &ModelFrame) -> anyhow::Result<ModelOutput> {
            Ok(ModelOutput::new())
        }
    }

    #[test]
    fn panicking_model_cancels_before_outputs_close() {
        let mut r = rig(&[TORQUES]);
        let ev = evaluator_with(&mut r, EvaluatorKind::Online, &[TORQUES], Box::new(Exploding))
            .unwrap();
        feed(&r, EXCITATIONS, &[0.0]);
        feed(&r, LENGTHS, &[0.0]);
        let rx = r.output.receiver([TORQUES]).unwrap();
        // the evaluator now holds the only output sender
        drop(r.output);

        let handle = ev.spawn().unwrap();
        assert!(matches!(rx.pop(TORQUES), Err(PipelineError::Cancelled)));
        assert!(handle.join().is_err());
        assert_eq!(
            r.cancel.reason().as_deref(),
            Some("evaluator exited abnormally")
        );
    }

    #[test]
    fn cancelled_pipeline_stops_without_signalling() {
        let mut r = rig(&[TORQUES]);
        let ev = evaluator(&mut r, EvaluatorKind::Online, &[TORQUES]).unwrap();
        r.cancel.cancel();

        assert!(matches!(ev.execute(), Err(PipelineError::Cancelled)));
        let rx = r.output.receiver([TORQUES]).unwrap();
        assert!(!rx.is_drained());
    }
}
