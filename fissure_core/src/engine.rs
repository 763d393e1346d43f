//! The iteration engine.
//!
//! An [`Engine`] owns everything one fuzzing run needs: the state model, the
//! publishers its actions run against, the agents that watch the target, the
//! mutation strategy and the run observers. [`Engine::run`] drives the
//! session:
//!
//! 1. sample data of every action is cracked once into its data model;
//! 2. agents are told the session starts and publishers are started;
//! 3. iteration 1 runs the unmutated models and records which mutators apply
//!    where (a run that starts later records the same models without
//!    running them);
//! 4. every later iteration applies the single mutation its number selects
//!    right before the owning action runs;
//! 5. after each iteration the agents are asked for faults and whether the
//!    run must stop;
//! 6. teardown always runs, whichever way the loop ended.

use crate::agent::{Agent, AgentError, AgentManager};
use crate::cracker::{CrackError, Cracker};
use crate::fault::{ActionPayload, FaultRecord};
use crate::fixup::FixupStore;
use crate::generate::GenerateError;
use crate::model::DataModel;
use crate::monitor::ACTION_CALL;
use crate::mutator::MutatorRegistry;
use crate::observer::RunObserver;
use crate::publisher::{Publisher, PublisherError};
use crate::state::{Action, ActionKind, StateModel};
use crate::strategy::{MutationStrategy, Selection, StrategyError};
use crate::variant::Variant;
use crate::watchdog::Watchdog;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub const ACTION_STARTING: &str = "Action.Starting";
pub const ACTION_FINISHED: &str = "Action.Finished";
pub const DEFAULT_SEED: u64 = 31337;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Only the current iteration is lost.
    #[error("{0}")]
    Soft(String),
    /// The run cannot continue.
    #[error("{0}")]
    Fatal(String),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }
}

impl From<PublisherError> for EngineError {
    fn from(error: PublisherError) -> Self {
        match error {
            PublisherError::Soft(_) => EngineError::Soft(error.to_string()),
            PublisherError::Fatal(_) | PublisherError::Unsupported { .. } => EngineError::Fatal(error.to_string()),
        }
    }
}

impl From<GenerateError> for EngineError {
    fn from(error: GenerateError) -> Self {
        match error {
            GenerateError::UnresolvedRelation { .. } | GenerateError::Fixup(_) => {
                EngineError::Fatal(error.to_string())
            }
            GenerateError::Value { .. } | GenerateError::OffsetsUnstable(_) => EngineError::Soft(error.to_string()),
        }
    }
}

impl From<StrategyError> for EngineError {
    fn from(error: StrategyError) -> Self {
        match error {
            StrategyError::Mutator(_) => EngineError::Soft(error.to_string()),
            StrategyError::Unbounded { .. } | StrategyError::NotRecorded => EngineError::Fatal(error.to_string()),
        }
    }
}

/// What an agent timeout costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    #[default]
    Fatal,
    Soft,
}

fn agent_error(policy: TimeoutPolicy, error: AgentError) -> EngineError {
    match (&error, policy) {
        (AgentError::Timeout { .. }, TimeoutPolicy::Soft) | (AgentError::Monitor { .. }, _) => {
            EngineError::Soft(error.to_string())
        }
        (AgentError::Timeout { .. }, TimeoutPolicy::Fatal) | (AgentError::Disconnected { .. }, _) => {
            EngineError::Fatal(error.to_string())
        }
    }
}

fn observer_error(event: &str, error: anyhow::Error) -> EngineError {
    EngineError::Fatal(format!("observer failed on {event}: {error:#}"))
}

/// Runs only iterations `n` with `n % count == index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub count: u64,
    pub index: u64,
}

impl Shard {
    pub fn accepts(&self, iteration: u64) -> bool {
        iteration % self.count == self.index
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub run_name: String,
    pub seed: u64,
    /// First iteration to run.
    pub skip_to: Option<u64>,
    /// Inclusive iteration range to run.
    pub range: Option<(u64, u64)>,
    pub shard: Option<Shard>,
    /// Run iteration 1 only.
    pub single_iteration: bool,
    /// Last iteration to run.
    pub max_iterations: Option<u64>,
    pub agent_timeout_policy: TimeoutPolicy,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            run_name: "fissure".to_string(),
            seed: DEFAULT_SEED,
            skip_to: None,
            range: None,
            shard: None,
            single_iteration: false,
            max_iterations: None,
            agent_timeout_policy: TimeoutPolicy::default(),
        }
    }
}

impl RunSettings {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.skip_to == Some(0) {
            return Err(EngineError::Fatal("skip-to counts iterations from 1".to_string()));
        }
        if let Some((start, end)) = self.range {
            if start == 0 || start > end {
                return Err(EngineError::Fatal(format!("invalid iteration range {start}..={end}")));
            }
        }
        if let Some(shard) = self.shard {
            if shard.count == 0 || shard.index >= shard.count {
                return Err(EngineError::Fatal(format!(
                    "invalid shard {} of {}",
                    shard.index, shard.count
                )));
            }
        }
        Ok(())
    }

    pub fn first_iteration(&self) -> u64 {
        if self.single_iteration {
            return 1;
        }
        let skip = self.skip_to.unwrap_or(1);
        let start = self.range.map(|(start, _)| start).unwrap_or(1);
        skip.max(start).max(1)
    }

    /// Last iteration the settings allow, ignoring the strategy.
    pub fn last_iteration(&self) -> Option<u64> {
        if self.single_iteration {
            return Some(1);
        }
        match (self.range.map(|(_, end)| end), self.max_iterations) {
            (Some(end), Some(max)) => Some(end.min(max)),
            (end, max) => end.or(max),
        }
    }

    pub fn accepts(&self, iteration: u64) -> bool {
        self.shard.is_none_or(|shard| shard.accepts(iteration))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    RunStarting,
    TestStarting,
    StateModelStarting,
    IterationStarting,
    Executing,
    IterationFinished,
    FaultCheck,
    StateModelFinished,
    TestFinished,
    RunError,
    RunFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The strategy has no mutations left.
    Exhausted,
    /// The last iteration the settings allow has run.
    Limit,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Iterations executed, including those lost to soft errors.
    pub iterations: u64,
    pub faults: u64,
    pub soft_errors: u64,
    pub first_iteration: Option<u64>,
    pub last_iteration: Option<u64>,
    pub stop: StopReason,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            iterations: 0,
            faults: 0,
            soft_errors: 0,
            first_iteration: None,
            last_iteration: None,
            stop: StopReason::Error,
        }
    }
}

/// Asks a running engine to stop at the next iteration boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Started {
    agents: bool,
    publishers: bool,
}

pub struct Engine {
    settings: RunSettings,
    state_model: StateModel,
    strategy: Box<dyn MutationStrategy>,
    registry: MutatorRegistry,
    publishers: BTreeMap<String, Box<dyn Publisher>>,
    agents: AgentManager,
    observers: Vec<Box<dyn RunObserver>>,
    cancel: CancelToken,
    state: EngineState,
    #[cfg(test)]
    history: Vec<EngineState>,
}

impl Engine {
    pub fn new(
        settings: RunSettings,
        state_model: StateModel,
        strategy: Box<dyn MutationStrategy>,
        registry: MutatorRegistry,
    ) -> Self {
        Self {
            settings,
            state_model,
            strategy,
            registry,
            publishers: BTreeMap::new(),
            agents: AgentManager::new(),
            observers: Vec::new(),
            cancel: CancelToken::new(),
            state: EngineState::Idle,
            #[cfg(test)]
            history: Vec::new(),
        }
    }

    /// Adds a publisher under its own name, replacing one with the same name.
    pub fn with_publisher(mut self, publisher: Box<dyn Publisher>) -> Self {
        self.add_publisher(publisher);
        self
    }

    pub fn add_publisher(&mut self, publisher: Box<dyn Publisher>) {
        self.publishers.insert(publisher.name().to_string(), publisher);
    }

    pub fn with_agent(mut self, agent: Box<dyn Agent>) -> Self {
        self.agents.add(agent);
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    fn transition(&mut self, state: EngineState) {
        trace!(from = ?self.state, to = ?state, "engine state");
        #[cfg(test)]
        self.history.push(state);
        self.state = state;
    }

    /// Runs the whole session.
    ///
    /// # Errors
    /// Returns the fatal error that ended the run. Soft errors never end the
    /// run; they are counted in the summary.
    pub fn run(&mut self) -> Result<RunSummary, EngineError> {
        self.transition(EngineState::RunStarting);
        let mut summary = RunSummary::new();
        let mut started = Started::default();
        let outcome = self.run_session(&mut summary, &mut started);
        self.teardown(&started);

        match &outcome {
            Ok(stop) => summary.stop = *stop,
            Err(error) => {
                summary.stop = StopReason::Error;
                self.transition(EngineState::RunError);
                for observer in &mut self.observers {
                    if let Err(e) = observer.run_error(error) {
                        warn!("ignoring observer error on run error: {e:#}");
                    }
                }
            }
        }
        self.transition(EngineState::RunFinished);
        for observer in &mut self.observers {
            if let Err(e) = observer.run_finished(&summary) {
                warn!("ignoring observer error on run finished: {e:#}");
            }
        }
        self.transition(EngineState::Idle);
        info!(
            iterations = summary.iterations,
            faults = summary.faults,
            stop = ?summary.stop,
            "session finished"
        );
        outcome.map(|_| summary)
    }

    fn run_session(&mut self, summary: &mut RunSummary, started: &mut Started) -> Result<StopReason, EngineError> {
        for observer in &mut self.observers {
            observer
                .run_starting(&self.settings)
                .map_err(|e| observer_error("run starting", e))?;
        }
        self.settings.validate()?;
        self.check_publishers()?;
        let models = self.crack_samples()?;

        started.agents = true;
        self.agents
            .session_starting()
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        started.publishers = true;
        for publisher in self.publishers.values_mut() {
            publisher.start().map_err(|e| EngineError::Fatal(e.to_string()))?;
        }

        self.transition(EngineState::TestStarting);
        for observer in &mut self.observers {
            observer
                .test_starting(self.state_model.name())
                .map_err(|e| observer_error("test starting", e))?;
        }

        let first = self.settings.first_iteration();
        let record_live = first == 1 && self.settings.accepts(1);
        if !record_live {
            debug!(first, "recording data models without running iteration 1");
            self.strategy.begin_recording();
            self.record(&models);
            self.strategy.finish_recording()?;
        }

        let policy = self.settings.agent_timeout_policy;
        let mut iteration = first;
        loop {
            if self.cancel.is_cancelled() {
                info!(iteration, "run cancelled");
                return Ok(StopReason::Cancelled);
            }
            if self.settings.last_iteration().is_some_and(|last| iteration > last) {
                return Ok(StopReason::Limit);
            }
            if self.strategy.is_recorded()
                && self.strategy.total_iterations().is_some_and(|total| iteration > total)
            {
                return Ok(StopReason::Exhausted);
            }
            if !self.settings.accepts(iteration) {
                iteration += 1;
                continue;
            }

            let recording = record_live && iteration == 1;
            let outcome = self.run_iteration(iteration, &models, recording, summary);
            if recording && !self.strategy.is_recorded() {
                debug!("iteration 1 ended early, finishing its recording");
                self.strategy.finish_recording()?;
            }
            self.transition(EngineState::StateModelFinished);
            match outcome {
                Ok(()) => {}
                Err(error @ EngineError::Soft(_)) => {
                    summary.soft_errors += 1;
                    for observer in &mut self.observers {
                        observer
                            .iteration_error(iteration, &error)
                            .map_err(|e| observer_error("iteration error", e))?;
                    }
                }
                Err(fatal) => return Err(fatal),
            }
            summary.iterations += 1;
            if summary.first_iteration.is_none() {
                summary.first_iteration = Some(iteration);
            }
            summary.last_iteration = Some(iteration);
            for observer in &mut self.observers {
                observer
                    .iteration_finished(iteration)
                    .map_err(|e| observer_error("iteration finished", e))?;
            }

            match self.agents.must_stop().map_err(|e| agent_error(policy, e)) {
                Ok(false) => {}
                Ok(true) => {
                    return Err(EngineError::Fatal(format!(
                        "an agent asked the run to stop after iteration {iteration}"
                    )));
                }
                Err(EngineError::Soft(reason)) => {
                    warn!(iteration, "must-stop check failed: {reason}");
                }
                Err(fatal) => return Err(fatal),
            }
            iteration += 1;
        }
    }

    fn check_publishers(&self) -> Result<(), EngineError> {
        for action in self.state_model.actions() {
            if !self.publishers.contains_key(&action.publisher) {
                return Err(EngineError::Fatal(format!(
                    "action '{}' uses unknown publisher '{}'",
                    action.name, action.publisher
                )));
            }
        }
        Ok(())
    }

    /// The session's working copy of every action's data model, with its
    /// sample cracked in.
    fn crack_samples(&self) -> Result<Vec<Option<DataModel>>, EngineError> {
        let mut cracker = Cracker::new();
        let mut models = Vec::with_capacity(self.state_model.len());
        for action in self.state_model.actions() {
            let Some(template) = &action.model else {
                models.push(None);
                continue;
            };
            let mut model = template.clone();
            if let Some(sample) = &action.sample {
                let report = cracker.crack(&mut model, sample).map_err(|e| {
                    EngineError::Fatal(format!("sample of action '{}' does not crack: {e}", action.name))
                })?;
                debug!(
                    action = %action.name,
                    consumed_bits = report.consumed_bits,
                    unread_bytes = report.unread_bytes(),
                    "sample cracked"
                );
            }
            models.push(Some(model));
        }
        Ok(models)
    }

    fn record(&mut self, models: &[Option<DataModel>]) {
        for (action, model) in models.iter().enumerate() {
            if let Some(model) = model {
                self.strategy.record(action, model, &self.registry);
            }
        }
    }

    fn run_iteration(
        &mut self,
        iteration: u64,
        models: &[Option<DataModel>],
        recording: bool,
        summary: &mut RunSummary,
    ) -> Result<(), EngineError> {
        let policy = self.settings.agent_timeout_policy;
        self.transition(EngineState::StateModelStarting);
        if recording {
            self.strategy.begin_recording();
            self.record(models);
        }

        self.transition(EngineState::IterationStarting);
        let total = match (self.strategy.is_recorded(), self.strategy.total_iterations()) {
            (true, Some(total)) => Some(self.settings.last_iteration().map_or(total, |last| last.min(total))),
            _ => self.settings.last_iteration(),
        };
        for observer in &mut self.observers {
            observer
                .iteration_starting(iteration, total)
                .map_err(|e| observer_error("iteration starting", e))?;
        }
        self.agents
            .iteration_starting(iteration, false)
            .map_err(|e| agent_error(policy, e))?;

        self.transition(EngineState::Executing);
        let mut working = models.to_vec();
        let mut payloads = Vec::new();
        let mut applied = None;
        let mut fixups = FixupStore::new();
        let executed = self.execute_actions(iteration, &mut working, &mut fixups, &mut payloads, &mut applied);

        self.transition(EngineState::IterationFinished);
        let finished = self.agents.iteration_finished().map_err(|e| agent_error(policy, e));
        if recording {
            self.strategy.finish_recording()?;
        }
        if let Err(fatal @ EngineError::Fatal(_)) = executed {
            return Err(fatal);
        }
        finished?;

        self.transition(EngineState::FaultCheck);
        if self.agents.detected_fault().map_err(|e| agent_error(policy, e))? {
            let data = self.agents.monitor_data().map_err(|e| agent_error(policy, e))?;
            let mutation = applied.map(|s: Selection| format!("{} via {} #{}", s.element, s.mutator, s.candidate));
            let fault = FaultRecord::new(iteration, data, payloads, mutation);
            summary.faults += 1;
            for observer in &mut self.observers {
                observer.fault(&fault).map_err(|e| observer_error("fault", e))?;
            }
        }
        executed
    }

    fn execute_actions(
        &mut self,
        iteration: u64,
        working: &mut [Option<DataModel>],
        fixups: &mut FixupStore,
        payloads: &mut Vec<ActionPayload>,
        applied: &mut Option<Selection>,
    ) -> Result<(), EngineError> {
        let policy = self.settings.agent_timeout_policy;
        for (index, action) in self.state_model.actions().iter().enumerate() {
            let label = Variant::from(action.name.as_str());
            trace!(iteration, action = %action.name, kind = %action.kind, "action starting");
            self.agents
                .message(ACTION_STARTING, &label)
                .map_err(|e| agent_error(policy, e))?;
            if let ActionKind::Call { method } = &action.kind {
                self.agents
                    .message(ACTION_CALL, &Variant::from(method.as_str()))
                    .map_err(|e| agent_error(policy, e))?;
            }

            if let Some(model) = working[index].as_mut() {
                if let Some(selection) = self.strategy.apply(iteration, index, model)? {
                    *applied = Some(selection);
                }
            }

            let publisher = self.publishers.get_mut(&action.publisher).ok_or_else(|| {
                EngineError::Fatal(format!("unknown publisher '{}'", action.publisher))
            })?;
            let watchdog = action
                .watchdog
                .map(|limit| (limit, Watchdog::arm(limit, publisher.interrupter())));
            let result = perform(action, publisher.as_mut(), working[index].as_mut(), fixups, payloads);
            if let Some((limit, watchdog)) = watchdog {
                if watchdog.disarm() {
                    return Err(EngineError::Soft(format!(
                        "action '{}' ran longer than {limit:?}",
                        action.name
                    )));
                }
            }
            result?;

            self.agents
                .message(ACTION_FINISHED, &label)
                .map_err(|e| agent_error(policy, e))?;
        }
        Ok(())
    }

    fn teardown(&mut self, started: &Started) {
        self.transition(EngineState::TestFinished);
        if started.publishers {
            for publisher in self.publishers.values_mut() {
                if let Err(e) = publisher.stop() {
                    warn!(publisher = publisher.name(), "ignoring error from stop: {e}");
                }
            }
        }
        if started.agents {
            self.agents.session_finished();
        }
        self.agents.stop_all_monitors();
    }
}

fn perform(
    action: &Action,
    publisher: &mut dyn Publisher,
    model: Option<&mut DataModel>,
    fixups: &mut FixupStore,
    payloads: &mut Vec<ActionPayload>,
) -> Result<(), EngineError> {
    match &action.kind {
        ActionKind::Open => publisher.open()?,
        ActionKind::Close => publisher.close()?,
        ActionKind::Output => {
            let model = model
                .ok_or_else(|| EngineError::Fatal(format!("output action '{}' has no data model", action.name)))?;
            model.output_starting(fixups).map_err(GenerateError::from)?;
            let data = model.generate_with(fixups)?;
            payloads.push(ActionPayload {
                action: action.name.clone(),
                data: data.clone(),
            });
            publisher.output(&data)?;
        }
        ActionKind::Input { max_size } => {
            let data = publisher.input(*max_size)?;
            if let Some(model) = model {
                Cracker::new().crack(model, &data).map_err(|e| match e {
                    CrackError::Failure { .. } => {
                        EngineError::Soft(format!("input of action '{}' does not crack: {e}", action.name))
                    }
                    CrackError::Definition { .. } => EngineError::Fatal(e.to_string()),
                })?;
            }
        }
        ActionKind::Call { method } => {
            let mut args = Vec::new();
            if let Some(model) = model {
                let data = model.generate_with(fixups)?;
                payloads.push(ActionPayload {
                    action: action.name.clone(),
                    data: data.clone(),
                });
                args.push(Variant::Bytes(data));
            }
            if let Some(reply) = publisher.call(method, &args)? {
                trace!(action = %action.name, %reply, "call returned");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LocalAgent;
    use crate::agent::test_utils::ScriptedMonitor;
    use crate::element::{DataElement, ElementKind};
    use crate::publisher::{Capture, NullPublisher};
    use crate::strategy::SequentialStrategy;
    use std::sync::Mutex;
    use std::time::Duration;

    const VERBS: [&str; 5] = ["PUT", "POST", "HEAD", "DELETE", "PATCH"];

    fn request_model() -> DataModel {
        DataModel::new(DataElement::block(
            "req",
            vec![DataElement::string("verb").with_default("GET")],
        ))
        .unwrap()
    }

    fn verb_registry() -> MutatorRegistry {
        let mut registry = MutatorRegistry::new();
        registry.register_fixed_values(
            "Verbs",
            vec![ElementKind::String],
            VERBS.into_iter().map(Variant::from).collect(),
        );
        registry
    }

    fn state_model() -> StateModel {
        StateModel::new("session", vec![Action::output("send", "null", request_model())]).unwrap()
    }

    fn sequential_engine(settings: RunSettings) -> (Engine, Capture) {
        let (publisher, capture) = NullPublisher::capturing("null");
        let engine = Engine::new(
            settings,
            state_model(),
            Box::new(SequentialStrategy::new(DEFAULT_SEED)),
            verb_registry(),
        )
        .with_publisher(Box::new(publisher));
        (engine, capture)
    }

    fn outputs(capture: &Capture) -> Vec<String> {
        capture
            .lock()
            .unwrap()
            .iter()
            .map(|data| String::from_utf8(data.clone()).unwrap())
            .collect()
    }

    fn full_run() -> Vec<String> {
        let (mut engine, capture) = sequential_engine(RunSettings::default());
        let summary = engine.run().unwrap();
        assert_eq!(summary.stop, StopReason::Exhausted);
        outputs(&capture)
    }

    #[derive(Clone, Default)]
    struct EventLog(Arc<Mutex<Vec<String>>>);

    impl EventLog {
        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl RunObserver for EventLog {
        fn iteration_starting(&mut self, iteration: u64, _total: Option<u64>) -> Result<(), anyhow::Error> {
            self.0.lock().unwrap().push(format!("start {iteration}"));
            Ok(())
        }

        fn fault(&mut self, fault: &FaultRecord) -> Result<(), anyhow::Error> {
            self.0.lock().unwrap().push(format!(
                "fault {} {} {}",
                fault.iteration,
                fault.bucket,
                fault.mutation.clone().unwrap_or_default()
            ));
            Ok(())
        }

        fn iteration_error(&mut self, iteration: u64, _error: &EngineError) -> Result<(), anyhow::Error> {
            self.0.lock().unwrap().push(format!("soft {iteration}"));
            Ok(())
        }

        fn run_error(&mut self, _error: &EngineError) -> Result<(), anyhow::Error> {
            self.0.lock().unwrap().push("run error".to_string());
            Ok(())
        }

        fn run_finished(&mut self, summary: &RunSummary) -> Result<(), anyhow::Error> {
            self.0.lock().unwrap().push(format!("finished {:?}", summary.stop));
            Ok(())
        }
    }

    /// Fails `output` with the given error on chosen calls.
    struct Flaky {
        calls: u64,
        fail_on: u64,
        error: PublisherError,
    }

    impl Publisher for Flaky {
        fn name(&self) -> &str {
            "null"
        }

        fn output(&mut self, _data: &[u8]) -> Result<(), PublisherError> {
            self.calls += 1;
            if self.calls == self.fail_on {
                return Err(self.error.clone());
            }
            Ok(())
        }
    }

    #[test]
    fn sequential_run_enumerates_every_candidate() {
        let mut expected = vec!["GET".to_string()];
        expected.extend(VERBS.iter().map(|v| v.to_string()));
        assert_eq!(full_run(), expected);
    }

    #[test]
    fn fast_forward_matches_full_run() {
        let full = full_run();
        let (mut engine, capture) = sequential_engine(RunSettings {
            skip_to: Some(4),
            ..RunSettings::default()
        });
        let summary = engine.run().unwrap();
        assert_eq!(outputs(&capture), full[3..].to_vec());
        assert_eq!(summary.first_iteration, Some(4));
        assert_eq!(summary.iterations, 3);
    }

    #[test]
    fn range_and_shards_pick_iterations() {
        let full = full_run();

        let (mut engine, capture) = sequential_engine(RunSettings {
            range: Some((3, 4)),
            ..RunSettings::default()
        });
        assert_eq!(engine.run().unwrap().stop, StopReason::Limit);
        assert_eq!(outputs(&capture), full[2..4].to_vec());

        let (mut engine, capture) = sequential_engine(RunSettings {
            shard: Some(Shard { count: 2, index: 1 }),
            ..RunSettings::default()
        });
        engine.run().unwrap();
        assert_eq!(outputs(&capture), vec![full[0].clone(), full[2].clone(), full[4].clone()]);

        let (mut engine, capture) = sequential_engine(RunSettings {
            shard: Some(Shard { count: 2, index: 0 }),
            ..RunSettings::default()
        });
        engine.run().unwrap();
        assert_eq!(outputs(&capture), vec![full[1].clone(), full[3].clone(), full[5].clone()]);
    }

    #[test]
    fn single_iteration_runs_once() {
        let (mut engine, capture) = sequential_engine(RunSettings {
            single_iteration: true,
            skip_to: Some(3),
            ..RunSettings::default()
        });
        let summary = engine.run().unwrap();
        assert_eq!(summary.iterations, 1);
        assert_eq!(outputs(&capture), vec!["GET"]);
    }

    #[test]
    fn invalid_settings_are_fatal() {
        let (mut engine, _) = sequential_engine(RunSettings {
            shard: Some(Shard { count: 2, index: 2 }),
            ..RunSettings::default()
        });
        assert!(engine.run().unwrap_err().is_fatal());
    }

    #[test]
    fn faults_are_bucketed_and_reported() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut monitor = ScriptedMonitor::new("m", log.clone());
        monitor.fault_on = vec![3];
        monitor.bucket = Some("exit_1".into());
        let events = EventLog::default();
        let (engine, _capture) = sequential_engine(RunSettings::default());
        let mut engine = engine
            .with_agent(Box::new(LocalAgent::new("local").with_monitor(Box::new(monitor))))
            .with_observer(Box::new(events.clone()));
        let summary = engine.run().unwrap();
        assert_eq!(summary.faults, 1);
        assert!(events.events().contains(&"fault 3 exit_1 req.verb via Verbs #1".to_string()));

        let log = log.lock().unwrap();
        assert_eq!(log[0], "m:session_starting");
        assert_eq!(log[1], "m:iteration_starting(1,false)");
        assert_eq!(log[2], "m:message(Action.Starting,\"send\")");
        assert_eq!(log[3], "m:message(Action.Finished,\"send\")");
        assert_eq!(log[4], "m:iteration_finished");
        assert_eq!(log.iter().filter(|e| e.as_str() == "m:monitor_data").count(), 1);
        assert_eq!(log[log.len() - 2], "m:session_finished");
        assert_eq!(log[log.len() - 1], "m:stop_monitor");
    }

    #[test]
    fn soft_errors_lose_one_iteration() {
        let events = EventLog::default();
        let mut engine = Engine::new(
            RunSettings::default(),
            state_model(),
            Box::new(SequentialStrategy::new(DEFAULT_SEED)),
            verb_registry(),
        )
        .with_publisher(Box::new(Flaky {
            calls: 0,
            fail_on: 2,
            error: PublisherError::Soft("connection reset".into()),
        }))
        .with_observer(Box::new(events.clone()));
        let summary = engine.run().unwrap();
        assert_eq!(summary.iterations, 6);
        assert_eq!(summary.soft_errors, 1);
        assert!(events.events().contains(&"soft 2".to_string()));
    }

    #[test]
    fn fatal_errors_stop_the_run_and_tear_down() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let events = EventLog::default();
        let mut engine = Engine::new(
            RunSettings::default(),
            state_model(),
            Box::new(SequentialStrategy::new(DEFAULT_SEED)),
            verb_registry(),
        )
        .with_publisher(Box::new(Flaky {
            calls: 0,
            fail_on: 3,
            error: PublisherError::Fatal("target gone".into()),
        }))
        .with_agent(Box::new(
            LocalAgent::new("local").with_monitor(Box::new(ScriptedMonitor::new("m", log.clone()))),
        ))
        .with_observer(Box::new(events.clone()));
        let err = engine.run().unwrap_err();
        assert_eq!(err, EngineError::Fatal("target gone".into()));
        assert_eq!(engine.state(), EngineState::Idle);

        let events = events.events();
        assert_eq!(&events[events.len() - 2..], ["run error", "finished Error"]);
        let log = log.lock().unwrap();
        assert!(log.contains(&"m:session_finished".to_string()));
        assert!(log.contains(&"m:stop_monitor".to_string()));
    }

    #[test]
    fn must_stop_is_fatal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut monitor = ScriptedMonitor::new("m", log);
        monitor.stop_on = Some(2);
        let (engine, capture) = sequential_engine(RunSettings::default());
        let mut engine =
            engine.with_agent(Box::new(LocalAgent::new("local").with_monitor(Box::new(monitor))));
        assert!(engine.run().unwrap_err().is_fatal());
        assert_eq!(outputs(&capture).len(), 2);
    }

    #[test]
    fn soft_error_in_recording_iteration_keeps_the_run_going() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut monitor = ScriptedMonitor::new("m", log);
        monitor.fail_on_iteration = Some(1);
        let (engine, capture) = sequential_engine(RunSettings::default());
        let mut engine =
            engine.with_agent(Box::new(LocalAgent::new("local").with_monitor(Box::new(monitor))));
        let summary = engine.run().unwrap();
        assert_eq!(summary.stop, StopReason::Exhausted);
        assert_eq!(summary.soft_errors, 1);
        assert_eq!(summary.iterations, 6);
        assert_eq!(outputs(&capture), VERBS);

        let (engine, _) = sequential_engine(RunSettings {
            agent_timeout_policy: TimeoutPolicy::Soft,
            ..RunSettings::default()
        });
        let mut engine = engine.with_agent(Box::new(TimingOut { on_iteration: 1 }));
        let summary = engine.run().unwrap();
        assert_eq!((summary.iterations, summary.soft_errors), (6, 1));
    }

    #[test]
    fn iteration_states_nest_inside_the_state_model() {
        let (mut engine, _) = sequential_engine(RunSettings {
            single_iteration: true,
            ..RunSettings::default()
        });
        engine.run().unwrap();
        let iteration: Vec<EngineState> = engine
            .history
            .iter()
            .copied()
            .skip_while(|s| *s != EngineState::StateModelStarting)
            .take(6)
            .collect();
        assert_eq!(
            iteration,
            vec![
                EngineState::StateModelStarting,
                EngineState::IterationStarting,
                EngineState::Executing,
                EngineState::IterationFinished,
                EngineState::FaultCheck,
                EngineState::StateModelFinished,
            ]
        );
    }

    #[test]
    fn sequence_fixup_counts_outputs_within_each_iteration() {
        use crate::fixup::SequenceIncrement;

        let model = DataModel::new(DataElement::block(
            "msg",
            vec![
                DataElement::number("seq", 8).with_default(u64::from(b'0')).with_fixup(SequenceIncrement),
                DataElement::string("verb").with_default("GET"),
            ],
        ))
        .unwrap();
        let state_model = StateModel::new(
            "session",
            vec![
                Action::output("first", "null", model.clone()),
                Action::output("second", "null", model),
            ],
        )
        .unwrap();
        let (publisher, capture) = NullPublisher::capturing("null");
        let mut engine = Engine::new(
            RunSettings {
                max_iterations: Some(2),
                ..RunSettings::default()
            },
            state_model,
            Box::new(SequentialStrategy::new(DEFAULT_SEED)),
            verb_registry(),
        )
        .with_publisher(Box::new(publisher));
        engine.run().unwrap();

        let sent = outputs(&capture);
        assert_eq!(sent.len(), 4);
        assert_eq!(&sent[0], "1GET");
        assert_eq!(&sent[1], "2GET");
        let counters: Vec<u8> = sent.iter().map(|s| s.as_bytes()[0]).collect();
        assert_eq!(counters, b"1212".to_vec());
    }

    #[test]
    fn monitor_failure_is_soft() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut monitor = ScriptedMonitor::new("m", log);
        monitor.fail_on_iteration = Some(2);
        let (engine, capture) = sequential_engine(RunSettings::default());
        let mut engine =
            engine.with_agent(Box::new(LocalAgent::new("local").with_monitor(Box::new(monitor))));
        let summary = engine.run().unwrap();
        assert_eq!(summary.soft_errors, 1);
        assert_eq!(outputs(&capture).len(), 5);
    }

    struct TimingOut {
        on_iteration: u64,
    }

    impl Agent for TimingOut {
        fn name(&self) -> &str {
            "remote"
        }
        fn session_starting(&mut self) -> Result<(), AgentError> {
            Ok(())
        }
        fn iteration_starting(&mut self, iteration: u64, _is_reproduction: bool) -> Result<(), AgentError> {
            if iteration == self.on_iteration {
                return Err(AgentError::Timeout {
                    agent: "remote".into(),
                    operation: "IterationStarting",
                    timeout: Duration::from_millis(1),
                });
            }
            Ok(())
        }
        fn iteration_finished(&mut self) -> Result<(), AgentError> {
            Ok(())
        }
        fn detected_fault(&mut self) -> Result<bool, AgentError> {
            Ok(false)
        }
        fn monitor_data(&mut self) -> Result<Vec<crate::agent::MonitorData>, AgentError> {
            Ok(Vec::new())
        }
        fn message(&mut self, _name: &str, _data: &Variant) -> Result<Option<Variant>, AgentError> {
            Ok(None)
        }
        fn session_finished(&mut self) -> Result<(), AgentError> {
            Ok(())
        }
        fn stop_monitor(&mut self) -> Result<(), AgentError> {
            Ok(())
        }
        fn must_stop(&mut self) -> Result<bool, AgentError> {
            Ok(false)
        }
    }

    #[test]
    fn agent_timeouts_follow_policy() {
        let (engine, _) = sequential_engine(RunSettings {
            agent_timeout_policy: TimeoutPolicy::Soft,
            ..RunSettings::default()
        });
        let mut engine = engine.with_agent(Box::new(TimingOut { on_iteration: 2 }));
        assert_eq!(engine.run().unwrap().soft_errors, 1);

        let (engine, _) = sequential_engine(RunSettings::default());
        let mut engine = engine.with_agent(Box::new(TimingOut { on_iteration: 2 }));
        assert!(engine.run().unwrap_err().is_fatal());
    }

    #[test]
    fn cancellation_stops_at_iteration_boundary() {
        struct CancelAt(CancelToken, u64);
        impl RunObserver for CancelAt {
            fn iteration_finished(&mut self, iteration: u64) -> Result<(), anyhow::Error> {
                if iteration == self.1 {
                    self.0.cancel();
                }
                Ok(())
            }
        }
        let (engine, capture) = sequential_engine(RunSettings::default());
        let token = engine.cancel_token();
        let mut engine = engine.with_observer(Box::new(CancelAt(token, 2)));
        let summary = engine.run().unwrap();
        assert_eq!(summary.stop, StopReason::Cancelled);
        assert_eq!(outputs(&capture).len(), 2);
    }

    #[test]
    fn watchdog_expiry_is_soft() {
        struct Slow;
        impl Publisher for Slow {
            fn name(&self) -> &str {
                "null"
            }
            fn output(&mut self, _data: &[u8]) -> Result<(), PublisherError> {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }
        }
        let action = Action::output("send", "null", request_model()).with_watchdog(Duration::from_millis(20));
        let mut engine = Engine::new(
            RunSettings {
                single_iteration: true,
                ..RunSettings::default()
            },
            StateModel::new("session", vec![action]).unwrap(),
            Box::new(SequentialStrategy::new(DEFAULT_SEED)),
            verb_registry(),
        )
        .with_publisher(Box::new(Slow));
        assert_eq!(engine.run().unwrap().soft_errors, 1);
    }

    #[test]
    fn unbounded_mutator_under_sequential_is_fatal() {
        let mut engine = Engine::new(
            RunSettings::default(),
            state_model(),
            Box::new(SequentialStrategy::new(DEFAULT_SEED)),
            MutatorRegistry::with_builtins(),
        )
        .with_publisher(Box::new(NullPublisher::new("null")));
        let err = engine.run().unwrap_err();
        assert!(err.to_string().contains("unbounded"));
    }

    #[test]
    fn sample_is_cracked_before_the_session() {
        let model = DataModel::new(DataElement::block(
            "req",
            vec![DataElement::string("verb").with_length_bytes(3)],
        ))
        .unwrap();
        let action = Action::output("send", "null", model).with_sample(b"PUT".to_vec());
        let (publisher, capture) = NullPublisher::capturing("null");
        let mut engine = Engine::new(
            RunSettings {
                single_iteration: true,
                ..RunSettings::default()
            },
            StateModel::new("session", vec![action]).unwrap(),
            Box::new(SequentialStrategy::new(DEFAULT_SEED)),
            verb_registry(),
        )
        .with_publisher(Box::new(publisher));
        engine.run().unwrap();
        assert_eq!(outputs(&capture), vec!["PUT"]);

        let short = DataModel::new(DataElement::block(
            "req",
            vec![DataElement::string("verb").with_length_bytes(8)],
        ))
        .unwrap();
        let action = Action::output("send", "null", short).with_sample(b"PUT".to_vec());
        let mut engine = Engine::new(
            RunSettings::default(),
            StateModel::new("session", vec![action]).unwrap(),
            Box::new(SequentialStrategy::new(DEFAULT_SEED)),
            verb_registry(),
        )
        .with_publisher(Box::new(NullPublisher::new("null")));
        assert!(engine.run().unwrap_err().to_string().contains("does not crack"));
    }
}
