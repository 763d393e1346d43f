use crate::model::DataModel;
use crate::mutator::{MutatorError, MutatorFactory, MutatorRegistry};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while recording or applying mutations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    /// Sequential enumeration needs every mutator to have a finite candidate
    /// count.
    #[error("mutator '{mutator}' on '{element}' is unbounded and cannot be enumerated sequentially")]
    Unbounded { mutator: String, element: String },
    /// A mutation was requested before any data model was recorded.
    #[error("no data model has been recorded")]
    NotRecorded,
    #[error("mutation failed: {0}")]
    Mutator(#[from] MutatorError),
}

/// One applicable (element, mutator) pair found while recording.
#[derive(Debug, Clone)]
pub struct RecordedPair {
    pub action: usize,
    pub element: String,
    pub factory: MutatorFactory,
    /// Candidate count of the mutator created for the element; `None` when
    /// unbounded.
    pub count: Option<u64>,
}

/// The mutation an iteration performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Index into [`Recording::pairs`].
    pub pair: usize,
    pub action: usize,
    pub element: String,
    pub mutator: String,
    pub candidate: u64,
}

/// Everything a strategy learned during its recording pass.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    pairs: Vec<RecordedPair>,
    /// Running total of bounded candidate counts; `ends[i]` is one past the
    /// last flat candidate index belonging to pair `i`.
    ends: Vec<u64>,
    recording: bool,
    finished: bool,
}

impl Recording {
    fn begin(&mut self) {
        *self = Recording {
            recording: true,
            ..Recording::default()
        };
    }

    /// Walks every reachable element of `model` in declared order and notes
    /// each registered mutator that applies to it.
    fn record(&mut self, action: usize, model: &DataModel, registry: &MutatorRegistry) {
        if !self.recording {
            warn!(action, "record called outside of a recording pass, ignoring");
            return;
        }
        let mut found = Vec::new();
        model.walk(&mut |path, element| {
            for factory in registry.applicable(element) {
                let count = factory.create(element).count();
                found.push(RecordedPair {
                    action,
                    element: path.to_string(),
                    factory: factory.clone(),
                    count,
                });
            }
        });
        debug!(action, model = model.name(), pairs = found.len(), "recorded data model");
        self.pairs.extend(found);
    }

    fn finish(&mut self) {
        let mut total = 0u64;
        self.ends = self
            .pairs
            .iter()
            .map(|pair| {
                total = total.saturating_add(pair.count.unwrap_or(0));
                total
            })
            .collect();
        self.recording = false;
        self.finished = true;
    }

    pub fn pairs(&self) -> &[RecordedPair] {
        &self.pairs
    }

    /// Sum of all bounded candidate counts.
    pub fn total_candidates(&self) -> u64 {
        self.ends.last().copied().unwrap_or(0)
    }

    fn selection(&self, pair: usize, candidate: u64) -> Selection {
        let recorded = &self.pairs[pair];
        Selection {
            pair,
            action: recorded.action,
            element: recorded.element.clone(),
            mutator: recorded.factory.name().to_string(),
            candidate,
        }
    }

    /// Maps a flat candidate index onto its pair and per-pair candidate.
    fn locate(&self, flat: u64) -> Option<Selection> {
        let pair = self.ends.partition_point(|end| *end <= flat);
        if pair >= self.pairs.len() {
            return None;
        }
        let start = if pair == 0 { 0 } else { self.ends[pair - 1] };
        Some(self.selection(pair, flat - start))
    }
}

/// A per-iteration RNG. Selection draws from stream 0 and mutators from stream
/// 1, so the two never disturb each other.
pub fn iteration_rng(seed: u64, iteration: u64, stream: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(iteration));
    rng.set_stream(stream);
    rng
}

/// A `MutationStrategy` decides which single mutation each iteration performs.
///
/// A session has two phases. Iteration 1 runs the unmodified data models and
/// records, for every element reachable from every action's data model, the
/// registered mutators that apply to it. From iteration 2 on, [`select`]
/// picks one (element, mutator, candidate) triple and [`apply`] writes that
/// candidate into the element right before its action runs.
///
/// Selection is a pure function of the iteration number and the seed, which is
/// what lets a run skip ahead, run a range, or be split into shards.
///
/// [`select`]: MutationStrategy::select
/// [`apply`]: MutationStrategy::apply
pub trait MutationStrategy: Send {
    fn name(&self) -> &str;

    fn seed(&self) -> u64;

    fn recording(&self) -> &Recording;

    fn recording_mut(&mut self) -> &mut Recording;

    /// Number of iterations in the run, including the recording iteration.
    /// `None` means the run only ends when stopped.
    fn total_iterations(&self) -> Option<u64>;

    /// Checks the finished recording; called once by [`finish_recording`].
    ///
    /// [`finish_recording`]: MutationStrategy::finish_recording
    fn validate(&self) -> Result<(), StrategyError> {
        Ok(())
    }

    /// The mutation iteration `iteration` performs, if any. Iteration 1 and
    /// iterations past the end of the run perform none.
    fn select(&self, iteration: u64) -> Option<Selection>;

    /// Starts a recording pass, discarding anything recorded before.
    fn begin_recording(&mut self) {
        self.recording_mut().begin();
    }

    fn record(&mut self, action: usize, model: &DataModel, registry: &MutatorRegistry) {
        self.recording_mut().record(action, model, registry);
    }

    /// Ends the recording pass.
    ///
    /// # Errors
    /// Returns an error when the recorded pairs cannot be used by this
    /// strategy, such as an unbounded mutator under sequential enumeration.
    fn finish_recording(&mut self) -> Result<(), StrategyError> {
        self.recording_mut().finish();
        self.validate()?;
        info!(
            strategy = self.name(),
            pairs = self.recording().pairs().len(),
            candidates = self.recording().total_candidates(),
            "recording finished"
        );
        Ok(())
    }

    fn is_recorded(&self) -> bool {
        self.recording().finished
    }

    /// Applies the selection of `iteration` to `model` when it belongs to
    /// `action`. Returns the applied selection.
    fn apply(
        &self,
        iteration: u64,
        action: usize,
        model: &mut DataModel,
    ) -> Result<Option<Selection>, StrategyError> {
        if !self.is_recorded() {
            return Err(StrategyError::NotRecorded);
        }
        let Some(selection) = self.select(iteration) else {
            return Ok(None);
        };
        if selection.action != action {
            return Ok(None);
        }
        let Some(element) = model.find_mut(&selection.element) else {
            warn!(
                element = %selection.element,
                iteration,
                "selected element is missing from the data model"
            );
            return Ok(None);
        };
        let pair = &self.recording().pairs()[selection.pair];
        let mut mutator = pair.factory.create(element);
        mutator.seek(selection.candidate)?;
        let mut rng = iteration_rng(self.seed(), iteration, 1);
        mutator.apply(element, &mut rng)?;
        debug!(
            iteration,
            element = %selection.element,
            mutator = %selection.mutator,
            candidate = selection.candidate,
            "applied mutation"
        );
        Ok(Some(selection))
    }
}

/// Exhausts every candidate of one element's mutator before moving to the
/// next, in recording order.
#[derive(Debug, Clone)]
pub struct SequentialStrategy {
    seed: u64,
    continuous: bool,
    recording: Recording,
}

impl SequentialStrategy {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            continuous: false,
            recording: Recording::default(),
        }
    }

    /// Wraps around to the first candidate instead of ending the run.
    pub fn continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }
}

impl MutationStrategy for SequentialStrategy {
    fn name(&self) -> &str {
        "Sequential"
    }

    fn seed(&self) -> u64 {
        self.seed
    }

    fn recording(&self) -> &Recording {
        &self.recording
    }

    fn recording_mut(&mut self) -> &mut Recording {
        &mut self.recording
    }

    fn total_iterations(&self) -> Option<u64> {
        if self.continuous {
            None
        } else {
            Some(1 + self.recording.total_candidates())
        }
    }

    fn validate(&self) -> Result<(), StrategyError> {
        match self.recording.pairs().iter().find(|pair| pair.count.is_none()) {
            Some(pair) => Err(StrategyError::Unbounded {
                mutator: pair.factory.name().to_string(),
                element: pair.element.clone(),
            }),
            None => Ok(()),
        }
    }

    fn select(&self, iteration: u64) -> Option<Selection> {
        let total = self.recording.total_candidates();
        if iteration < 2 || total == 0 {
            return None;
        }
        let mut flat = iteration - 2;
        if self.continuous {
            flat %= total;
        }
        self.recording.locate(flat)
    }
}

/// Draws the pair and candidate of every iteration from an RNG seeded by the
/// run seed and the iteration number.
#[derive(Debug, Clone)]
pub struct RandomStrategy {
    seed: u64,
    max_iterations: Option<u64>,
    recording: Recording,
}

impl RandomStrategy {
    /// `max_iterations` bounds the run; `None` runs until stopped.
    pub fn new(seed: u64, max_iterations: Option<u64>) -> Self {
        Self {
            seed,
            max_iterations,
            recording: Recording::default(),
        }
    }

    fn usable_pairs(&self) -> Vec<usize> {
        self.recording
            .pairs()
            .iter()
            .enumerate()
            .filter(|(_, pair)| pair.count != Some(0))
            .map(|(index, _)| index)
            .collect()
    }
}

impl MutationStrategy for RandomStrategy {
    fn name(&self) -> &str {
        "Random"
    }

    fn seed(&self) -> u64 {
        self.seed
    }

    fn recording(&self) -> &Recording {
        &self.recording
    }

    fn recording_mut(&mut self) -> &mut Recording {
        &mut self.recording
    }

    fn total_iterations(&self) -> Option<u64> {
        self.max_iterations
    }

    fn select(&self, iteration: u64) -> Option<Selection> {
        if iteration < 2 || self.max_iterations.is_some_and(|max| iteration > max) {
            return None;
        }
        let usable = self.usable_pairs();
        if usable.is_empty() {
            return None;
        }
        let mut rng = iteration_rng(self.seed, iteration, 0);
        let pair = usable[rng.random_range(0..usable.len())];
        let candidate = match self.recording.pairs()[pair].count {
            Some(count) => rng.random_range(0..count),
            None => 0,
        };
        Some(self.recording.selection(pair, candidate))
    }
}
