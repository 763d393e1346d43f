use crate::engine::{DEFAULT_SEED, RunSettings, Shard, TimeoutPolicy};
use crate::mutator::{MutatorError, MutatorRegistry};
use crate::strategy::{MutationStrategy, RandomStrategy, SequentialStrategy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default = "default_run_name")]
    pub name: String,
    /// Format description to fuzz.
    pub pit: PathBuf,
    #[serde(default)]
    pub skip_to: Option<u64>,
    /// Inclusive `[first, last]` iteration range.
    #[serde(default)]
    pub range: Option<[u64; 2]>,
    #[serde(default)]
    pub shard: Option<ShardConfig>,
    #[serde(default)]
    pub single_iteration: bool,
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub debug: bool,
}

fn default_run_name() -> String {
    "fissure".to_string()
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ShardConfig {
    pub count: u64,
    pub index: u64,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    Sequential,
    Random,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    #[serde(default)]
    pub kind: StrategyKind,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Never end the run: sequential wraps around, random has no limit.
    #[serde(default)]
    pub continuous: bool,
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::default(),
            seed: default_seed(),
            continuous: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutPolicyConfig {
    #[default]
    Fatal,
    Soft,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default = "default_agent_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub timeout_policy: TimeoutPolicyConfig,
}

fn default_agent_timeout_ms() -> u64 {
    10_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_agent_timeout_ms(),
            timeout_policy: TimeoutPolicyConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutatorsConfig {
    /// Mutators to enable; empty enables every registered one.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default = "default_excluded_mutators")]
    pub exclude: Vec<String>,
}

fn default_excluded_mutators() -> Vec<String> {
    vec!["RandomBytes".to_string()]
}

impl Default for MutatorsConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: default_excluded_mutators(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_fault_dir")]
    pub fault_dir: PathBuf,
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

fn default_fault_dir() -> PathBuf {
    PathBuf::from("./fissure_faults")
}

fn default_progress_interval() -> u64 {
    100
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            fault_dir: default_fault_dir(),
            checkpoint: None,
            progress_interval: default_progress_interval(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FissureConfig {
    pub run: RunConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub mutators: MutatorsConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl FissureConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let mut config: FissureConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        if config.run.pit.is_relative() {
            if let Some(dir) = path.parent() {
                config.run.pit = dir.join(&config.run.pit);
            }
        }
        Ok(config)
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            run_name: self.run.name.clone(),
            seed: self.strategy.seed,
            skip_to: self.run.skip_to,
            range: self.run.range.map(|[first, last]| (first, last)),
            shard: self.run.shard.map(|s| Shard {
                count: s.count,
                index: s.index,
            }),
            single_iteration: self.run.single_iteration,
            max_iterations: self.run.max_iterations,
            agent_timeout_policy: match self.agent.timeout_policy {
                TimeoutPolicyConfig::Fatal => TimeoutPolicy::Fatal,
                TimeoutPolicyConfig::Soft => TimeoutPolicy::Soft,
            },
        }
    }

    pub fn strategy(&self) -> Box<dyn MutationStrategy> {
        let seed = self.strategy.seed;
        match self.strategy.kind {
            StrategyKind::Sequential => Box::new(SequentialStrategy::new(seed).continuous(self.strategy.continuous)),
            StrategyKind::Random => {
                let limit = if self.strategy.continuous {
                    None
                } else {
                    self.run.max_iterations
                };
                Box::new(RandomStrategy::new(seed, limit))
            }
        }
    }

    /// The built-in mutators, narrowed by the include and exclude lists.
    pub fn mutator_registry(&self) -> Result<MutatorRegistry, MutatorError> {
        let mut registry = MutatorRegistry::with_builtins();
        registry.filter(&self.mutators.include, &self.mutators.exclude)?;
        Ok(registry)
    }
}
