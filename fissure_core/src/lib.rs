pub mod agent;
pub mod bitstream;
pub mod checkpoint;
pub mod config;
pub mod cracker;
pub mod element;
pub mod engine;
pub mod fault;
pub mod fixup;
pub mod generate;
pub mod model;
pub mod monitor;
pub mod mutator;
pub mod observer;
pub mod pit;
pub mod publisher;
pub mod relation;
pub mod rpc;
pub mod state;
pub mod strategy;
pub mod variant;
pub mod watchdog;

pub use agent::{Agent, AgentError, AgentManager, LocalAgent, Monitor, MonitorData};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointObserver};
pub use config::FissureConfig;
pub use cracker::{CrackError, CrackObserver, CrackReport, Cracker};
pub use element::{DataElement, ElementKind};
pub use engine::{CancelToken, Engine, EngineError, RunSettings, RunSummary, StopReason};
pub use fault::{FaultDirectoryWriter, FaultRecord};
pub use fixup::{Fixup, FixupStore, SequenceIncrement};
pub use model::{DataModel, ModelError};
pub use mutator::{Mutator, MutatorError, MutatorRegistry};
pub use observer::{ProgressObserver, RunObserver};
pub use pit::{Pit, PitError, PitFile};
pub use publisher::{Publisher, PublisherError, PublisherRegistry};
pub use relation::Relation;
pub use rpc::RpcAgent;
pub use state::{Action, ActionKind, StateModel};
pub use strategy::{MutationStrategy, RandomStrategy, SequentialStrategy, StrategyError};
pub use variant::Variant;
