use fissure_core::checkpoint::{Checkpoint, CheckpointObserver};
use fissure_core::config::{FissureConfig, ShardConfig};
use fissure_core::cracker::{CrackObserver, Cracker};
use fissure_core::element::{DataElement, ElementKind, Span};
use fissure_core::engine::Engine;
use fissure_core::fault::FaultDirectoryWriter;
use fissure_core::observer::ProgressObserver;
use fissure_core::pit::PitFile;
use fissure_core::publisher::PublisherRegistry;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, trace, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[clap(long, global = true)]
    debug: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fuzz the target described by a run configuration.
    Fuzz {
        #[clap(short, long, value_parser, default_value = "fissure.toml")]
        config: PathBuf,
        #[clap(long)]
        seed: Option<u64>,
        #[clap(long)]
        skip_to: Option<u64>,
        /// Inclusive iteration range, e.g. `10..20`.
        #[clap(long, value_parser = parse_range)]
        range: Option<[u64; 2]>,
        /// Run every `count`-th iteration starting at `index`, e.g. `4/1`.
        #[clap(long, value_parser = parse_shard)]
        shard: Option<ShardConfig>,
        /// Run only the unmutated first iteration.
        #[clap(long)]
        single: bool,
        #[clap(long)]
        max_iterations: Option<u64>,
        /// Continue after the last iteration recorded in the checkpoint.
        #[clap(long)]
        resume: bool,
    },
    /// Crack a sample against one data model and print the resulting tree.
    Crack {
        #[clap(short, long, value_parser)]
        pit: PathBuf,
        /// Data model to crack with; defaults to the only one in the pit.
        #[clap(short, long)]
        model: Option<String>,
        #[clap(value_parser)]
        sample: PathBuf,
        /// Log every element the cracker enters and leaves.
        #[clap(long)]
        trace: bool,
    },
}

fn parse_range(text: &str) -> Result<[u64; 2], String> {
    let (first, last) = text
        .split_once("..")
        .ok_or_else(|| format!("expected FIRST..LAST, got '{text}'"))?;
    let first = first.trim().parse::<u64>().map_err(|e| e.to_string())?;
    let last = last.trim().parse::<u64>().map_err(|e| e.to_string())?;
    Ok([first, last])
}

fn parse_shard(text: &str) -> Result<ShardConfig, String> {
    let (count, index) = text
        .split_once('/')
        .ok_or_else(|| format!("expected COUNT/INDEX, got '{text}'"))?;
    Ok(ShardConfig {
        count: count.trim().parse().map_err(|e: std::num::ParseIntError| e.to_string())?,
        index: index.trim().parse().map_err(|e: std::num::ParseIntError| e.to_string())?,
    })
}

fn init_logging(debug: bool, trace_crack: bool) {
    let default = if trace_crack {
        "fissure_core=trace,fissure_cli=trace"
    } else if debug {
        "fissure_core=debug,fissure_cli=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Logs the cracker's walk over the tree.
struct CrackTrace;

impl CrackObserver for CrackTrace {
    fn enter_element(&mut self, path: &str, kind: ElementKind, position_bits: u64) {
        trace!(path, %kind, byte = position_bits / 8, "enter");
    }

    fn exit_element(&mut self, path: &str, span: Option<Span>) {
        match span {
            Some(span) => trace!(path, offset = span.byte_offset(), len = span.byte_len(), "exit"),
            None => trace!(path, "failed"),
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    match cli.command {
        Command::Fuzz {
            config,
            seed,
            skip_to,
            range,
            shard,
            single,
            max_iterations,
            resume,
        } => {
            let mut config = FissureConfig::load_from_file(&config)?;
            init_logging(cli.debug || config.run.debug, false);

            if let Some(seed) = seed {
                config.strategy.seed = seed;
            }
            if skip_to.is_some() {
                config.run.skip_to = skip_to;
            }
            if range.is_some() {
                config.run.range = range;
            }
            if shard.is_some() {
                config.run.shard = shard;
            }
            if max_iterations.is_some() {
                config.run.max_iterations = max_iterations;
            }
            config.run.single_iteration |= single;
            fuzz(config, resume)
        }
        Command::Crack {
            pit,
            model,
            sample,
            trace,
        } => {
            init_logging(cli.debug, trace);
            crack(&pit, model.as_deref(), &sample, trace)
        }
    }
}

fn fuzz(config: FissureConfig, resume: bool) -> Result<(), anyhow::Error> {
    let mut settings = config.run_settings();

    let checkpoint_observer = match (&config.output.checkpoint, resume) {
        (Some(path), true) if path.exists() => {
            let checkpoint = Checkpoint::load_for(path, &settings.run_name, settings.seed)?;
            info!(
                "resuming '{}' from iteration {}",
                checkpoint.run_name,
                checkpoint.resume_from()
            );
            settings.skip_to = Some(checkpoint.resume_from());
            Some(CheckpointObserver::resuming(path, checkpoint))
        }
        (Some(path), resume) => {
            if resume {
                warn!(path = %path.display(), "no checkpoint to resume from, starting fresh");
            }
            Some(CheckpointObserver::new(path))
        }
        (None, true) => anyhow::bail!("--resume needs `checkpoint` set in the [output] section"),
        (None, false) => None,
    };

    let pit_file = PitFile::load(&config.run.pit)?;
    let base_dir = config.run.pit.parent().unwrap_or_else(|| Path::new("."));
    let pit = pit_file.build(base_dir, &PublisherRegistry::with_builtins(), config.agent.timeout())?;
    let registry = config.mutator_registry()?;
    info!(
        pit = %config.run.pit.display(),
        state_model = pit.state_model.name(),
        mutators = registry.len(),
        "format description loaded"
    );

    let mut engine = Engine::new(settings, pit.state_model, config.strategy(), registry)
        .with_observer(Box::new(ProgressObserver::new(config.output.progress_interval)))
        .with_observer(Box::new(FaultDirectoryWriter::new(&config.output.fault_dir)));
    if let Some(observer) = checkpoint_observer {
        engine = engine.with_observer(Box::new(observer));
    }
    for publisher in pit.publishers {
        engine.add_publisher(publisher);
    }
    for agent in pit.agents {
        engine = engine.with_agent(agent);
    }

    let summary = engine.run().context("fuzzing run failed")?;
    println!(
        "{} iterations, {} faults, {} soft errors ({:?})",
        summary.iterations, summary.faults, summary.soft_errors, summary.stop
    );
    if summary.faults > 0 {
        println!("faults written to {}", config.output.fault_dir.display());
    }
    Ok(())
}

fn crack(pit: &Path, model: Option<&str>, sample: &Path, trace: bool) -> Result<(), anyhow::Error> {
    let mut models = PitFile::load(pit)?.data_models()?;
    let name = match model {
        Some(name) => name.to_string(),
        None if models.len() == 1 => models.keys().next().cloned().unwrap_or_default(),
        None => anyhow::bail!(
            "the pit has {} data models, pick one with --model: {}",
            models.len(),
            models.keys().cloned().collect::<Vec<_>>().join(", ")
        ),
    };
    let mut model = models
        .remove(&name)
        .ok_or_else(|| anyhow::anyhow!("no data model named '{name}'"))?;
    let data = std::fs::read(sample)
        .map_err(|e| anyhow::anyhow!("Failed to read sample {:?}: {}", sample, e))?;

    let mut cracker = Cracker::new();
    if trace {
        cracker.add_observer(Box::new(CrackTrace));
    }
    let report = match cracker.crack(&mut model, &data) {
        Ok(report) => report,
        Err(e) => {
            match e.byte_offset() {
                Some(offset) => eprintln!("crack failed at '{}', byte {offset}", e.path()),
                None => eprintln!("crack failed at '{}'", e.path()),
            }
            return Err(e.into());
        }
    };

    model.walk(&mut |path: &str, element: &DataElement| {
        let depth = path.matches('.').count();
        let span = element
            .span()
            .map(|s| format!("@{}+{}", s.byte_offset(), s.byte_len()))
            .unwrap_or_else(|| "-".to_string());
        if element.is_container() {
            println!("{:indent$}{} {} {span}", "", element.name(), element.kind(), indent = depth * 2);
        } else {
            println!(
                "{:indent$}{} {} {span} = {}",
                "",
                element.name(),
                element.kind(),
                element.value(),
                indent = depth * 2
            );
        }
    });
    println!("{} of {} bytes consumed", data.len() as u64 - report.unread_bytes(), data.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_and_shard_arguments() {
        assert_eq!(parse_range("10..20").unwrap(), [10, 20]);
        assert!(parse_range("10-20").is_err());
        let shard = parse_shard("4/1").unwrap();
        assert_eq!((shard.count, shard.index), (4, 1));
        assert!(parse_shard("4/x").is_err());
    }

    #[test]
    fn fuzz_overrides_parse() {
        let cli = Cli::parse_from(["fissure", "fuzz", "-c", "run.toml", "--range", "2..9", "--single"]);
        match cli.command {
            Command::Fuzz {
                config, range, single, ..
            } => {
                assert_eq!(config, PathBuf::from("run.toml"));
                assert_eq!(range, Some([2, 9]));
                assert!(single);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
