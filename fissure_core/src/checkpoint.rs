use crate::engine::{RunSettings, RunSummary};
use crate::fault::FaultRecord;
use crate::observer::RunObserver;
use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("checkpoint '{path}' is corrupt: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },
    #[error("checkpoint belongs to run '{found_run}' with seed {found_seed}, not '{run}' with seed {seed}")]
    Mismatch {
        run: String,
        seed: u64,
        found_run: String,
        found_seed: u64,
    },
}

/// A fault as far as resuming a run cares.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FaultMark {
    pub iteration: u64,
    pub bucket: String,
    pub digest: String,
}

/// Progress of a run, saved after every iteration.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Checkpoint {
    pub run_name: String,
    pub seed: u64,
    /// Last iteration that ran to completion.
    pub last_iteration: u64,
    pub faults: Vec<FaultMark>,
}

fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

impl Checkpoint {
    pub fn new(run_name: impl Into<String>, seed: u64) -> Self {
        Self {
            run_name: run_name.into(),
            seed,
            last_iteration: 0,
            faults: Vec::new(),
        }
    }

    /// The iteration a resumed run starts at.
    pub fn resume_from(&self) -> u64 {
        self.last_iteration + 1
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let bytes = std::fs::read(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let (checkpoint, _len): (Self, usize) =
            bincode::decode_from_slice(&bytes, bincode_config()).map_err(|source| CheckpointError::Decode {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(checkpoint)
    }

    /// Loads the checkpoint and checks it was written by the same run.
    pub fn load_for(path: &Path, run_name: &str, seed: u64) -> Result<Self, CheckpointError> {
        let checkpoint = Self::load(path)?;
        if checkpoint.run_name != run_name || checkpoint.seed != seed {
            return Err(CheckpointError::Mismatch {
                run: run_name.to_string(),
                seed,
                found_run: checkpoint.run_name,
                found_seed: checkpoint.seed,
            });
        }
        Ok(checkpoint)
    }

    /// Writes the checkpoint next to `path` and renames it into place, so a
    /// crash never leaves a torn file behind.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let io = |source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        };
        let bytes = bincode::encode_to_vec(self, bincode_config())?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io)?;
        file.write_all(&bytes).map_err(io)?;
        file.as_file().sync_all().map_err(io)?;
        file.persist(path).map_err(|e| io(e.error))?;
        Ok(())
    }
}

/// Saves a [`Checkpoint`] after every completed iteration.
pub struct CheckpointObserver {
    path: PathBuf,
    checkpoint: Checkpoint,
}

impl CheckpointObserver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            checkpoint: Checkpoint::new("", 0),
        }
    }

    /// Continues from an earlier checkpoint, keeping its faults.
    pub fn resuming(path: impl Into<PathBuf>, checkpoint: Checkpoint) -> Self {
        Self {
            path: path.into(),
            checkpoint,
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }
}

impl RunObserver for CheckpointObserver {
    fn run_starting(&mut self, settings: &RunSettings) -> Result<(), anyhow::Error> {
        if self.checkpoint.run_name != settings.run_name || self.checkpoint.seed != settings.seed {
            self.checkpoint = Checkpoint::new(settings.run_name.clone(), settings.seed);
        }
        Ok(())
    }

    fn iteration_finished(&mut self, iteration: u64) -> Result<(), anyhow::Error> {
        self.checkpoint.last_iteration = self.checkpoint.last_iteration.max(iteration);
        self.checkpoint.save(&self.path)?;
        debug!(iteration, path = %self.path.display(), "checkpoint saved");
        Ok(())
    }

    fn fault(&mut self, fault: &FaultRecord) -> Result<(), anyhow::Error> {
        self.checkpoint.faults.push(FaultMark {
            iteration: fault.iteration,
            bucket: fault.bucket.clone(),
            digest: fault.digest.clone(),
        });
        Ok(())
    }

    fn run_finished(&mut self, _summary: &RunSummary) -> Result<(), anyhow::Error> {
        if let Err(e) = self.checkpoint.save(&self.path) {
            warn!("final checkpoint not saved: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let mut checkpoint = Checkpoint::new("nightly", 7);
        checkpoint.last_iteration = 120;
        checkpoint.faults.push(FaultMark {
            iteration: 99,
            bucket: "signal_11".into(),
            digest: "00".into(),
        });
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load_for(&path, "nightly", 7).unwrap();
        assert_eq!(loaded, checkpoint);
        assert_eq!(loaded.resume_from(), 121);
        assert!(matches!(
            Checkpoint::load_for(&path, "nightly", 8),
            Err(CheckpointError::Mismatch { found_seed: 7, .. })
        ));
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ckpt");
        std::fs::write(&path, [1u8, 2]).unwrap();
        assert!(matches!(
            Checkpoint::load(&path),
            Err(CheckpointError::Decode { .. })
        ));
    }

    #[test]
    fn observer_tracks_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obs.ckpt");
        let mut observer = CheckpointObserver::new(&path);
        let settings = RunSettings {
            run_name: "r".into(),
            seed: 3,
            ..RunSettings::default()
        };
        observer.run_starting(&settings).unwrap();
        observer.iteration_finished(1).unwrap();
        observer
            .fault(&FaultRecord::new(2, Vec::new(), Vec::new(), None))
            .unwrap();
        observer.iteration_finished(2).unwrap();

        let saved = Checkpoint::load(&path).unwrap();
        assert_eq!(saved.run_name, "r");
        assert_eq!(saved.last_iteration, 2);
        assert_eq!(saved.faults.len(), 1);
        assert_eq!(saved.faults[0].bucket, "Unknown");
    }
}
