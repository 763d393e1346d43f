use crate::agent::MonitorData;
use crate::engine::RunSettings;
use crate::observer::RunObserver;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Bucket used when no monitor names one.
pub const UNKNOWN_BUCKET: &str = "Unknown";

#[derive(Error, Debug)]
pub enum FaultError {
    #[error("failed to write '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode fault summary: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The bytes one action produced during the faulting iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPayload {
    pub action: String,
    pub data: Vec<u8>,
}

/// Everything known about one fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRecord {
    pub iteration: u64,
    pub title: String,
    pub description: String,
    pub bucket: String,
    /// Monitors that contributed data, in report order.
    pub monitors: Vec<String>,
    /// The mutation the iteration performed, if any.
    pub mutation: Option<String>,
    pub payloads: Vec<ActionPayload>,
    /// md5 over every payload, in action order.
    pub digest: String,
    /// Artifacts of every monitor, merged.
    pub files: BTreeMap<String, Vec<u8>>,
}

impl FaultRecord {
    pub fn new(
        iteration: u64,
        data: Vec<MonitorData>,
        payloads: Vec<ActionPayload>,
        mutation: Option<String>,
    ) -> Self {
        let bucket = data
            .iter()
            .find_map(|d| d.bucket.clone())
            .unwrap_or_else(|| UNKNOWN_BUCKET.to_string());
        let title = data
            .iter()
            .map(|d| d.title.as_str())
            .find(|t| !t.is_empty())
            .unwrap_or("fault")
            .to_string();
        let description = data
            .iter()
            .filter(|d| !d.description.is_empty())
            .map(|d| format!("{}: {}", d.monitor, d.description))
            .collect::<Vec<_>>()
            .join("\n");

        let mut files = BTreeMap::new();
        let mut monitors = Vec::with_capacity(data.len());
        for item in data {
            for (key, bytes) in item.files {
                let key = if files.contains_key(&key) {
                    format!("{}_{key}", item.monitor)
                } else {
                    key
                };
                files.insert(key, bytes);
            }
            monitors.push(item.monitor);
        }

        let mut context = md5::Context::new();
        for payload in &payloads {
            context.consume(&payload.data);
        }
        let digest = format!("{:x}", context.compute());

        Self {
            iteration,
            title,
            description,
            bucket,
            monitors,
            mutation,
            payloads,
            digest,
            files,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct FaultSummary<'a> {
    run: &'a str,
    seed: u64,
    iteration: u64,
    title: &'a str,
    description: &'a str,
    bucket: &'a str,
    monitors: &'a [String],
    mutation: Option<&'a str>,
    digest: &'a str,
    actions: Vec<ActionSummary<'a>>,
    files: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ActionSummary<'a> {
    index: usize,
    name: &'a str,
    len: usize,
    md5: String,
}

/// Keeps a path component inside its parent directory.
fn path_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

/// File name for a monitor artifact. Names the writer itself produces get a
/// `monitor_` prefix so an artifact never replaces the summary or a payload.
fn artifact_name(key: &str) -> String {
    let name = path_component(key);
    if name == "fault.json" || name.starts_with("action_") || name.starts_with("monitor_") {
        format!("monitor_{name}")
    } else {
        name
    }
}

/// Writes faults as `<root>/<bucket>/<iteration>/` directories holding every
/// monitor artifact, every action payload and a `fault.json` summary.
#[derive(Debug, Clone)]
pub struct FaultDirectoryWriter {
    root: PathBuf,
    run: String,
    seed: u64,
}

impl FaultDirectoryWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run: String::new(),
            seed: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fault_dir(&self, fault: &FaultRecord) -> PathBuf {
        self.root
            .join(path_component(&fault.bucket))
            .join(fault.iteration.to_string())
    }

    pub fn write(&self, fault: &FaultRecord) -> Result<PathBuf, FaultError> {
        let dir = self.fault_dir(fault);
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| FaultError::Io { path, source }
        };
        fs::create_dir_all(&dir).map_err(io(&dir))?;

        let mut files = Vec::with_capacity(fault.files.len());
        for (key, bytes) in &fault.files {
            let name = artifact_name(key);
            let path = dir.join(&name);
            fs::write(&path, bytes).map_err(io(&path))?;
            files.push(name);
        }
        let mut actions = Vec::with_capacity(fault.payloads.len());
        for (index, payload) in fault.payloads.iter().enumerate() {
            let path = dir.join(format!("action_{index}_{}.bin", path_component(&payload.action)));
            fs::write(&path, &payload.data).map_err(io(&path))?;
            actions.push(ActionSummary {
                index,
                name: &payload.action,
                len: payload.data.len(),
                md5: format!("{:x}", md5::compute(&payload.data)),
            });
        }

        let summary = FaultSummary {
            run: &self.run,
            seed: self.seed,
            iteration: fault.iteration,
            title: &fault.title,
            description: &fault.description,
            bucket: &fault.bucket,
            monitors: &fault.monitors,
            mutation: fault.mutation.as_deref(),
            digest: &fault.digest,
            actions,
            files,
        };
        let path = dir.join("fault.json");
        fs::write(&path, serde_json::to_vec_pretty(&summary)?).map_err(io(&path))?;
        info!(bucket = %fault.bucket, iteration = fault.iteration, dir = %dir.display(), "fault written");
        Ok(dir)
    }
}

impl RunObserver for FaultDirectoryWriter {
    fn run_starting(&mut self, settings: &RunSettings) -> Result<(), anyhow::Error> {
        self.run = settings.run_name.clone();
        self.seed = settings.seed;
        Ok(())
    }

    fn fault(&mut self, fault: &FaultRecord) -> Result<(), anyhow::Error> {
        self.write(fault)?;
        Ok(())
    }
}
