use crate::agent::{Monitor, MonitorData};
use crate::publisher::{ExitRecord, ExitStatusSlot};
use crate::variant::Variant;
use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::process::{Child, Command, ExitStatus, Stdio};
use tracing::{debug, trace, warn};

/// Message name the engine sends before a `call` action, with the method as
/// data.
pub const ACTION_CALL: &str = "Action.Call";

/// Bucket key for an exit record: the signal, else the exit code.
pub fn exit_bucket(record: &ExitRecord) -> String {
    if let Some(signal) = record.signal {
        format!("signal_{signal}")
    } else if let Some(code) = record.code {
        format!("exit_{code}")
    } else {
        "exit_unknown".to_string()
    }
}

fn record_from_status(status: ExitStatus) -> ExitRecord {
    let mut record = ExitRecord {
        code: status.code(),
        ..ExitRecord::default()
    };
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        record.signal = status.signal();
    }
    record
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProcessMonitorConfig {
    /// Program and arguments.
    pub command: Vec<String>,
    /// Kill and relaunch the target before every iteration.
    #[serde(default)]
    pub restart_on_each_test: bool,
    /// Any exit of the target counts as a fault, not only crashes.
    #[serde(default)]
    pub fault_on_early_exit: bool,
    /// Launch the target only when a `call` action with this method runs.
    #[serde(default)]
    pub start_on_call: Option<String>,
    /// Wait for the target to exit when a `call` action with this method runs.
    #[serde(default)]
    pub wait_for_exit_on_call: Option<String>,
}

/// Launches the target process itself and watches it between iterations.
///
/// A crash (signal or non-zero exit) is always a fault; a clean exit is one
/// only with `fault_on_early_exit`. Faults are bucketed by signal or exit
/// code and carry the captured stderr.
pub struct ProcessMonitor {
    name: String,
    config: ProcessMonitorConfig,
    child: Option<Child>,
    stderr: Option<File>,
    exited: Option<ExitRecord>,
}

impl ProcessMonitor {
    pub fn new(name: impl Into<String>, config: ProcessMonitorConfig) -> Self {
        Self {
            name: name.into(),
            config,
            child: None,
            stderr: None,
            exited: None,
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.poll();
        self.child.is_some()
    }

    fn start(&mut self) -> Result<(), anyhow::Error> {
        if self.is_running() {
            trace!(monitor = %self.name, "process already running");
            return Ok(());
        }
        let (program, args) = self
            .config
            .command
            .split_first()
            .context("process monitor has no command")?;
        let stderr = tempfile::tempfile().context("failed to create stderr capture")?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr.try_clone()?))
            .spawn()
            .with_context(|| format!("failed to launch {:?}", self.config.command))?;
        debug!(monitor = %self.name, pid = child.id(), "process started");
        self.child = Some(child);
        self.stderr = Some(stderr);
        self.exited = None;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!(monitor = %self.name, pid = child.id(), "killing process");
            if let Err(e) = child.kill() {
                warn!(monitor = %self.name, "failed to kill process: {e}");
            }
            let _ = child.wait();
        }
    }

    /// Notices whether the child exited and keeps its exit record.
    fn poll(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut record = record_from_status(status);
                if let Some(stderr) = self.stderr.as_mut() {
                    let mut captured = Vec::new();
                    if stderr.rewind().and_then(|_| stderr.read_to_end(&mut captured)).is_ok() {
                        record.stderr = captured;
                    }
                }
                debug!(monitor = %self.name, status = %record.describe(), "process exited");
                self.exited = Some(record);
                self.child = None;
            }
            Ok(None) => {}
            Err(e) => warn!(monitor = %self.name, "cannot poll process: {e}"),
        }
    }

    fn faulted(&mut self) -> bool {
        self.poll();
        match &self.exited {
            Some(record) => record.is_crash() || self.config.fault_on_early_exit,
            None => false,
        }
    }
}

impl Monitor for ProcessMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn session_starting(&mut self) -> Result<(), anyhow::Error> {
        if self.config.start_on_call.is_none() && !self.config.restart_on_each_test {
            self.start()?;
        }
        Ok(())
    }

    fn iteration_starting(&mut self, _iteration: u64, _is_reproduction: bool) -> Result<(), anyhow::Error> {
        if self.config.restart_on_each_test {
            self.stop();
        }
        self.exited = None;
        if self.config.start_on_call.is_none() {
            self.start()?;
        }
        Ok(())
    }

    fn iteration_finished(&mut self) -> Result<(), anyhow::Error> {
        self.poll();
        if self.config.restart_on_each_test || self.config.start_on_call.is_some() {
            self.stop();
        }
        Ok(())
    }

    fn detected_fault(&mut self) -> Result<bool, anyhow::Error> {
        Ok(self.faulted())
    }

    fn monitor_data(&mut self) -> Result<Option<MonitorData>, anyhow::Error> {
        if !self.faulted() {
            return Ok(None);
        }
        let Some(record) = self.exited.as_ref() else {
            return Ok(None);
        };
        let command = self.config.command.join(" ");
        let mut files = BTreeMap::new();
        if !record.stderr.is_empty() {
            files.insert("stderr.txt".to_string(), record.stderr.clone());
        }
        Ok(Some(MonitorData {
            monitor: self.name.clone(),
            title: format!("process {}", record.describe()),
            description: format!("{command}: {}", record.describe()),
            bucket: Some(exit_bucket(record)),
            files,
        }))
    }

    fn message(&mut self, name: &str, data: &Variant) -> Result<Option<Variant>, anyhow::Error> {
        if name != ACTION_CALL {
            return Ok(None);
        }
        let Variant::Str(method) = data else {
            return Ok(None);
        };
        if self.config.start_on_call.as_ref() == Some(method) {
            self.stop();
            self.start()?;
        } else if self.config.wait_for_exit_on_call.as_ref() == Some(method) {
            if let Some(child) = self.child.as_mut() {
                let status = child.wait().context("failed to wait for process")?;
                self.exited = Some(record_from_status(status));
                self.child = None;
            }
        }
        Ok(None)
    }

    fn session_finished(&mut self) -> Result<(), anyhow::Error> {
        self.stop();
        Ok(())
    }

    fn stop_monitor(&mut self) -> Result<(), anyhow::Error> {
        self.stop();
        Ok(())
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reports crashes of a target that a command publisher runs, by reading the
/// exit status the publisher leaves behind.
pub struct ExitStatusMonitor {
    name: String,
    slot: ExitStatusSlot,
}

impl ExitStatusMonitor {
    pub fn new(name: impl Into<String>, slot: ExitStatusSlot) -> Self {
        Self {
            name: name.into(),
            slot,
        }
    }

    fn last_crash(&self) -> Result<Option<ExitRecord>, anyhow::Error> {
        let guard = self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("exit status slot poisoned"))?;
        Ok(guard.as_ref().filter(|record| record.is_crash()).cloned())
    }
}

impl Monitor for ExitStatusMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn iteration_starting(&mut self, _iteration: u64, _is_reproduction: bool) -> Result<(), anyhow::Error> {
        self.slot
            .lock()
            .map_err(|_| anyhow::anyhow!("exit status slot poisoned"))?
            .take();
        Ok(())
    }

    fn detected_fault(&mut self) -> Result<bool, anyhow::Error> {
        Ok(self.last_crash()?.is_some())
    }

    fn monitor_data(&mut self) -> Result<Option<MonitorData>, anyhow::Error> {
        let Some(record) = self.last_crash()? else {
            return Ok(None);
        };
        let mut files = BTreeMap::new();
        files.insert("stderr.txt".to_string(), record.stderr.clone());
        Ok(Some(MonitorData {
            monitor: self.name.clone(),
            title: format!("target {}", record.describe()),
            description: String::from_utf8_lossy(&record.stderr).into_owned(),
            bucket: Some(exit_bucket(&record)),
            files,
        }))
    }
}
