use crate::variant::Variant;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Data a monitor collected about a fault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorData {
    /// Name of the monitor that produced the data.
    pub monitor: String,
    pub title: String,
    pub description: String,
    /// Groups faults with the same cause, e.g. a signal or exit code.
    pub bucket: Option<String>,
    /// Named artifacts, written out as files.
    pub files: BTreeMap<String, Vec<u8>>,
}

/// Watches the target on behalf of an agent.
///
/// Every hook has a no-op default so monitors only implement what they use.
/// Hooks return `anyhow` errors the way observers do; the hosting agent turns
/// them into [`AgentError::Monitor`].
pub trait Monitor: Send {
    fn name(&self) -> &str;

    fn session_starting(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn iteration_starting(&mut self, _iteration: u64, _is_reproduction: bool) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn iteration_finished(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn detected_fault(&mut self) -> Result<bool, anyhow::Error> {
        Ok(false)
    }

    /// Data describing the fault of the last iteration. Only asked for after
    /// some monitor reported a fault.
    fn monitor_data(&mut self) -> Result<Option<MonitorData>, anyhow::Error> {
        Ok(None)
    }

    fn message(&mut self, _name: &str, _data: &Variant) -> Result<Option<Variant>, anyhow::Error> {
        Ok(None)
    }

    fn session_finished(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn stop_monitor(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// True when the run cannot continue.
    fn must_stop(&mut self) -> Result<bool, anyhow::Error> {
        Ok(false)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent '{agent}' did not answer {operation} within {timeout:?}")]
    Timeout {
        agent: String,
        operation: &'static str,
        timeout: Duration,
    },
    #[error("agent '{agent}' is disconnected")]
    Disconnected { agent: String },
    #[error("monitor '{monitor}' on agent '{agent}' failed: {message}")]
    Monitor {
        agent: String,
        monitor: String,
        message: String,
    },
}

/// The nine operations the engine performs on an agent.
pub trait Agent: Send {
    fn name(&self) -> &str;
    fn session_starting(&mut self) -> Result<(), AgentError>;
    fn iteration_starting(&mut self, iteration: u64, is_reproduction: bool) -> Result<(), AgentError>;
    fn iteration_finished(&mut self) -> Result<(), AgentError>;
    fn detected_fault(&mut self) -> Result<bool, AgentError>;
    fn monitor_data(&mut self) -> Result<Vec<MonitorData>, AgentError>;
    fn message(&mut self, name: &str, data: &Variant) -> Result<Option<Variant>, AgentError>;
    fn session_finished(&mut self) -> Result<(), AgentError>;
    fn stop_monitor(&mut self) -> Result<(), AgentError>;
    fn must_stop(&mut self) -> Result<bool, AgentError>;
}

/// Hosts monitors in the engine's own process.
pub struct LocalAgent {
    name: String,
    monitors: Vec<Box<dyn Monitor>>,
}

impl LocalAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            monitors: Vec::new(),
        }
    }

    pub fn with_monitor(mut self, monitor: Box<dyn Monitor>) -> Self {
        self.monitors.push(monitor);
        self
    }

    pub fn add_monitor(&mut self, monitor: Box<dyn Monitor>) {
        self.monitors.push(monitor);
    }

    pub fn monitor_names(&self) -> Vec<String> {
        self.monitors.iter().map(|m| m.name().to_string()).collect()
    }

    fn wrap(&self, monitor: &dyn Monitor, error: anyhow::Error) -> AgentError {
        AgentError::Monitor {
            agent: self.name.clone(),
            monitor: monitor.name().to_string(),
            message: format!("{error:#}"),
        }
    }

    /// Runs `op` on every monitor, first to last or last to first, stopping at
    /// the first error.
    fn each<T>(
        &mut self,
        reverse: bool,
        mut op: impl FnMut(&mut dyn Monitor) -> Result<T, anyhow::Error>,
    ) -> Result<Vec<T>, AgentError> {
        let mut monitors = std::mem::take(&mut self.monitors);
        let order: Vec<usize> = if reverse {
            (0..monitors.len()).rev().collect()
        } else {
            (0..monitors.len()).collect()
        };
        let mut results = Vec::with_capacity(monitors.len());
        let mut failure = None;
        for index in order {
            let monitor = monitors[index].as_mut();
            match op(monitor) {
                Ok(value) => results.push(value),
                Err(e) => {
                    failure = Some(self.wrap(monitor, e));
                    break;
                }
            }
        }
        self.monitors = monitors;
        match failure {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

impl Agent for LocalAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn session_starting(&mut self) -> Result<(), AgentError> {
        self.each(false, |m| m.session_starting()).map(drop)
    }

    fn iteration_starting(&mut self, iteration: u64, is_reproduction: bool) -> Result<(), AgentError> {
        self.each(false, |m| m.iteration_starting(iteration, is_reproduction))
            .map(drop)
    }

    fn iteration_finished(&mut self) -> Result<(), AgentError> {
        self.each(true, |m| m.iteration_finished()).map(drop)
    }

    fn detected_fault(&mut self) -> Result<bool, AgentError> {
        // Every monitor is asked, even after one reported a fault.
        Ok(self.each(false, |m| m.detected_fault())?.into_iter().any(|f| f))
    }

    fn monitor_data(&mut self) -> Result<Vec<MonitorData>, AgentError> {
        Ok(self
            .each(false, |m| m.monitor_data())?
            .into_iter()
            .flatten()
            .collect())
    }

    fn message(&mut self, name: &str, data: &Variant) -> Result<Option<Variant>, AgentError> {
        Ok(self
            .each(false, |m| m.message(name, data))?
            .into_iter()
            .flatten()
            .last())
    }

    fn session_finished(&mut self) -> Result<(), AgentError> {
        self.each(true, |m| m.session_finished()).map(drop)
    }

    fn stop_monitor(&mut self) -> Result<(), AgentError> {
        self.each(true, |m| m.stop_monitor()).map(drop)
    }

    fn must_stop(&mut self) -> Result<bool, AgentError> {
        Ok(self.each(false, |m| m.must_stop())?.into_iter().any(|f| f))
    }
}

/// Fans every operation out to all agents of a run.
#[derive(Default)]
pub struct AgentManager {
    agents: Vec<Box<dyn Agent>>,
}

impl AgentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, agent: Box<dyn Agent>) {
        debug!(agent = agent.name(), "agent connected");
        self.agents.push(agent);
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn session_starting(&mut self) -> Result<(), AgentError> {
        trace!("session starting");
        for agent in &mut self.agents {
            agent.session_starting()?;
        }
        Ok(())
    }

    pub fn iteration_starting(&mut self, iteration: u64, is_reproduction: bool) -> Result<(), AgentError> {
        for agent in &mut self.agents {
            agent.iteration_starting(iteration, is_reproduction)?;
        }
        Ok(())
    }

    pub fn iteration_finished(&mut self) -> Result<(), AgentError> {
        for agent in self.agents.iter_mut().rev() {
            agent.iteration_finished()?;
        }
        Ok(())
    }

    pub fn detected_fault(&mut self) -> Result<bool, AgentError> {
        let mut detected = false;
        for agent in &mut self.agents {
            if agent.detected_fault()? {
                detected = true;
            }
        }
        trace!(detected, "detected fault");
        Ok(detected)
    }

    /// Monitor data of every agent, in agent order.
    pub fn monitor_data(&mut self) -> Result<Vec<MonitorData>, AgentError> {
        let mut data = Vec::new();
        for agent in &mut self.agents {
            data.extend(agent.monitor_data()?);
        }
        Ok(data)
    }

    /// Sends a message to every agent; the last answer wins.
    pub fn message(&mut self, name: &str, data: &Variant) -> Result<Option<Variant>, AgentError> {
        let mut answer = None;
        for agent in &mut self.agents {
            if let Some(reply) = agent.message(name, data)? {
                answer = Some(reply);
            }
        }
        Ok(answer)
    }

    pub fn must_stop(&mut self) -> Result<bool, AgentError> {
        let mut stop = false;
        for agent in &mut self.agents {
            if agent.must_stop()? {
                stop = true;
            }
        }
        Ok(stop)
    }

    /// Ends the session on every agent, last to first. Errors are logged and
    /// returned, but never stop the remaining agents from being told.
    pub fn session_finished(&mut self) -> Vec<AgentError> {
        let mut errors = Vec::new();
        for agent in self.agents.iter_mut().rev() {
            if let Err(e) = agent.session_finished() {
                warn!("ignoring error from session finished: {e}");
                errors.push(e);
            }
        }
        errors
    }

    /// Stops the monitors of every agent, last to first, best effort.
    pub fn stop_all_monitors(&mut self) -> Vec<AgentError> {
        let mut errors = Vec::new();
        for agent in self.agents.iter_mut().rev() {
            if let Err(e) = agent.stop_monitor() {
                warn!("ignoring error from stop monitor: {e}");
                errors.push(e);
            }
        }
        errors
    }
}
