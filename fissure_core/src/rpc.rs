//! Synchronous request/response access to an agent that runs elsewhere.
//!
//! [`RpcAgent`] turns every [`Agent`] operation into an [`AgentRequest`] sent
//! over an [`AgentTransport`] and waits, bounded by a timeout, for the
//! matching [`AgentResponse`]. [`spawn_agent_host`] runs a [`LocalAgent`] on
//! its own thread behind a channel transport.

use crate::agent::{Agent, AgentError, LocalAgent, MonitorData};
use crate::variant::Variant;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum AgentRequest {
    SessionStarting,
    IterationStarting { iteration: u64, is_reproduction: bool },
    IterationFinished,
    DetectedFault,
    MonitorData,
    Message { name: String, data: Variant },
    SessionFinished,
    StopMonitor,
    MustStop,
    Shutdown,
}

impl AgentRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            AgentRequest::SessionStarting => "SessionStarting",
            AgentRequest::IterationStarting { .. } => "IterationStarting",
            AgentRequest::IterationFinished => "IterationFinished",
            AgentRequest::DetectedFault => "DetectedFault",
            AgentRequest::MonitorData => "GetMonitorData",
            AgentRequest::Message { .. } => "Message",
            AgentRequest::SessionFinished => "SessionFinished",
            AgentRequest::StopMonitor => "StopMonitor",
            AgentRequest::MustStop => "MustStop",
            AgentRequest::Shutdown => "Shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentResponse {
    Done,
    Flag(bool),
    Data(Vec<MonitorData>),
    Reply(Option<Variant>),
    Failed(AgentError),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("no response before the deadline")]
    Timeout,
    #[error("the agent host is gone")]
    Disconnected,
}

const HOST_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Carries one request to an agent host and brings back its response.
pub trait AgentTransport: Send {
    fn request(&mut self, request: AgentRequest, timeout: Duration) -> Result<AgentResponse, TransportError>;
}

/// Channel pair to an [`AgentHost`]. Requests are tagged with a sequence
/// number so an answer that arrives after its deadline is never mistaken for
/// the answer to a later request.
pub struct ChannelTransport {
    requests: Sender<(u64, AgentRequest)>,
    responses: Receiver<(u64, AgentResponse)>,
    next_sequence: u64,
}

impl AgentTransport for ChannelTransport {
    fn request(&mut self, request: AgentRequest, timeout: Duration) -> Result<AgentResponse, TransportError> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.requests
            .send((sequence, request))
            .map_err(|_| TransportError::Disconnected)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok((seq, response)) if seq == sequence => return Ok(response),
                Ok((seq, _)) => trace!(seq, expected = sequence, "dropping stale agent response"),
                Err(RecvTimeoutError::Timeout) => return Err(TransportError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Disconnected),
            }
        }
    }
}

/// The thread serving a [`LocalAgent`]. Dropping the host asks the thread to
/// stop and joins it.
pub struct AgentHost {
    name: String,
    requests: Sender<(u64, AgentRequest)>,
    thread: Option<JoinHandle<()>>,
}

impl AgentHost {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the host thread and waits for it.
    pub fn shutdown(mut self) {
        self.stop(None);
    }

    /// Stops the host thread, waiting at most `limit`. A thread still busy
    /// in a monitor after that is detached and left to finish on its own.
    /// Returns whether the thread was joined.
    pub fn shutdown_within(mut self, limit: Duration) -> bool {
        self.stop(Some(limit))
    }

    fn stop(&mut self, limit: Option<Duration>) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        let _ = self.requests.send((u64::MAX, AgentRequest::Shutdown));
        if let Some(limit) = limit {
            let deadline = Instant::now() + limit;
            while !thread.is_finished() {
                if Instant::now() >= deadline {
                    warn!(agent = %self.name, ?limit, "agent host did not stop in time, detaching it");
                    return false;
                }
                std::thread::sleep(HOST_POLL_INTERVAL.min(limit));
            }
        }
        if thread.join().is_err() {
            warn!(agent = %self.name, "agent host thread panicked");
        }
        true
    }
}

impl Drop for AgentHost {
    fn drop(&mut self) {
        self.stop(None);
    }
}

/// Runs `agent` on a dedicated thread and returns the transport that talks to
/// it together with the host guard.
pub fn spawn_agent_host(mut agent: LocalAgent) -> (ChannelTransport, AgentHost) {
    let (request_tx, request_rx) = mpsc::channel::<(u64, AgentRequest)>();
    let (response_tx, response_rx) = mpsc::channel::<(u64, AgentResponse)>();
    let name = agent.name().to_string();

    let thread = std::thread::spawn(move || {
        debug!(agent = agent.name(), "agent host started");
        while let Ok((sequence, request)) = request_rx.recv() {
            if request == AgentRequest::Shutdown {
                break;
            }
            let response = serve(&mut agent, request);
            if response_tx.send((sequence, response)).is_err() {
                break;
            }
        }
        debug!(agent = agent.name(), "agent host stopped");
    });

    let transport = ChannelTransport {
        requests: request_tx.clone(),
        responses: response_rx,
        next_sequence: 0,
    };
    let host = AgentHost {
        name,
        requests: request_tx,
        thread: Some(thread),
    };
    (transport, host)
}

fn serve(agent: &mut dyn Agent, request: AgentRequest) -> AgentResponse {
    let outcome = match request {
        AgentRequest::SessionStarting => agent.session_starting().map(|_| AgentResponse::Done),
        AgentRequest::IterationStarting {
            iteration,
            is_reproduction,
        } => agent
            .iteration_starting(iteration, is_reproduction)
            .map(|_| AgentResponse::Done),
        AgentRequest::IterationFinished => agent.iteration_finished().map(|_| AgentResponse::Done),
        AgentRequest::DetectedFault => agent.detected_fault().map(AgentResponse::Flag),
        AgentRequest::MonitorData => agent.monitor_data().map(AgentResponse::Data),
        AgentRequest::Message { name, data } => agent.message(&name, &data).map(AgentResponse::Reply),
        AgentRequest::SessionFinished => agent.session_finished().map(|_| AgentResponse::Done),
        AgentRequest::StopMonitor => agent.stop_monitor().map(|_| AgentResponse::Done),
        AgentRequest::MustStop => agent.must_stop().map(AgentResponse::Flag),
        AgentRequest::Shutdown => Ok(AgentResponse::Done),
    };
    outcome.unwrap_or_else(AgentResponse::Failed)
}

/// An [`Agent`] reached through an [`AgentTransport`].
pub struct RpcAgent {
    name: String,
    timeout: Duration,
    transport: Box<dyn AgentTransport>,
    host: Option<AgentHost>,
}

impl RpcAgent {
    pub fn new(name: impl Into<String>, transport: Box<dyn AgentTransport>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
            transport,
            host: None,
        }
    }

    /// Hosts `agent` on its own thread and connects to it.
    pub fn threaded(agent: LocalAgent, timeout: Duration) -> Self {
        let name = agent.name().to_string();
        let (transport, host) = spawn_agent_host(agent);
        Self {
            name,
            timeout,
            transport: Box::new(transport),
            host: Some(host),
        }
    }

    fn send(&mut self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let operation = request.operation();
        trace!(agent = %self.name, operation, "agent request");
        match self.transport.request(request, self.timeout) {
            Ok(AgentResponse::Failed(error)) => Err(error),
            Ok(response) => Ok(response),
            Err(TransportError::Timeout) => Err(AgentError::Timeout {
                agent: self.name.clone(),
                operation,
                timeout: self.timeout,
            }),
            Err(TransportError::Disconnected) => Err(AgentError::Disconnected {
                agent: self.name.clone(),
            }),
        }
    }

    fn expect_done(&mut self, request: AgentRequest) -> Result<(), AgentError> {
        match self.send(request)? {
            AgentResponse::Done => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    fn expect_flag(&mut self, request: AgentRequest) -> Result<bool, AgentError> {
        match self.send(request)? {
            AgentResponse::Flag(flag) => Ok(flag),
            other => Err(self.unexpected(other)),
        }
    }

    fn unexpected(&self, response: AgentResponse) -> AgentError {
        warn!(agent = %self.name, ?response, "unexpected agent response");
        AgentError::Disconnected {
            agent: self.name.clone(),
        }
    }
}

impl Agent for RpcAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn session_starting(&mut self) -> Result<(), AgentError> {
        self.expect_done(AgentRequest::SessionStarting)
    }

    fn iteration_starting(&mut self, iteration: u64, is_reproduction: bool) -> Result<(), AgentError> {
        self.expect_done(AgentRequest::IterationStarting {
            iteration,
            is_reproduction,
        })
    }

    fn iteration_finished(&mut self) -> Result<(), AgentError> {
        self.expect_done(AgentRequest::IterationFinished)
    }

    fn detected_fault(&mut self) -> Result<bool, AgentError> {
        self.expect_flag(AgentRequest::DetectedFault)
    }

    fn monitor_data(&mut self) -> Result<Vec<MonitorData>, AgentError> {
        match self.send(AgentRequest::MonitorData)? {
            AgentResponse::Data(data) => Ok(data),
            other => Err(self.unexpected(other)),
        }
    }

    fn message(&mut self, name: &str, data: &Variant) -> Result<Option<Variant>, AgentError> {
        let request = AgentRequest::Message {
            name: name.to_string(),
            data: data.clone(),
        };
        match self.send(request)? {
            AgentResponse::Reply(reply) => Ok(reply),
            other => Err(self.unexpected(other)),
        }
    }

    fn session_finished(&mut self) -> Result<(), AgentError> {
        self.expect_done(AgentRequest::SessionFinished)
    }

    fn stop_monitor(&mut self) -> Result<(), AgentError> {
        self.expect_done(AgentRequest::StopMonitor)
    }

    fn must_stop(&mut self) -> Result<bool, AgentError> {
        self.expect_flag(AgentRequest::MustStop)
    }
}

impl Drop for RpcAgent {
    fn drop(&mut self) {
        if let Some(host) = self.host.take() {
            host.shutdown_within(self.timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Monitor;
    use crate::agent::test_utils::ScriptedMonitor;
    use std::sync::{Arc, Mutex};

    struct Sleepy {
        delay: Duration,
    }

    impl Monitor for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn iteration_starting(&mut self, _iteration: u64, _is_reproduction: bool) -> Result<(), anyhow::Error> {
            std::thread::sleep(self.delay);
            Ok(())
        }

        fn must_stop(&mut self) -> Result<bool, anyhow::Error> {
            Ok(true)
        }
    }

    #[test]
    fn threaded_agent_forwards_operations() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut monitor = ScriptedMonitor::new("remote", log.clone());
        monitor.fault_on = vec![2];
        let local = LocalAgent::new("host").with_monitor(Box::new(monitor));
        let mut agent = RpcAgent::threaded(local, Duration::from_secs(5));

        agent.session_starting().unwrap();
        agent.iteration_starting(2, true).unwrap();
        assert_eq!(
            agent.message("Action.Starting", &Variant::from("send")).unwrap(),
            None
        );
        assert!(agent.detected_fault().unwrap());
        let data = agent.monitor_data().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].monitor, "remote");
        assert!(!agent.must_stop().unwrap());
        drop(agent);

        let log = log.lock().unwrap();
        assert_eq!(log[0], "remote:session_starting");
        assert_eq!(log[1], "remote:iteration_starting(2,true)");
        assert_eq!(log[2], "remote:message(Action.Starting,\"send\")");
    }

    #[test]
    fn slow_monitor_times_out_and_late_answer_is_discarded() {
        let local = LocalAgent::new("slow").with_monitor(Box::new(Sleepy {
            delay: Duration::from_millis(300),
        }));
        let mut agent = RpcAgent::threaded(local, Duration::from_millis(50));
        let err = agent.iteration_starting(1, false).unwrap_err();
        assert!(matches!(
            err,
            AgentError::Timeout {
                operation: "IterationStarting",
                ..
            }
        ));

        // The late Done for the timed out request must not answer this one.
        let mut patient = agent;
        patient.timeout = Duration::from_secs(5);
        assert!(patient.must_stop().unwrap());
    }

    #[test]
    fn drop_after_timeout_does_not_wait_for_a_hung_monitor() {
        let local = LocalAgent::new("hung").with_monitor(Box::new(Sleepy {
            delay: Duration::from_secs(3),
        }));
        let mut agent = RpcAgent::threaded(local, Duration::from_millis(50));
        assert!(agent.iteration_starting(1, false).is_err());

        let started = Instant::now();
        drop(agent);
        assert!(started.elapsed() < Duration::from_secs(1), "drop took {:?}", started.elapsed());
    }

    #[test]
    fn idle_host_is_joined_within_the_limit() {
        let (_transport, host) = spawn_agent_host(LocalAgent::new("idle"));
        assert!(host.shutdown_within(Duration::from_secs(5)));
    }

    #[test]
    fn monitor_failure_crosses_the_channel() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut monitor = ScriptedMonitor::new("broken", log);
        monitor.fail_on_iteration = Some(7);
        let local = LocalAgent::new("host").with_monitor(Box::new(monitor));
        let mut agent = RpcAgent::threaded(local, Duration::from_secs(5));
        let err = agent.iteration_starting(7, false).unwrap_err();
        assert!(matches!(err, AgentError::Monitor { ref monitor, .. } if monitor == "broken"));
    }

    #[test]
    fn stopped_host_reports_disconnected() {
        let (transport, host) = spawn_agent_host(LocalAgent::new("gone"));
        host.shutdown();
        let mut agent = RpcAgent::new("gone", Box::new(transport), Duration::from_millis(100));
        assert_eq!(
            agent.session_starting().unwrap_err(),
            AgentError::Disconnected {
                agent: "gone".to_string()
            }
        );
    }
}
