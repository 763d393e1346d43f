use crate::variant::Variant;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublisherError {
    /// The current iteration is lost; the run goes on.
    #[error("{0}")]
    Soft(String),
    /// The publisher cannot be used any more.
    #[error("{0}")]
    Fatal(String),
    #[error("publisher '{publisher}' does not support {operation}")]
    Unsupported {
        publisher: String,
        operation: &'static str,
    },
}

/// Aborts whatever a publisher is blocked on. Called from the watchdog thread.
pub type Interrupter = Arc<dyn Fn() + Send + Sync>;

/// How the last run of a command target ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub interrupted: bool,
    pub stderr: Vec<u8>,
}

impl ExitRecord {
    /// True when the target ended on its own with a non-zero status.
    pub fn is_crash(&self) -> bool {
        if self.timed_out || self.interrupted {
            return false;
        }
        self.signal.is_some() || self.code.is_some_and(|code| code != 0)
    }

    pub fn describe(&self) -> String {
        if self.timed_out {
            "timed out".to_string()
        } else if self.interrupted {
            "interrupted".to_string()
        } else if let Some(signal) = self.signal {
            format!("terminated by signal {signal}")
        } else if let Some(code) = self.code {
            format!("exited with code {code}")
        } else {
            "exited abnormally".to_string()
        }
    }
}

/// Shared view of the last [`ExitRecord`] a command publisher produced.
pub type ExitStatusSlot = Arc<Mutex<Option<ExitRecord>>>;

/// The transport between the engine and the target.
///
/// Every operation but `output` has a default: lifecycle hooks succeed and do
/// nothing, `input` and `call` are unsupported.
pub trait Publisher: Send {
    fn name(&self) -> &str;

    /// Called once when the session starts.
    fn start(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    /// Called once when the session ends.
    fn stop(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    fn open(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    fn output(&mut self, data: &[u8]) -> Result<(), PublisherError>;

    fn input(&mut self, _max_size: usize) -> Result<Vec<u8>, PublisherError> {
        Err(PublisherError::Unsupported {
            publisher: self.name().to_string(),
            operation: "input",
        })
    }

    fn call(&mut self, _method: &str, _args: &[Variant]) -> Result<Option<Variant>, PublisherError> {
        Err(PublisherError::Unsupported {
            publisher: self.name().to_string(),
            operation: "call",
        })
    }

    /// A handle that aborts a blocking operation of this publisher.
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }

    /// Where the publisher reports how its target exited, if it runs one.
    fn exit_status(&self) -> Option<ExitStatusSlot> {
        None
    }
}

/// Everything the null publisher was asked to send, shared with its creator.
pub type Capture = Arc<Mutex<Vec<Vec<u8>>>>;

/// Discards output and returns no input.
#[derive(Debug, Default)]
pub struct NullPublisher {
    name: String,
    capture: Option<Capture>,
}

impl NullPublisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capture: None,
        }
    }

    /// A null publisher that keeps every output in the returned buffer.
    pub fn capturing(name: impl Into<String>) -> (Self, Capture) {
        let capture = Capture::default();
        let publisher = Self {
            name: name.into(),
            capture: Some(capture.clone()),
        };
        (publisher, capture)
    }
}

impl Publisher for NullPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn output(&mut self, data: &[u8]) -> Result<(), PublisherError> {
        if let Some(capture) = &self.capture {
            capture
                .lock()
                .map_err(|_| PublisherError::Fatal("capture buffer poisoned".to_string()))?
                .push(data.to_vec());
        }
        Ok(())
    }

    fn input(&mut self, _max_size: usize) -> Result<Vec<u8>, PublisherError> {
        Ok(Vec::new())
    }

    fn call(&mut self, _method: &str, _args: &[Variant]) -> Result<Option<Variant>, PublisherError> {
        Ok(None)
    }
}

/// Writes output to a file, truncating it on every open.
#[derive(Debug)]
pub struct FilePublisher {
    name: String,
    path: PathBuf,
    append: bool,
    file: Option<File>,
}

impl FilePublisher {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            append: false,
            file: None,
        }
    }

    pub fn appending(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn ensure_open(&mut self) -> Result<&mut File, PublisherError> {
        if self.file.is_none() {
            self.open()?;
        }
        self.file
            .as_mut()
            .ok_or_else(|| PublisherError::Fatal(format!("{} is not open", self.path.display())))
    }
}

impl Publisher for FilePublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), PublisherError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&self.path)
            .map_err(|e| {
                PublisherError::Fatal(format!("cannot open {}: {e}", self.path.display()))
            })?;
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) -> Result<(), PublisherError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .map_err(|e| PublisherError::Soft(format!("flush {}: {e}", self.path.display())))?;
        }
        Ok(())
    }

    fn output(&mut self, data: &[u8]) -> Result<(), PublisherError> {
        let path = self.path.display().to_string();
        self.ensure_open()?
            .write_all(data)
            .map_err(|e| PublisherError::Soft(format!("write {path}: {e}")))
    }

    /// Reads up to `max_size` bytes from the start of the file.
    fn input(&mut self, max_size: usize) -> Result<Vec<u8>, PublisherError> {
        let path = self.path.display().to_string();
        let file = self.ensure_open()?;
        file.rewind()
            .map_err(|e| PublisherError::Soft(format!("seek {path}: {e}")))?;
        let mut data = Vec::new();
        file.take(max_size as u64)
            .read_to_end(&mut data)
            .map_err(|e| PublisherError::Soft(format!("read {path}: {e}")))?;
        Ok(data)
    }

    fn stop(&mut self) -> Result<(), PublisherError> {
        self.close()
    }
}

/// How a command target receives its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputDelivery {
    StdIn,
    /// Written to a temporary file whose path replaces `{}` in the template,
    /// which is appended to the arguments.
    File(String),
}

#[derive(Debug, Clone)]
pub struct CommandPublisherConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub timeout: Option<Duration>,
    pub working_dir: Option<PathBuf>,
}

/// Runs a target command once per `output`, delivering the data on stdin or
/// through a temporary file, and records how it exited.
pub struct CommandPublisher {
    name: String,
    config: CommandPublisherConfig,
    child: Arc<Mutex<Option<Child>>>,
    interrupted: Arc<AtomicBool>,
    exit_status: ExitStatusSlot,
}

impl fmt::Debug for CommandPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPublisher")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl CommandPublisher {
    pub fn new(name: impl Into<String>, config: CommandPublisherConfig) -> Self {
        Self {
            name: name.into(),
            config,
            child: Arc::new(Mutex::new(None)),
            interrupted: Arc::new(AtomicBool::new(false)),
            exit_status: ExitStatusSlot::default(),
        }
    }

    fn spawn(&self, data: &[u8]) -> Result<(Child, Option<tempfile::NamedTempFile>, File), PublisherError> {
        let program = self
            .config
            .command
            .first()
            .ok_or_else(|| PublisherError::Fatal("command publisher has no command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(&self.config.command[1..]);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }

        let mut input_file = None;
        match &self.config.input_delivery {
            InputDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
            }
            InputDelivery::File(template) => {
                let mut file = tempfile::NamedTempFile::new()
                    .map_err(|e| PublisherError::Soft(format!("failed to create temp file: {e}")))?;
                file.write_all(data)
                    .and_then(|_| file.flush())
                    .map_err(|e| PublisherError::Soft(format!("failed to write temp file: {e}")))?;
                let path = file
                    .path()
                    .to_str()
                    .ok_or_else(|| PublisherError::Soft("temp file path is not valid UTF-8".to_string()))?
                    .to_string();
                for part in template.replace("{}", &path).split_whitespace() {
                    cmd.arg(part);
                }
                cmd.stdin(Stdio::null());
                input_file = Some(file);
            }
        }

        let stderr = tempfile::tempfile()
            .map_err(|e| PublisherError::Soft(format!("failed to create stderr capture: {e}")))?;
        let stderr_handle = stderr
            .try_clone()
            .map_err(|e| PublisherError::Soft(format!("failed to clone stderr capture: {e}")))?;
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::from(stderr_handle));

        let child = cmd.spawn().map_err(|e| {
            PublisherError::Fatal(format!("failed to spawn command {:?}: {e}", self.config.command))
        })?;
        Ok((child, input_file, stderr))
    }

    /// Polls the child until it exits, the timeout passes or it is
    /// interrupted. The child stays in the shared slot so the interrupter can
    /// reach it.
    fn wait(&self) -> Result<ExitRecord, PublisherError> {
        let start = Instant::now();
        loop {
            {
                let mut guard = self
                    .child
                    .lock()
                    .map_err(|_| PublisherError::Fatal("child slot poisoned".to_string()))?;
                let Some(child) = guard.as_mut() else {
                    return Err(PublisherError::Fatal("child process went missing".to_string()));
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        guard.take();
                        let mut record = ExitRecord {
                            code: status.code(),
                            interrupted: self.interrupted.load(Ordering::SeqCst),
                            ..ExitRecord::default()
                        };
                        #[cfg(unix)]
                        {
                            use std::os::unix::process::ExitStatusExt;
                            record.signal = status.signal();
                        }
                        return Ok(record);
                    }
                    Ok(None) => {
                        if self.config.timeout.is_some_and(|limit| start.elapsed() > limit) {
                            warn!(publisher = %self.name, "target timed out, killing");
                            let _ = child.kill();
                            let _ = child.wait();
                            guard.take();
                            return Ok(ExitRecord {
                                timed_out: true,
                                ..ExitRecord::default()
                            });
                        }
                    }
                    Err(e) => {
                        guard.take();
                        return Err(PublisherError::Soft(format!("error waiting for target: {e}")));
                    }
                }
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

impl Publisher for CommandPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn output(&mut self, data: &[u8]) -> Result<(), PublisherError> {
        self.interrupted.store(false, Ordering::SeqCst);
        let (mut child, input_file, mut stderr) = self.spawn(data)?;

        let stdin = child.stdin.take();
        *self
            .child
            .lock()
            .map_err(|_| PublisherError::Fatal("child slot poisoned".to_string()))? = Some(child);
        if let Some(mut stdin) = stdin {
            if let Err(e) = stdin.write_all(data) {
                debug!(publisher = %self.name, "target closed stdin early: {e}");
            }
        }

        let mut record = self.wait()?;
        drop(input_file);

        let mut captured = Vec::new();
        if stderr.rewind().and_then(|_| stderr.read_to_end(&mut captured)).is_ok() {
            record.stderr = captured;
        }
        debug!(publisher = %self.name, status = %record.describe(), "target finished");

        let timed_out = record.timed_out;
        let interrupted = record.interrupted;
        *self
            .exit_status
            .lock()
            .map_err(|_| PublisherError::Fatal("exit status slot poisoned".to_string()))? = Some(record);

        if timed_out {
            return Err(PublisherError::Soft("target timed out".to_string()));
        }
        if interrupted {
            return Err(PublisherError::Soft("target was interrupted".to_string()));
        }
        Ok(())
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let child = self.child.clone();
        let interrupted = self.interrupted.clone();
        Some(Arc::new(move || {
            interrupted.store(true, Ordering::SeqCst);
            if let Ok(mut guard) = child.lock() {
                if let Some(child) = guard.as_mut() {
                    let _ = child.kill();
                }
            }
        }))
    }

    fn exit_status(&self) -> Option<ExitStatusSlot> {
        Some(self.exit_status.clone())
    }

    fn stop(&mut self) -> Result<(), PublisherError> {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        Ok(())
    }
}

impl Drop for CommandPublisher {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[derive(Debug, Clone)]
pub struct TcpPublisherConfig {
    pub host: String,
    pub port: u16,
    /// Limit for connecting and for waiting on input.
    pub timeout: Duration,
    pub connect_attempts: u32,
}

/// A TCP client. Connects on `open` (or the first `output`), sends output as
/// is and reads whatever the peer sends back on `input`.
pub struct TcpPublisher {
    name: String,
    config: TcpPublisherConfig,
    stream: Option<TcpStream>,
    /// A clone of `stream` the interrupter shuts down.
    shared: Arc<Mutex<Option<TcpStream>>>,
}

impl fmt::Debug for TcpPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPublisher")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}

impl TcpPublisher {
    pub fn new(name: impl Into<String>, config: TcpPublisherConfig) -> Self {
        Self {
            name: name.into(),
            config,
            stream: None,
            shared: Arc::new(Mutex::new(None)),
        }
    }

    fn connect_once(&self) -> Result<TcpStream, std::io::Error> {
        let mut last = None;
        for addr in (self.config.host.as_str(), self.config.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.config.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| {
            std::io::Error::new(ErrorKind::NotFound, format!("'{}' resolves to nothing", self.config.host))
        }))
    }

    fn connect(&mut self) -> Result<(), PublisherError> {
        let attempts = self.config.connect_attempts.max(1);
        let mut attempt = 1;
        let stream = loop {
            match self.connect_once() {
                Ok(stream) => break stream,
                Err(e) if attempt < attempts => {
                    warn!(
                        publisher = %self.name,
                        host = %self.config.host,
                        port = self.config.port,
                        attempt,
                        "cannot connect, trying again: {e}"
                    );
                    attempt += 1;
                    std::thread::sleep(CONNECT_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(PublisherError::Soft(format!(
                        "cannot connect to {}:{}: {e}",
                        self.config.host, self.config.port
                    )));
                }
            }
        };
        stream
            .set_read_timeout(Some(self.config.timeout))
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|e| PublisherError::Soft(format!("cannot configure socket: {e}")))?;
        let clone = stream
            .try_clone()
            .map_err(|e| PublisherError::Soft(format!("cannot clone socket: {e}")))?;
        *self
            .shared
            .lock()
            .map_err(|_| PublisherError::Fatal("socket slot poisoned".to_string()))? = Some(clone);
        debug!(publisher = %self.name, host = %self.config.host, port = self.config.port, "connected");
        self.stream = Some(stream);
        Ok(())
    }

    fn ensure_connected(&mut self) -> Result<&mut TcpStream, PublisherError> {
        if self.stream.is_none() {
            self.connect()?;
        }
        self.stream
            .as_mut()
            .ok_or_else(|| PublisherError::Fatal(format!("{} is not connected", self.name)))
    }
}

impl Publisher for TcpPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), PublisherError> {
        self.close()?;
        self.connect()
    }

    fn close(&mut self) -> Result<(), PublisherError> {
        if let Ok(mut shared) = self.shared.lock() {
            shared.take();
        }
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone.
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    fn output(&mut self, data: &[u8]) -> Result<(), PublisherError> {
        let name = self.name.clone();
        let stream = self.ensure_connected()?;
        if let Err(e) = stream.write_all(data).and_then(|_| stream.flush()) {
            self.close()?;
            return Err(PublisherError::Soft(format!("{name}: send failed: {e}")));
        }
        Ok(())
    }

    /// Reads what is available, up to `max_size` bytes. An orderly shutdown by
    /// the peer reads as no data.
    fn input(&mut self, max_size: usize) -> Result<Vec<u8>, PublisherError> {
        let name = self.name.clone();
        let stream = self.ensure_connected()?;
        let mut data = vec![0; max_size];
        match stream.read(&mut data) {
            Ok(read) => {
                data.truncate(read);
                Ok(data)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(PublisherError::Soft(format!("{name}: timed out waiting for data")))
            }
            Err(e) => {
                self.close()?;
                Err(PublisherError::Soft(format!("{name}: receive failed: {e}")))
            }
        }
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let shared = self.shared.clone();
        Some(Arc::new(move || {
            if let Ok(guard) = shared.lock() {
                if let Some(stream) = guard.as_ref() {
                    let _ = stream.shutdown(Shutdown::Both);
                }
            }
        }))
    }

    fn stop(&mut self) -> Result<(), PublisherError> {
        self.close()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct FileParams {
    path: PathBuf,
    #[serde(default)]
    append: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum DeliveryParam {
    Stdin,
    File(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct CommandParams {
    command: Vec<String>,
    #[serde(default = "default_delivery")]
    delivery: DeliveryParam,
    timeout_ms: Option<u64>,
    working_dir: Option<PathBuf>,
}

fn default_delivery() -> DeliveryParam {
    DeliveryParam::Stdin
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct TcpParams {
    host: String,
    port: u16,
    #[serde(default = "default_tcp_timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "default_connect_attempts")]
    connect_attempts: u32,
}

fn default_tcp_timeout_ms() -> u64 {
    3000
}

fn default_connect_attempts() -> u32 {
    10
}

type PublisherCtor =
    Arc<dyn Fn(&str, &serde_json::Value) -> Result<Box<dyn Publisher>, PublisherError> + Send + Sync>;

/// Maps publisher kinds to constructors taking an instance name and JSON
/// parameters.
#[derive(Clone, Default)]
pub struct PublisherRegistry {
    constructors: BTreeMap<String, PublisherCtor>,
}

impl fmt::Debug for PublisherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    kind: &str,
    params: &serde_json::Value,
) -> Result<T, PublisherError> {
    serde_json::from_value(params.clone())
        .map_err(|e| PublisherError::Fatal(format!("invalid parameters for {kind} publisher: {e}")))
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `null`, `file`, `command` and `tcp` publishers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("null", |name, _| Ok(Box::new(NullPublisher::new(name))));
        registry.register("file", |name, params| {
            let params: FileParams = parse_params("file", params)?;
            Ok(Box::new(
                FilePublisher::new(name, params.path).appending(params.append),
            ))
        });
        registry.register("command", |name, params| {
            let params: CommandParams = parse_params("command", params)?;
            let input_delivery = match params.delivery {
                DeliveryParam::Stdin => InputDelivery::StdIn,
                DeliveryParam::File(template) => InputDelivery::File(template),
            };
            Ok(Box::new(CommandPublisher::new(
                name,
                CommandPublisherConfig {
                    command: params.command,
                    input_delivery,
                    timeout: params.timeout_ms.map(Duration::from_millis),
                    working_dir: params.working_dir,
                },
            )))
        });
        registry.register("tcp", |name, params| {
            let params: TcpParams = parse_params("tcp", params)?;
            Ok(Box::new(TcpPublisher::new(
                name,
                TcpPublisherConfig {
                    host: params.host,
                    port: params.port,
                    timeout: Duration::from_millis(params.timeout_ms),
                    connect_attempts: params.connect_attempts,
                },
            )))
        });
        registry
    }

    pub fn register(
        &mut self,
        kind: impl Into<String>,
        ctor: impl Fn(&str, &serde_json::Value) -> Result<Box<dyn Publisher>, PublisherError>
        + Send
        + Sync
        + 'static,
    ) {
        self.constructors.insert(kind.into(), Arc::new(ctor));
    }

    pub fn create(
        &self,
        kind: &str,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<Box<dyn Publisher>, PublisherError> {
        let ctor = self
            .constructors
            .get(kind)
            .ok_or_else(|| PublisherError::Fatal(format!("unknown publisher kind '{kind}'")))?;
        ctor(name, params)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}
