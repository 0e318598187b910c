//! Deployment log sink
//!
//! Everything the user sees about a deployment goes through [`DeploymentLog`]:
//! leveled lines, structured service messages the deployment server parses,
//! and raw stderr from the user's script. Internal diagnostics use `tracing`
//! instead; [`ConsoleLog`] mirrors every line there as well.

use std::fmt;
use std::io::Write;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Prefix of every service message line on stdout
pub const SERVICE_MESSAGE_PREFIX: &str = "##rudder";

/// Severity of a deployment log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Detail shown only when the user expands the log
    Verbose,
    /// Normal progress
    Info,
    /// Something the user should look at; the deployment continues
    Warn,
    /// A failure
    Error,
}

impl LogLevel {
    fn stream_marker(self) -> &'static str {
        match self {
            LogLevel::Verbose => "stdout-verbose",
            LogLevel::Info => "stdout-default",
            LogLevel::Warn => "stdout-warning",
            LogLevel::Error => "stdout-error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Verbose => "verbose",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// A structured message for the deployment server.
///
/// Properties keep their insertion order; each message type has a fixed key
/// set and consumers rely on the order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMessage {
    /// Message type tag (e.g. `k8s-status`, `kubernetes-target`)
    pub name: String,
    /// Ordered key/value properties
    pub properties: Vec<(String, String)>,
}

impl ServiceMessage {
    /// Start a message with no properties
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    /// Append a property
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Look up a property value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Property keys in order
    pub fn keys(&self) -> Vec<&str> {
        self.properties.iter().map(|(k, _)| k.as_str()).collect()
    }

    /// Encode as a single stdout line: `##rudder[name key='base64' ...]`.
    pub fn encode(&self) -> String {
        let mut line = format!("{}[{}", SERVICE_MESSAGE_PREFIX, self.name);
        for (key, value) in &self.properties {
            line.push(' ');
            line.push_str(key);
            line.push_str("='");
            line.push_str(&STANDARD.encode(value.as_bytes()));
            line.push('\'');
        }
        line.push(']');
        line
    }
}

/// Sink for everything the user sees about a deployment.
pub trait DeploymentLog: Send + Sync {
    /// Write one leveled line
    fn write(&self, level: LogLevel, message: &str);

    /// Publish a structured service message
    fn service_message(&self, message: &ServiceMessage);

    /// Forward a line the script wrote to stderr
    fn stderr(&self, line: &str);

    /// Write a verbose line
    fn verbose(&self, message: &str) {
        self.write(LogLevel::Verbose, message);
    }

    /// Write an info line
    fn info(&self, message: &str) {
        self.write(LogLevel::Info, message);
    }

    /// Write a warning line
    fn warn(&self, message: &str) {
        self.write(LogLevel::Warn, message);
    }

    /// Write an error line
    fn error(&self, message: &str) {
        self.write(LogLevel::Error, message);
    }

    /// Publish an output variable through a `setVariable` service message
    fn set_output_variable(&self, name: &str, value: &str) {
        self.service_message(
            &ServiceMessage::new("setVariable")
                .with("name", name)
                .with("value", value),
        );
    }
}

/// Deployment log writing to the process's stdout and stderr.
///
/// Non-info lines are wrapped in stream markers so the server can classify
/// them; info lines are written as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleLog;

impl ConsoleLog {
    /// Create a console log
    pub fn new() -> Self {
        Self
    }

    /// Render a leveled line exactly as written to stdout
    pub fn render(level: LogLevel, message: &str) -> String {
        match level {
            LogLevel::Info => message.to_string(),
            other => format!(
                "{prefix}[{}]\n{message}\n{prefix}[{}]",
                other.stream_marker(),
                LogLevel::Info.stream_marker(),
                prefix = SERVICE_MESSAGE_PREFIX,
            ),
        }
    }
}

impl DeploymentLog for ConsoleLog {
    fn write(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Verbose => tracing::debug!(target: "rudder::deployment", "{}", message),
            LogLevel::Info => tracing::info!(target: "rudder::deployment", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "rudder::deployment", "{}", message),
            LogLevel::Error => tracing::error!(target: "rudder::deployment", "{}", message),
        }
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", Self::render(level, message));
    }

    fn service_message(&self, message: &ServiceMessage) {
        tracing::debug!(
            target: "rudder::deployment",
            message_type = %message.name,
            properties = message.properties.len(),
            "Service message"
        );
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", message.encode());
    }

    fn stderr(&self, line: &str) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", line);
    }
}

#[cfg(any(test, feature = "testing"))]
pub use in_memory::InMemoryLog;

#[cfg(any(test, feature = "testing"))]
mod in_memory {
    use std::sync::{Mutex, PoisonError};

    use super::{DeploymentLog, LogLevel, ServiceMessage};

    #[derive(Debug, Default)]
    struct Recorded {
        lines: Vec<(LogLevel, String)>,
        service_messages: Vec<ServiceMessage>,
        stderr: Vec<String>,
    }

    /// Deployment log that records everything for assertions in tests.
    #[derive(Debug, Default)]
    pub struct InMemoryLog {
        recorded: Mutex<Recorded>,
    }

    impl InMemoryLog {
        /// Create an empty log
        pub fn new() -> Self {
            Self::default()
        }

        fn with<R>(&self, f: impl FnOnce(&mut Recorded) -> R) -> R {
            let mut guard = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        }

        /// All lines in write order
        pub fn lines(&self) -> Vec<(LogLevel, String)> {
            self.with(|r| r.lines.clone())
        }

        /// Lines written at one level
        pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
            self.with(|r| {
                r.lines
                    .iter()
                    .filter(|(l, _)| *l == level)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
        }

        /// All service messages in publish order
        pub fn service_messages(&self) -> Vec<ServiceMessage> {
            self.with(|r| r.service_messages.clone())
        }

        /// Service messages of one type
        pub fn service_messages_named(&self, name: &str) -> Vec<ServiceMessage> {
            self.with(|r| {
                r.service_messages
                    .iter()
                    .filter(|m| m.name == name)
                    .cloned()
                    .collect()
            })
        }

        /// Everything forwarded to stderr
        pub fn stderr_lines(&self) -> Vec<String> {
            self.with(|r| r.stderr.clone())
        }

        /// Whether any line at any level contains `needle`
        pub fn contains(&self, needle: &str) -> bool {
            self.with(|r| r.lines.iter().any(|(_, m)| m.contains(needle)))
        }
    }

    impl DeploymentLog for InMemoryLog {
        fn write(&self, level: LogLevel, message: &str) {
            self.with(|r| r.lines.push((level, message.to_string())));
        }

        fn service_message(&self, message: &ServiceMessage) {
            self.with(|r| r.service_messages.push(message.clone()));
        }

        fn stderr(&self, line: &str) {
            self.with(|r| r.stderr.push(line.to_string()));
        }
    }
}
