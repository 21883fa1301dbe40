//! Leveled logging capability injected into clients and servers.
//!
//! Every [`Client`](crate::Client) and [`Server`](crate::Server) reports
//! through an `Arc<dyn Logger>`. Four sinks are provided:
//!
//! - [`Discard`] drops everything.
//! - [`Prefixed`] writes one line per message to any `Write` sink.
//! - [`Fanout`] duplicates messages to a changing set of loggers.
//! - [`Tracing`] forwards to the `tracing` ecosystem.

use std::io::Write;
use std::sync::{Arc, Mutex, RwLock};

/// Severity of a log message, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[non_exhaustive]
pub enum Level {
    /// Verbose diagnostics.
    #[default]
    Debug,
    /// Normal operation.
    Info,
    /// Something unexpected but recoverable.
    Warning,
    /// A failed operation.
    Error,
    /// The service itself is in trouble.
    Critical,
}

impl Level {
    /// All levels, least severe first.
    pub const ALL: [Self; 5] = [
        Self::Debug,
        Self::Info,
        Self::Warning,
        Self::Error,
        Self::Critical,
    ];

    /// Upper-case label used in default prefixes.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    /// Position in [`Level::ALL`].
    const fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        })
    }
}

impl std::str::FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("unknown log level: {s}")),
        }
    }
}

/// A leveled logging sink.
pub trait Logger: Send + Sync {
    /// Logs normal operation.
    fn info(&self, message: &str);
    /// Logs verbose diagnostics.
    fn debug(&self, message: &str);
    /// Logs a recoverable problem.
    fn warn(&self, message: &str);
    /// Logs a failed operation.
    fn error(&self, message: &str);
    /// Logs a service-level problem.
    fn critical(&self, message: &str);

    /// Logs at a runtime-selected level.
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Debug => self.debug(message),
            Level::Info => self.info(message),
            Level::Warning => self.warn(message),
            Level::Error => self.error(message),
            Level::Critical => self.critical(message),
        }
    }
}

impl<L: Logger + ?Sized> Logger for Arc<L> {
    fn info(&self, message: &str) {
        (**self).info(message);
    }

    fn debug(&self, message: &str) {
        (**self).debug(message);
    }

    fn warn(&self, message: &str) {
        (**self).warn(message);
    }

    fn error(&self, message: &str) {
        (**self).error(message);
    }

    fn critical(&self, message: &str) {
        (**self).critical(message);
    }
}

/// Logger that drops every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl Logger for Discard {
    fn info(&self, _: &str) {}
    fn debug(&self, _: &str) {}
    fn warn(&self, _: &str) {}
    fn error(&self, _: &str) {}
    fn critical(&self, _: &str) {}
}

/// Single-destination logger writing `"{prefix}{message}\n"` lines.
///
/// The default prefix is `"[{name}/LEVEL]: "` (or `"[LEVEL]: "` without a
/// name). Messages below the minimum level are dropped. Write errors are
/// ignored.
#[derive(Debug)]
pub struct Prefixed<W> {
    /// Destination, locked per line.
    sink: Mutex<W>,
    /// Messages below this level are dropped.
    min_level: Level,
    /// Logger name shown in default prefixes.
    name: Option<String>,
    /// Per-level prefix overrides, indexed by [`Level::index`].
    prefixes: [Option<String>; 5],
}

impl<W: Write + Send> Prefixed<W> {
    /// Creates a logger for `sink` that accepts every level.
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
            min_level: Level::Debug,
            name: None,
            prefixes: Default::default(),
        }
    }

    /// Sets the name shown in default prefixes.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the minimum level that reaches the sink.
    #[must_use]
    pub fn level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    /// Overrides the prefix for one level.
    #[must_use]
    pub fn prefix(mut self, level: Level, prefix: impl Into<String>) -> Self {
        self.prefixes[level.index()] = Some(prefix.into());
        self
    }

    /// Returns the prefix written before messages at `level`.
    pub fn prefix_for(&self, level: Level) -> String {
        if let Some(p) = &self.prefixes[level.index()] {
            return p.clone();
        }
        match &self.name {
            Some(name) => format!("[{name}/{}]: ", level.label()),
            None => format!("[{}]: ", level.label()),
        }
    }

    /// Consumes the logger and returns its sink.
    pub fn into_inner(self) -> W {
        self.sink
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Writes one line if `level` passes the filter.
    fn write(&self, level: Level, message: &str) {
        if level < self.min_level {
            return;
        }
        let line = format!("{}{message}\n", self.prefix_for(level));
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.write_all(line.as_bytes());
            let _ = sink.flush();
        }
    }
}

impl<W: Write + Send> Logger for Prefixed<W> {
    fn info(&self, message: &str) {
        self.write(Level::Info, message);
    }

    fn debug(&self, message: &str) {
        self.write(Level::Debug, message);
    }

    fn warn(&self, message: &str) {
        self.write(Level::Warning, message);
    }

    fn error(&self, message: &str) {
        self.write(Level::Error, message);
    }

    fn critical(&self, message: &str) {
        self.write(Level::Critical, message);
    }
}

/// Logger that duplicates every message to a set of loggers.
///
/// Members can be added and removed while other threads are logging.
#[derive(Default)]
pub struct Fanout {
    /// Current members, in insertion order.
    loggers: RwLock<Vec<Arc<dyn Logger>>>,
}

impl Fanout {
    /// Creates a fan-out over `loggers`.
    pub fn new(loggers: impl IntoIterator<Item = Arc<dyn Logger>>) -> Self {
        Self {
            loggers: RwLock::new(loggers.into_iter().collect()),
        }
    }

    /// Adds a member.
    pub fn add(&self, logger: Arc<dyn Logger>) {
        if let Ok(mut loggers) = self.loggers.write() {
            loggers.push(logger);
        }
    }

    /// Removes a member by identity. Unknown loggers are ignored.
    pub fn remove(&self, logger: &Arc<dyn Logger>) {
        if let Ok(mut loggers) = self.loggers.write() {
            loggers.retain(|l| !Arc::ptr_eq(l, logger));
        }
    }

    /// Number of current members.
    pub fn len(&self) -> usize {
        self.loggers.read().map_or(0, |l| l.len())
    }

    /// Returns `true` if there are no members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forwards one message to every member.
    fn each(&self, f: impl Fn(&dyn Logger)) {
        if let Ok(loggers) = self.loggers.read() {
            for logger in loggers.iter() {
                f(logger.as_ref());
            }
        }
    }
}

impl std::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("members", &self.len())
            .finish()
    }
}

impl Logger for Fanout {
    fn info(&self, message: &str) {
        self.each(|l| l.info(message));
    }

    fn debug(&self, message: &str) {
        self.each(|l| l.debug(message));
    }

    fn warn(&self, message: &str) {
        self.each(|l| l.warn(message));
    }

    fn error(&self, message: &str) {
        self.each(|l| l.error(message));
    }

    fn critical(&self, message: &str) {
        self.each(|l| l.critical(message));
    }
}

/// Logger that emits `tracing` events under the `stave` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tracing;

impl Logger for Tracing {
    fn info(&self, message: &str) {
        tracing::info!(target: "stave", "{message}");
    }

    fn debug(&self, message: &str) {
        tracing::debug!(target: "stave", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "stave", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "stave", "{message}");
    }

    fn critical(&self, message: &str) {
        tracing::error!(target: "stave", critical = true, "{message}");
    }
}
