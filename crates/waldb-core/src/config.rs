use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;

/// Kind of SQLite transaction opened by `write` and `in_transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransactionKind {
    /// `BEGIN DEFERRED` — the write lock is taken on first mutation. **Default.**
    Deferred,
    /// `BEGIN IMMEDIATE` — the write lock is taken up front.
    Immediate,
    /// `BEGIN EXCLUSIVE` — also excludes readers outside WAL mode.
    Exclusive,
}

impl Default for TransactionKind {
    fn default() -> Self {
        Self::Deferred
    }
}

impl TransactionKind {
    pub(crate) fn begin_sql(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deferred => write!(f, "deferred"),
            Self::Immediate => write!(f, "immediate"),
            Self::Exclusive => write!(f, "exclusive"),
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deferred" => Ok(Self::Deferred),
            "immediate" => Ok(Self::Immediate),
            "exclusive" => Ok(Self::Exclusive),
            other => Err(format!("unknown transaction kind: {other}")),
        }
    }
}

/// What a connection does when another connection holds a conflicting lock.
#[derive(Debug, Clone, Copy)]
pub enum BusyMode {
    /// Fail immediately with `SQLITE_BUSY`. **Default for writers.**
    ImmediateError,
    /// Wait up to the given duration before failing.
    Timeout(Duration),
    /// Invoke the callback with the retry count; return `true` to keep waiting.
    Callback(fn(i32) -> bool),
}

impl Default for BusyMode {
    fn default() -> Self {
        Self::ImmediateError
    }
}

/// A function run on each freshly opened connection, on its executor, before
/// the connection serves its first access.
pub type PrepareHook = Arc<dyn Fn(&Connection) -> Result<()> + Send + Sync>;

/// Immutable-after-open configuration for [`DatabaseQueue`] and
/// [`DatabasePool`].
///
/// [`DatabaseQueue`]: crate::DatabaseQueue
/// [`DatabasePool`]: crate::DatabasePool
#[derive(Clone)]
pub struct Config {
    /// Open the database read-only.
    pub read_only: bool,
    /// `PRAGMA foreign_keys`. Default true.
    pub foreign_keys: bool,
    /// Accept legacy double-quoted string literals (engine DQS setting).
    /// Default false.
    pub double_quoted_string_literals: bool,
    /// Transaction kind used by `write`. Default deferred.
    pub transaction_kind: TransactionKind,
    /// Busy handling for the writer; readers derive theirs from it.
    pub busy_mode: BusyMode,
    /// Upper bound on pooled reader connections. At least 1. Default 5.
    pub max_readers: usize,
    /// Names executor threads (`{label}-writer`, `{label}-reader-N`).
    pub label: Option<String>,
    /// Permit leaving a transaction open when an access block ends.
    pub allows_unsafe_transactions: bool,
    /// Enable cooperative suspension of writes (see `DatabasePool::suspend`).
    pub observes_suspension: bool,
    pub(crate) prepare_hooks: Vec<PrepareHook>,
}

impl Config {
    /// Create a config builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Busy handling for pooled readers, derived from the writer's mode.
    ///
    /// A reader can legitimately collide with a truncating checkpoint, so
    /// `ImmediateError` is upgraded to a short timeout.
    pub(crate) fn reader_busy_mode(&self) -> BusyMode {
        match self.busy_mode {
            BusyMode::ImmediateError => BusyMode::Timeout(Duration::from_secs(1)),
            other => other,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_only: false,
            foreign_keys: true,
            double_quoted_string_literals: false,
            transaction_kind: TransactionKind::default(),
            busy_mode: BusyMode::default(),
            max_readers: 5,
            label: None,
            allows_unsafe_transactions: false,
            observes_suspension: false,
            prepare_hooks: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("read_only", &self.read_only)
            .field("foreign_keys", &self.foreign_keys)
            .field(
                "double_quoted_string_literals",
                &self.double_quoted_string_literals,
            )
            .field("transaction_kind", &self.transaction_kind)
            .field("busy_mode", &self.busy_mode)
            .field("max_readers", &self.max_readers)
            .field("label", &self.label)
            .field("allows_unsafe_transactions", &self.allows_unsafe_transactions)
            .field("observes_suspension", &self.observes_suspension)
            .field("prepare_hooks", &self.prepare_hooks.len())
            .finish()
    }
}

/// Builder for [`Config`].
#[derive(Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn read_only(mut self, yes: bool) -> Self {
        self.config.read_only = yes;
        self
    }

    pub fn foreign_keys(mut self, yes: bool) -> Self {
        self.config.foreign_keys = yes;
        self
    }

    pub fn double_quoted_string_literals(mut self, yes: bool) -> Self {
        self.config.double_quoted_string_literals = yes;
        self
    }

    pub fn transaction_kind(mut self, kind: TransactionKind) -> Self {
        self.config.transaction_kind = kind;
        self
    }

    pub fn busy_mode(mut self, mode: BusyMode) -> Self {
        self.config.busy_mode = mode;
        self
    }

    pub fn max_readers(mut self, n: usize) -> Self {
        self.config.max_readers = n.max(1);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = Some(label.into());
        self
    }

    pub fn allows_unsafe_transactions(mut self, yes: bool) -> Self {
        self.config.allows_unsafe_transactions = yes;
        self
    }

    pub fn observes_suspension(mut self, yes: bool) -> Self {
        self.config.observes_suspension = yes;
        self
    }

    /// Append a hook run on each freshly opened connection before first use.
    /// Hooks run in registration order; a failing hook closes the connection
    /// and fails the open.
    pub fn prepare_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
    {
        self.config.prepare_hooks.push(Arc::new(hook));
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = Config::default();
        assert!(!cfg.read_only);
        assert!(cfg.foreign_keys);
        assert_eq!(cfg.max_readers, 5);
        assert_eq!(cfg.transaction_kind, TransactionKind::Deferred);
        assert!(matches!(cfg.busy_mode, BusyMode::ImmediateError));
        assert!(cfg.prepare_hooks.is_empty());
    }

    #[test]
    fn builder_clamps_readers() {
        let cfg = Config::builder().max_readers(0).build();
        assert_eq!(cfg.max_readers, 1);
    }

    #[test]
    fn parse_transaction_kind() {
        assert_eq!(
            "immediate".parse::<TransactionKind>().unwrap(),
            TransactionKind::Immediate
        );
        assert_eq!(
            "Exclusive".parse::<TransactionKind>().unwrap(),
            TransactionKind::Exclusive
        );
        assert!("bogus".parse::<TransactionKind>().is_err());
    }

    #[test]
    fn reader_busy_mode_upgrades_immediate_error() {
        let cfg = Config::default();
        assert!(matches!(cfg.reader_busy_mode(), BusyMode::Timeout(_)));

        let cfg = Config::builder()
            .busy_mode(BusyMode::Timeout(Duration::from_millis(250)))
            .build();
        match cfg.reader_busy_mode() {
            BusyMode::Timeout(d) => assert_eq!(d, Duration::from_millis(250)),
            other => panic!("unexpected mode {other:?}"),
        }
    }
}
