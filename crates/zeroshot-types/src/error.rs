use thiserror::Error;

/// One variant per error kind named in the engine's error-handling design.
/// Recoverable kinds are encoded back onto the ledger by the caller;
/// `Cancelled` and `ConfigError` short-circuit instead.
#[derive(Debug, Error, Clone)]
pub enum ZeroshotError {
    #[error("config error: {0}")]
    Config(String),
    #[error("logic error: {0}")]
    Logic(String),
    #[error("spawn error: {0}")]
    Spawn(String),
    #[error("polling timed out: {0}")]
    PollingTimeout(String),
    #[error("task failed: {0}")]
    TaskFailure(String),
    #[error("lock contention: {0}")]
    LockContention(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("output parse error: {0}")]
    OutputParse(String),
    #[error("hook error: {0}")]
    Hook(String),
    #[error("cancelled")]
    Cancelled,
}

impl ZeroshotError {
    /// `true` for lock-file contention specifically, used by the agent
    /// retry loop to pick the longer 10-30s jittered backoff.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, ZeroshotError::LockContention(_))
            || matches!(self, ZeroshotError::TaskFailure(msg) if msg.contains("Lock file"))
    }
}
