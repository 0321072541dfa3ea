use thiserror::Error;

use dbt_core::{BlockKey, TranslateError};

/// Fatal errors that leave the execution core.
///
/// Guest faults never show up here; they are delivered to the
/// guest through the interrupt path.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The translator could not produce a unit for `key`.
    #[error("translation failed for {key}: {source}")]
    Translate {
        key: BlockKey,
        #[source]
        source: TranslateError,
    },
    /// Translation cache bookkeeping is inconsistent.
    #[error("translation cache invariant violated: {0}")]
    CacheInvariant(String),
}

/// Invalid configuration or interrupt table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
    #[error("{name} must be in {min}..={max}, got {got}")]
    OutOfRange {
        name: &'static str,
        min: u64,
        max: u64,
        got: u64,
    },
    #[error("interrupt line {0} out of range")]
    IrqOutOfRange(u32),
    #[error("interrupt line {0} listed twice in priority table")]
    DuplicateIrq(u32),
}
