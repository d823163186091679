//! Unified error type for the Quiver backend.
//!
//! Every error that crosses a service boundary maps to a stable numeric code
//! (`Error::code`) plus a human-readable reason (`Display`). The numeric
//! mapping is part of the external contract; codes are grouped by subsystem
//! and must never be reused.

use thiserror::Error;

/// Result type alias used across all Quiver crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error for the backend.
///
/// Cloneable so a task can retain its exit status and report it to every
/// waiter. Variants that wrap other errors carry a rendered message instead
/// of the source, for the same reason.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    // ------------------------------------------------------------------
    // General (1xxx)
    // ------------------------------------------------------------------
    /// Unexpected internal failure
    #[error("runtime error: {0}")]
    RuntimeError(String),

    /// Broken internal invariant
    #[error("logic error: {0}")]
    LogicError(String),

    /// Service lifecycle called out of order
    #[error("service status error: current {current:?}, expected {expected:?}")]
    StatusError {
        /// Observed status at the time of the call
        current: crate::service::ServiceStatus,
        /// Status the operation requires
        expected: crate::service::ServiceStatus,
    },

    /// Configuration could not be loaded or was rejected
    #[error("load config failed: {0}")]
    LoadConfig(String),

    /// Caller passed an invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Filesystem operation failed (message-only; io::Error is not Clone)
    #[error("io error: {0}")]
    Io(String),

    // ------------------------------------------------------------------
    // Schema / meta (2xxx)
    // ------------------------------------------------------------------
    /// New schema is not compatible with the stored one
    #[error("mismatched schema")]
    MismatchedSchema,

    /// Persisted index file failed its magic-number check
    #[error("mismatched magic number")]
    MismatchedMagicNumber,

    /// Requested data type does not match the column schema
    #[error("mismatched data type")]
    MismatchedDataType,

    /// Forward tuple length differs from the schema revision's column list
    #[error("mismatched forward")]
    MismatchedForward,

    /// No schema stored under the requested revision
    #[error("invalid revision {0}")]
    InvalidRevision(u64),

    /// Collection config does not match the source table
    #[error("invalid collection config: {0}")]
    InvalidCollectionConfig(String),

    // ------------------------------------------------------------------
    // Collection (3xxx)
    // ------------------------------------------------------------------
    /// Collection already exists
    #[error("duplicate collection: {0}")]
    DuplicateCollection(String),

    /// Collection does not exist
    #[error("inexistent collection: {0}")]
    InexistentCollection(String),

    /// Writes to the collection are suspended
    #[error("suspended collection: {0}")]
    SuspendedCollection(String),

    /// Reads from the collection are suspended
    #[error("unreadable collection: {0}")]
    UnreadableCollection(String),

    /// Named column is not part of the collection schema
    #[error("inexistent column: {0}")]
    InexistentColumn(String),

    /// Direct write path saw an existing primary key
    #[error("duplicate key: {0}")]
    DuplicateKey(u64),

    /// Service has been stopped
    #[error("stopped service")]
    StoppedService,

    // ------------------------------------------------------------------
    // Query (4xxx)
    // ------------------------------------------------------------------
    /// Request failed validation
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Feature bytes or matrix could not be interpreted
    #[error("invalid vector format: {0}")]
    InvalidVectorFormat(String),

    /// Collection currently has no queryable segment
    #[error("unavailable segment")]
    UnavailableSegment,

    /// Task was built against a missing segment
    #[error("invalid segment")]
    InvalidSegment,

    /// Task produced fewer batches than requested
    #[error("out of bounds result")]
    OutOfBoundsResult,

    /// Scheduler refused the task
    #[error("schedule error")]
    ScheduleError,

    // ------------------------------------------------------------------
    // MySQL repository (7xxx)
    // ------------------------------------------------------------------
    /// Source server version is unsupported
    #[error("unsupported mysql version: {0}")]
    UnsupportedMysqlVersion(String),

    /// binlog_format is not ROW
    #[error("unsupported binlog format: {0}")]
    UnsupportedBinlogFormat(String),

    /// Connection to the source failed
    #[error("connect mysql failed: {0}")]
    ConnectMysql(String),

    /// Statement execution failed
    #[error("execute mysql failed: {0}")]
    ExecuteMysql(String),

    /// Simple command (e.g. COM_BINLOG_DUMP) failed
    #[error("execute simple command failed: {0}")]
    ExecuteSimpleCommand(String),

    /// Streamed result fetch failed mid-scan
    #[error("fetch mysql result failed")]
    FetchMysqlResult,

    /// Result set shape did not match the statement
    #[error("invalid mysql result: {0}")]
    InvalidMysqlResult(String),

    /// Dump stream reached end of data; caller may sleep and retry
    #[error("binlog has no more data")]
    BinlogNoMoreData,

    /// Row payload could not be decoded against the cached table map
    #[error("invalid row data: {0}")]
    InvalidRowData(String),

    /// Reader suspended after a schema-incompatible ALTER
    #[error("reader suspended")]
    Suspended,
}

impl Error {
    /// Stable numeric code of this error. Part of the external contract.
    pub fn code(&self) -> u32 {
        match self {
            Error::RuntimeError(_) => 1000,
            Error::LogicError(_) => 1001,
            Error::StatusError { .. } => 1002,
            Error::LoadConfig(_) => 1003,
            Error::InvalidArgument(_) => 1004,
            Error::Io(_) => 1005,

            Error::MismatchedSchema => 2000,
            Error::MismatchedMagicNumber => 2001,
            Error::MismatchedDataType => 2002,
            Error::MismatchedForward => 2003,
            Error::InvalidRevision(_) => 2004,
            Error::InvalidCollectionConfig(_) => 2005,

            Error::DuplicateCollection(_) => 3000,
            Error::InexistentCollection(_) => 3001,
            Error::SuspendedCollection(_) => 3002,
            Error::UnreadableCollection(_) => 3003,
            Error::InexistentColumn(_) => 3004,
            Error::DuplicateKey(_) => 3005,
            Error::StoppedService => 3006,

            Error::InvalidQuery(_) => 4000,
            Error::InvalidVectorFormat(_) => 4001,
            Error::UnavailableSegment => 4002,
            Error::InvalidSegment => 4003,
            Error::OutOfBoundsResult => 4004,
            Error::ScheduleError => 4005,

            Error::UnsupportedMysqlVersion(_) => 7000,
            Error::UnsupportedBinlogFormat(_) => 7001,
            Error::ConnectMysql(_) => 7002,
            Error::ExecuteMysql(_) => 7003,
            Error::ExecuteSimpleCommand(_) => 7004,
            Error::FetchMysqlResult => 7005,
            Error::InvalidMysqlResult(_) => 7006,
            Error::BinlogNoMoreData => 7007,
            Error::InvalidRowData(_) => 7008,
            Error::Suspended => 7009,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
