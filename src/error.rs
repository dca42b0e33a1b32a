use thiserror::Error;

/// Errors surfaced at construction time.
///
/// Everything downstream of construction follows the contract described in
/// the `table` module: contract violations (duplicate level-1 insert,
/// removing a key that was never inserted, updating a key that does not
/// exist) and capacity exhaustion are not recoverable conditions. The table
/// reports them with `tracing::error!` and aborts the process rather than
/// returning an `Err`, so a bug in the calling graph algorithm cannot be
/// silently swallowed. `TableError` only covers problems a caller can fix
/// before ever touching the table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("bucket size must be at least 1, got {0}")]
    InvalidBucketSize(usize),

    #[error("initial capacity {0} overflows u32 when rounded up to a multiple of the bucket size")]
    CapacityOverflow(usize),
}

pub type Result<T> = std::result::Result<T, TableError>;
