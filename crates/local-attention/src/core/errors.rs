//! Error types emitted by the local-attention kernels.

/// Local-attention error category.
///
/// All conditions are detected before any computation starts; a failing call
/// produces no partial output.
#[derive(Debug)]
pub enum LocalAttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    Shape { context: String },
    /// Invalid kernel geometry or operand configuration (even window
    /// extents, mixed dtypes, mixed devices).
    Config { context: String },
    /// The kernels do not support the requested data type.
    UnsupportedDType { requested: String },
    /// A candle failure propagated to the caller.
    Backend { message: String },
}

impl std::fmt::Display for LocalAttentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalAttentionError::Shape { context } => {
                write!(f, "invalid tensor shape: {context}")
            }
            LocalAttentionError::Config { context } => {
                write!(f, "invalid configuration: {context}")
            }
            LocalAttentionError::UnsupportedDType { requested } => {
                write!(f, "unsupported dtype {requested}")
            }
            LocalAttentionError::Backend { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for LocalAttentionError {}
