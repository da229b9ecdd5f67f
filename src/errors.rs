use thiserror::Error;

pub type ErebusResult<T, E = ErebusError> = core::result::Result<T, E>;

/// Hard failures. Config content problems are not errors; they surface as
/// [`crate::config::ConfigWarning`] and the run continues on builtins.
#[derive(Debug, Error)]
pub enum ErebusError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}
