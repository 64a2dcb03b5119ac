use thiserror::Error;

/// Internal failure modes of a session worker.
///
/// Protocol-visible conditions (malformed command, out-of-sequence command,
/// bad address, size limits) are not represented here — those are valid
/// protocol states handled inline with a reply. This type covers the cases
/// that end the session outright.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("idle timeout")]
    Timeout,

    #[error("delivery failed: {0}")]
    Delivery(#[from] crate::delivery::DeliveryError),
}
