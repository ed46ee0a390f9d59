use parking_lot::Mutex;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("listen failed: {0}")]
    ListenFail(String),

    #[error("accept failed: {0}")]
    AcceptFail(String),

    #[error("capture open failed: {0}")]
    CaptureOpenFail(String),

    #[error("capture grab failed: {0}")]
    CaptureGrabFail(String),

    #[error("monitor send failed: {0}")]
    SendFail(String),

    #[error("connection release failed: {0}")]
    ReleaseFail(String),

    #[error("interrupted")]
    Interrupt,

    #[error("client authorization rejected")]
    BadAuth,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("notification error: {0}")]
    Notify(String),
}

impl AppError {
    /// Process exit code carried by this error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::ListenFail(_) => 1,
            AppError::AcceptFail(_) => 2,
            AppError::CaptureOpenFail(_) => 3,
            AppError::CaptureGrabFail(_) => 4,
            AppError::SendFail(_) => 5,
            AppError::ReleaseFail(_) => 6,
            AppError::Interrupt => 7,
            AppError::BadAuth => 8,
            // Ambient failures (config parse, stray IO) have no slot in the
            // wire-visible taxonomy and surface as a generic failure.
            _ => 1,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// First-error-wins recorder shared between the pipeline and the server.
///
/// Every worker that dies with a fatal error records it here; the first
/// recorded error determines the process exit code.
#[derive(Default)]
pub struct ErrorSlot {
    inner: Mutex<Option<AppError>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error unless one is already present.
    pub fn record(&self, err: AppError) {
        let mut slot = self.inner.lock();
        if slot.is_none() {
            tracing::error!("{}", err);
            *slot = Some(err);
        } else {
            tracing::debug!("suppressing subsequent error: {}", err);
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Exit code of the recorded error, or 0 when none was recorded.
    pub fn exit_code(&self) -> u8 {
        self.inner.lock().as_ref().map(AppError::exit_code).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_taxonomy() {
        assert_eq!(AppError::ListenFail(String::new()).exit_code(), 1);
        assert_eq!(AppError::AcceptFail(String::new()).exit_code(), 2);
        assert_eq!(AppError::CaptureOpenFail(String::new()).exit_code(), 3);
        assert_eq!(AppError::CaptureGrabFail(String::new()).exit_code(), 4);
        assert_eq!(AppError::SendFail(String::new()).exit_code(), 5);
        assert_eq!(AppError::ReleaseFail(String::new()).exit_code(), 6);
        assert_eq!(AppError::Interrupt.exit_code(), 7);
        assert_eq!(AppError::BadAuth.exit_code(), 8);
    }

    #[test]
    fn first_recorded_error_wins() {
        let slot = ErrorSlot::new();
        assert_eq!(slot.exit_code(), 0);
        assert!(!slot.is_set());

        slot.record(AppError::BadAuth);
        slot.record(AppError::Interrupt);

        assert!(slot.is_set());
        assert_eq!(slot.exit_code(), 8);
    }
}
