use std::sync::Arc;

/// Error a teardown action may return. Boxed so callers can surface any
/// error type through the process handle.
pub type TeardownError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    /// The teardown action returned an error. The payload is shared because
    /// every `close` caller receives the same cached result.
    #[error("teardown failed: {0}")]
    Teardown(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl ProcessError {
    pub(crate) fn teardown(err: TeardownError) -> Self {
        ProcessError::Teardown(Arc::from(err))
    }
}
