use thiserror::Error;

#[derive(Debug, Error)]
pub enum SortError {
    #[error("cannot sort an empty buffer")]
    EmptyBuffer,

    #[error("key buffer holds {keys} elements but {required} are needed to cover the sorted region")]
    KeyBufferTooShort { keys: usize, required: usize },

    #[error("{count} elements exceed the {max} elements addressable by the sort kernels")]
    TooManyElements { count: usize, max: usize },

    #[error("failed to allocate {bytes} bytes for the {label} buffer: {reason}")]
    Allocation { label: &'static str, bytes: u64, reason: String },

    #[error("compute backend failure: {0}")]
    Backend(String),

    #[error("no suitable GPU adapter found")]
    NoAdapter,

    #[error(transparent)]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

pub type Result<T, E = SortError> = std::result::Result<T, E>;
