use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors that can occur while staging or uploading a batch
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Could not find a free save name for {name} after {attempts} attempts")]
    NameResolutionExhausted { name: String, attempts: u32 },

    #[error("Upload of candidate {index} ({save_name}) failed: {source}")]
    UploadFailed {
        index: usize,
        save_name: String,
        #[source]
        source: Box<UploadError>,
    },

    #[error("Upload cancelled after {completed} candidates")]
    Cancelled { completed: usize },

    #[error("Uploader is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Image error: {source}")]
    Image {
        #[from]
        source: image::ImageError,
    },
}

impl UploadError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    /// Create an invalid input error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a name resolution exhausted error
    pub fn exhausted<S: Into<String>>(name: S, attempts: u32) -> Self {
        Self::NameResolutionExhausted {
            name: name.into(),
            attempts,
        }
    }

    /// Wrap the error of a single failed put
    pub fn upload_failed<S: Into<String>>(index: usize, save_name: S, source: UploadError) -> Self {
        Self::UploadFailed {
            index,
            save_name: save_name.into(),
            source: Box::new(source),
        }
    }
}
