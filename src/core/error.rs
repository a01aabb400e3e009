use thiserror::Error;

/// Broad failure classes used by callers to decide between aborting,
/// surfacing and skipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed bytes: the operation in progress cannot continue
    Corruption,
    /// A referenced package or object could not be found
    MissingDependency,
    /// Failure that a batch or bootstrap step may log and skip
    Tolerable,
    /// Logical error against a mapper index (grammar, patch target)
    IndexLogic,
    /// Underlying filesystem failure
    Io,
    /// Configuration and everything else
    Other,
}

#[derive(Error, Debug)]
pub enum GpkError {
    #[error("Invalid package tag: {found:#010x}")]
    InvalidMagic { found: u32 },

    #[error("Unsupported package version: {file_version}/{licensee_version}")]
    UnsupportedVersion {
        file_version: u16,
        licensee_version: u16,
    },

    #[error("Unexpected end of data at offset {offset:#x} (need {need} bytes, have {have})")]
    UnexpectedEof {
        offset: usize,
        need: usize,
        have: usize,
    },

    #[error("Size mismatch in {context}: declared {expected} bytes, consumed {actual}")]
    SizeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("Object index {index} out of range in {context}")]
    IndexOutOfRange { index: i64, context: String },

    #[error("Name index {0} is not in the name table")]
    InvalidName(i32),

    #[error("Corrupt data in {context}: {message}")]
    Corrupt { context: String, message: String },

    #[error("Property nesting deeper than {limit} levels")]
    PropertyDepthExceeded { limit: usize },

    #[error("Export {index} has a cyclic outer chain")]
    CyclicOuter { index: usize },

    #[error("Redirector {path} points at another redirector")]
    RedirectorChain { path: String },

    #[error("Unsupported compression flags: {0:#x}")]
    UnsupportedCompression(u32),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Package not found: {0}")]
    MissingPackage(String),

    #[error("Object not found: {0}")]
    MissingObject(String),

    #[error("Class package missing: {0}")]
    MissingClassPackage(String),

    #[error("Class packages are not loaded yet")]
    NotBootstrapped,

    #[error("Malformed index at offset {offset}: {message}")]
    IndexGrammar { offset: usize, message: String },

    #[error("Index entry not found: {0}")]
    PatchTargetNotFound(String),

    #[error("Stream is not in {expected} mode")]
    InvalidMode { expected: &'static str },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(&'static str),

    #[error("Failed to load {object}: {source}")]
    Load {
        object: String,
        #[source]
        source: Box<GpkError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GpkError {
    /// Wrap this error with the name of the object or package being loaded
    pub fn context(self, object: impl Into<String>) -> Self {
        GpkError::Load {
            object: object.into(),
            source: Box::new(self),
        }
    }

    pub(crate) fn corrupt(context: impl Into<String>, message: impl Into<String>) -> Self {
        GpkError::Corrupt {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Classify the error, looking through `Load` wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            GpkError::InvalidMagic { .. }
            | GpkError::UnsupportedVersion { .. }
            | GpkError::UnexpectedEof { .. }
            | GpkError::SizeMismatch { .. }
            | GpkError::IndexOutOfRange { .. }
            | GpkError::InvalidName(_)
            | GpkError::Corrupt { .. }
            | GpkError::PropertyDepthExceeded { .. }
            | GpkError::CyclicOuter { .. }
            | GpkError::RedirectorChain { .. }
            | GpkError::UnsupportedCompression(_)
            | GpkError::Decompression(_) => ErrorKind::Corruption,
            GpkError::MissingPackage(_)
            | GpkError::MissingObject(_)
            | GpkError::MissingClassPackage(_)
            | GpkError::NotBootstrapped => ErrorKind::MissingDependency,
            GpkError::Cancelled => ErrorKind::Tolerable,
            GpkError::IndexGrammar { .. } | GpkError::PatchTargetNotFound(_) => {
                ErrorKind::IndexLogic
            }
            GpkError::Io(_) => ErrorKind::Io,
            GpkError::Load { source, .. } => source.kind(),
            _ => ErrorKind::Other,
        }
    }

    /// Whether this error must abort engine startup
    pub fn is_fatal_at_startup(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Tolerable)
    }

    /// Innermost error behind any `Load` wrappers
    pub fn root_cause(&self) -> &GpkError {
        match self {
            GpkError::Load { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, GpkError>;
