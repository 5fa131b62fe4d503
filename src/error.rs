use std::{
    error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

/// The result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every way a training run can fail. None of them are recovered from.
#[derive(Debug)]
pub enum Error {
    /// Two sizes that must agree do not.
    ShapeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// `backward` was called on something that is not a `1x1` value.
    NotScalar { rows: usize, cols: usize },
    /// Two variables from different graphs were combined.
    ForeignVariable,
    /// An optimizer step was requested before gradients were accumulated.
    MissingGradients { store: usize },
    /// Gradients were accumulated on top of ones already applied by a step.
    StaleGradients { store: usize },
    /// An optimizer was asked to update a store it is not bound to.
    StoreMismatch { bound: usize, got: usize },
    /// A batch without labels reached a supervised loss.
    MissingLabels,
    /// A label does not index into the score columns.
    LabelOutOfRange { label: usize, classes: usize },
    InvalidConfig(String),
    UnsupportedDevice(String),
    /// A dataset file did not have the expected layout.
    Dataset { path: PathBuf, reason: String },
    Io(io::Error),
    Image(image::ImageError),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch in {what}: got {got}, expected {expected}"
            ),
            Error::NotScalar { rows, cols } => write!(
                f,
                "backward needs a scalar loss, got a {rows}x{cols} value"
            ),
            Error::ForeignVariable => {
                write!(f, "tried to combine variables from different graphs")
            }
            Error::MissingGradients { store } => write!(
                f,
                "optimizer step on store {store} without freshly accumulated gradients"
            ),
            Error::StaleGradients { store } => write!(
                f,
                "gradients of store {store} were already applied, \
                 clear them before backpropagating again"
            ),
            Error::StoreMismatch { bound, got } => write!(
                f,
                "optimizer is bound to store {bound} but was stepped with store {got}"
            ),
            Error::MissingLabels => write!(f, "supervised loss needs a labeled batch"),
            Error::LabelOutOfRange { label, classes } => {
                write!(f, "label {label} out of range for {classes} classes")
            }
            Error::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),
            Error::UnsupportedDevice(device) => write!(
                f,
                "device `{device}` is not available, only the cpu backend is built in"
            ),
            Error::Dataset { path, reason } => {
                write!(f, "bad dataset file {}: {reason}", path.display())
            }
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Image(e) => write!(f, "image error: {e}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Image(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Image(e)
    }
}
