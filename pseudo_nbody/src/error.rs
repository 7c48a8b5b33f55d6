use std::fmt;

/// Stage of a run during which an [`Error`] occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Copying the particles to the backend before the first iteration.
    Upload,
    /// Computing the partial accelerations of every (test, source) pair.
    Compute,
    /// Collapsing the partial accelerations of every test particle.
    Reduce,
    /// Advancing the test particles.
    Integrate,
    /// Copying the test particles back from the backend after the last iteration.
    Download,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Upload => "upload",
            Self::Compute => "compute",
            Self::Reduce => "reduce",
            Self::Integrate => "integrate",
            Self::Download => "download",
        };
        f.write_str(name)
    }
}

/// Fatal error aborting a run.
///
/// None of these are recoverable: once a stage fails, every following stage would read
/// incomplete data, so the driver stops and hands the error back to the caller.
#[derive(Debug)]
pub enum Error {
    /// Host or device memory could not be allocated.
    Allocation {
        /// Stage that requested the memory.
        stage: Stage,
        /// Number of bytes requested.
        bytes: u64,
    },
    /// A dispatch was rejected or failed on the backend.
    Dispatch {
        /// Stage of the failed dispatch.
        stage: Stage,
        /// Message reported by the backend.
        message: String,
    },
    /// Data could not be copied between the host and the backend.
    Transfer {
        /// Stage of the failed copy.
        stage: Stage,
        /// Message reported by the backend.
        message: String,
    },
    /// The backend could not be brought up (no adapter, no device, program build failure).
    Bootstrap(String),
    /// The simulation parameters are unusable.
    InvalidConfig(String),
}

impl Error {
    /// Returns the stage during which this error occurred, if it occurred during a run.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Allocation { stage, .. }
            | Self::Dispatch { stage, .. }
            | Self::Transfer { stage, .. } => Some(*stage),
            Self::Bootstrap(_) | Self::InvalidConfig(_) => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation { stage, bytes } => {
                write!(f, "{stage}: could not allocate {bytes} bytes")
            }
            Self::Dispatch { stage, message } => write!(f, "{stage}: dispatch failed: {message}"),
            Self::Transfer { stage, message } => write!(f, "{stage}: transfer failed: {message}"),
            Self::Bootstrap(message) => write!(f, "backend setup failed: {message}"),
            Self::InvalidConfig(message) => write!(f, "invalid configuration: {message}"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type of every fallible operation of this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Allocates a zeroed vector of `len` elements, reporting exhaustion as [`Error::Allocation`].
pub(crate) fn try_zeroed<T: Clone + Default>(len: usize, stage: Stage) -> Result<Vec<T>> {
    let mut vec = Vec::new();
    vec.try_reserve_exact(len).map_err(|_| Error::Allocation {
        stage,
        bytes: (len as u64).saturating_mul(std::mem::size_of::<T>() as u64),
    })?;
    vec.resize(len, T::default());
    Ok(vec)
}
