use std::fmt;
use std::io::Error as IoError;

/// A tunable write that was refused. The previous value is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunableError {
    /// The attribute name is not a known tunable (or is read-only).
    Unknown(String),
    /// The raw input could not be parsed as an unsigned integer.
    Malformed { name: &'static str, raw: String },
    /// The value is outside the numeric range allowed for this tunable.
    OutOfRange { name: &'static str, value: u32 },
    /// The value would break the threshold ordering.
    Ordering { name: &'static str, value: u32 },
}

impl fmt::Display for TunableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunableError::Unknown(name) => write!(f, "unknown tunable {name}"),
            TunableError::Malformed { name, raw } => {
                write!(f, "{name}: cannot parse {raw:?} as an unsigned integer")
            }
            TunableError::OutOfRange { name, value } => {
                write!(f, "{name}: {value} is out of range")
            }
            TunableError::Ordering { name, value } => write!(
                f,
                "{name}: {value} would break down_threshold < micro_up_threshold \
                < up_threshold < highspeed_up_threshold"
            ),
        }
    }
}

impl std::error::Error for TunableError {}

/// The actuation driver could not honor a target.
#[derive(Debug)]
pub enum ActuationError {
    /// The driver refused the request (busy, unit not claimed, ...).
    Rejected(String),
    /// No supported operating point exists for the request.
    Unsupported { cpu: usize, target: u32 },
    Io(IoError),
}

impl fmt::Display for ActuationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuationError::Rejected(why) => write!(f, "driver rejected request: {why}"),
            ActuationError::Unsupported { cpu, target } => {
                write!(f, "cpu{cpu}: no supported frequency for {target} kHz")
            }
            ActuationError::Io(e) => write!(f, "driver I/O error: {e}"),
        }
    }
}

impl std::error::Error for ActuationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ActuationError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for ActuationError {
    fn from(e: IoError) -> Self {
        ActuationError::Io(e)
    }
}

/// Governor start failed. Nothing was left running.
#[derive(Debug)]
pub enum StartError {
    NoUnits,
    Sampling { cpu: usize, source: IoError },
    Spawn(IoError),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::NoUnits => write!(f, "no units to govern"),
            StartError::Sampling { cpu, source } => {
                write!(f, "cpu{cpu}: initial idle sample failed: {source}")
            }
            StartError::Spawn(e) => write!(f, "cannot spawn worker thread: {e}"),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::NoUnits => None,
            StartError::Sampling { source, .. } => Some(source),
            StartError::Spawn(e) => Some(e),
        }
    }
}
