use crate::addr::GlobalAddr;

/// Failures reported by the memory driver (reserve/map/export/import)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    ReserveFailed(usize),
    AllocateFailed(usize),
    NotReserved(GlobalAddr),
    AlreadyMapped(GlobalAddr),
    NotMapped(GlobalAddr),
    InvalidHandle(String),
    ShmemError(String),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DriverError::ReserveFailed(size) => {
                write!(f, "unable to reserve a virtual range of {} bytes", size)
            }
            DriverError::AllocateFailed(size) => {
                write!(f, "unable to allocate {} bytes of physical memory", size)
            }
            DriverError::NotReserved(addr) => {
                write!(f, "address {:x} is not inside a reserved range", addr)
            }
            DriverError::AlreadyMapped(addr) => {
                write!(f, "address {:x} already has a mapping", addr)
            }
            DriverError::NotMapped(addr) => {
                write!(f, "address {:x} has no mapping", addr)
            }
            DriverError::InvalidHandle(name) => {
                write!(f, "unknown memory handle {:?}", name)
            }
            DriverError::ShmemError(msg) => {
                write!(f, "shared memory error: {}", msg)
            }
        }
    }
}

impl std::error::Error for DriverError {}

/// Failures reported by the rendezvous transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapError {
    SizeMismatch { expected: usize, found: usize },
    InvalidPe(usize),
    GlobalExit(i32),
    Codec(String),
    Inconsistent(String),
    Closed,
}

impl std::fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BootstrapError::SizeMismatch { expected, found } => {
                write!(
                    f,
                    "collective contribution size mismatch: expected {} bytes found {}",
                    expected, found
                )
            }
            BootstrapError::InvalidPe(pe) => write!(f, "pe {} is not part of the bootstrap group", pe),
            BootstrapError::GlobalExit(status) => {
                write!(f, "global exit raised with status {}", status)
            }
            BootstrapError::Codec(msg) => write!(f, "unable to decode exchanged data: {}", msg),
            BootstrapError::Inconsistent(msg) => write!(f, "pes disagree on {}", msg),
            BootstrapError::Closed => write!(f, "bootstrap group already closed"),
        }
    }
}

impl std::error::Error for BootstrapError {}

/// The error type returned by every host-facing operation.
///
/// Each variant maps onto one of the integer status codes of the host API,
/// see [ShmemError::code].
#[derive(Debug, Clone, PartialEq)]
pub enum ShmemError {
    InvalidParam(String),
    InvalidValue(String),
    Mem(DriverError),
    Inner(String),
    NotInitialized,
    Bootstrap(BootstrapError),
    Timeout,
    MallocFailed(usize),
    GlobalExit(i32),
}

pub type ShmemResult<T> = Result<T, ShmemError>;

pub const SUCCESS: i32 = 0;

impl ShmemError {
    /// The integer status code of this error (zero is reserved for success)
    pub fn code(&self) -> i32 {
        match self {
            ShmemError::InvalidParam(_) => -1,
            ShmemError::InvalidValue(_) => -2,
            ShmemError::Mem(_) => -3,
            ShmemError::Inner(_) => -4,
            ShmemError::NotInitialized => -5,
            ShmemError::Bootstrap(_) => -6,
            ShmemError::Timeout => -7,
            ShmemError::MallocFailed(_) => -8,
            ShmemError::GlobalExit(_) => -4,
        }
    }

    /// Rebuilds an error from a status code, `None` for success
    pub fn from_code(code: i32) -> Option<ShmemError> {
        match code {
            SUCCESS => None,
            -1 => Some(ShmemError::InvalidParam(String::new())),
            -2 => Some(ShmemError::InvalidValue(String::new())),
            -3 => Some(ShmemError::Mem(DriverError::AllocateFailed(0))),
            -5 => Some(ShmemError::NotInitialized),
            -6 => Some(ShmemError::Bootstrap(BootstrapError::Closed)),
            -7 => Some(ShmemError::Timeout),
            -8 => Some(ShmemError::MallocFailed(0)),
            _ => Some(ShmemError::Inner(format!("status code {}", code))),
        }
    }
}

/// Collapses a result into the status-code form of the host API
pub fn status<T>(res: &ShmemResult<T>) -> i32 {
    match res {
        Ok(_) => SUCCESS,
        Err(e) => e.code(),
    }
}

impl std::fmt::Display for ShmemError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ShmemError::InvalidParam(msg) => write!(f, "invalid parameter: {}", msg),
            ShmemError::InvalidValue(msg) => write!(f, "invalid value: {}", msg),
            ShmemError::Mem(err) => write!(f, "memory driver error: {}", err),
            ShmemError::Inner(msg) => write!(f, "internal error: {}", msg),
            ShmemError::NotInitialized => write!(f, "context not initialized"),
            ShmemError::Bootstrap(err) => write!(f, "bootstrap error: {}", err),
            ShmemError::Timeout => write!(f, "operation timed out"),
            ShmemError::MallocFailed(size) => {
                write!(f, "symmetric heap unable to allocate {} bytes", size)
            }
            ShmemError::GlobalExit(status) => {
                write!(f, "aborted by global exit with status {}", status)
            }
        }
    }
}

impl std::error::Error for ShmemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmemError::Mem(err) => Some(err),
            ShmemError::Bootstrap(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DriverError> for ShmemError {
    fn from(err: DriverError) -> Self {
        ShmemError::Mem(err)
    }
}

impl From<BootstrapError> for ShmemError {
    fn from(err: BootstrapError) -> Self {
        match err {
            BootstrapError::GlobalExit(status) => ShmemError::GlobalExit(status),
            err => ShmemError::Bootstrap(err),
        }
    }
}

impl From<bincode::Error> for ShmemError {
    fn from(err: bincode::Error) -> Self {
        ShmemError::Bootstrap(BootstrapError::Codec(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(ShmemError::InvalidParam("x".into()).code(), -1);
        assert_eq!(ShmemError::InvalidValue("x".into()).code(), -2);
        assert_eq!(ShmemError::Mem(DriverError::AllocateFailed(1)).code(), -3);
        assert_eq!(ShmemError::Inner("x".into()).code(), -4);
        assert_eq!(ShmemError::NotInitialized.code(), -5);
        assert_eq!(ShmemError::Bootstrap(BootstrapError::Closed).code(), -6);
        assert_eq!(ShmemError::Timeout.code(), -7);
        assert_eq!(ShmemError::MallocFailed(8).code(), -8);
    }

    #[test]
    fn code_round_trip() {
        for code in [-1, -2, -3, -4, -5, -6, -7, -8] {
            assert_eq!(ShmemError::from_code(code).unwrap().code(), code);
        }
        assert!(ShmemError::from_code(SUCCESS).is_none());
        assert_eq!(status::<()>(&Ok(())), SUCCESS);
        assert_eq!(status::<()>(&Err(ShmemError::Timeout)), -7);
    }

    #[test]
    fn global_exit_from_bootstrap() {
        let err: ShmemError = BootstrapError::GlobalExit(3).into();
        assert_eq!(err, ShmemError::GlobalExit(3));
    }
}
