//! Error types for the strand fiber scheduler

use core::fmt;

/// Result type for fiber operations
pub type FiberResult<T> = Result<T, FiberError>;

/// Errors that can occur when creating or configuring fibers
///
/// Invariant violations (double-linking, join-on-self, destroying the
/// active fiber) are programming errors and assert instead of returning
/// a variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberError {
    /// Stack mapping or protection failed
    Stack(StackError),

    /// Invalid builder configuration
    InvalidConfig(&'static str),
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::Stack(e) => write!(f, "stack error: {}", e),
            FiberError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for FiberError {}

/// Stack allocation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// mmap failed, carries errno
    MapFailed(i32),

    /// mprotect failed, carries errno
    ProtectFailed(i32),

    /// munmap failed, carries errno
    UnmapFailed(i32),

    /// Requested stack size is too small to hold a control block
    /// plus a usable stack
    TooSmall,

    /// Requested stack size overflowed when page-rounded
    SizeOverflow,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::MapFailed(errno) => write!(f, "stack mapping failed (errno {})", errno),
            StackError::ProtectFailed(errno) => {
                write!(f, "stack protection change failed (errno {})", errno)
            }
            StackError::UnmapFailed(errno) => write!(f, "stack unmapping failed (errno {})", errno),
            StackError::TooSmall => write!(f, "stack size too small"),
            StackError::SizeOverflow => write!(f, "stack size overflowed"),
        }
    }
}

impl std::error::Error for StackError {}

impl From<StackError> for FiberError {
    fn from(e: StackError) -> Self {
        FiberError::Stack(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = FiberError::InvalidConfig("stack_size must be at least one page");
        assert_eq!(
            format!("{}", e),
            "invalid configuration: stack_size must be at least one page"
        );

        let e = FiberError::Stack(StackError::MapFailed(12));
        assert_eq!(format!("{}", e), "stack error: stack mapping failed (errno 12)");
    }

    #[test]
    fn test_error_conversion() {
        let stack_err = StackError::TooSmall;
        let fiber_err: FiberError = stack_err.into();
        assert!(matches!(fiber_err, FiberError::Stack(StackError::TooSmall)));
    }
}
