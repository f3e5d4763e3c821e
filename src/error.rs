use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Not found")]
    NotFound,

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Resource in use: {0}")]
    InUse(String),

    #[error("DMA transfer timed out")]
    DmaTimeout,

    #[error("Hardware fault: {0}")]
    HardwareFault(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl DriverError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Maps the error to the negative status code handed back across the user boundary.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        let errno = match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::OutOfMemory => libc::ENOMEM,
            Self::NotFound => libc::ENOENT,
            Self::Busy(_) | Self::InUse(_) => libc::EBUSY,
            Self::DmaTimeout => libc::ETIMEDOUT,
            Self::HardwareFault(_) => libc::EIO,
            Self::Cancelled => libc::EINTR,
        };
        -errno
    }
}

// A convenient alias
pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_negative() {
        assert_eq!(DriverError::OutOfMemory.to_errno(), -libc::ENOMEM);
        assert_eq!(DriverError::invalid("x").to_errno(), -libc::EINVAL);
        assert_eq!(DriverError::DmaTimeout.to_errno(), -libc::ETIMEDOUT);
        assert_eq!(DriverError::Cancelled.to_errno(), -libc::EINTR);
        assert_eq!(DriverError::InUse("ctx".into()).to_errno(), -libc::EBUSY);
    }
}
