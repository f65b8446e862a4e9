use nix::errno::Errno;
use thiserror::Error;

/// Failures of the interrupt registration path.
///
/// Driver-facing wrappers in [`crate::compat`] flatten these into negative
/// errno values with [`IrqError::errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IrqError {
    #[error("no device owns irq {0}")]
    NoSuchDevice(u32),
    #[error("host could not allocate an irq resource for irq {0}")]
    ResourceUnavailable(u32),
    #[error("installing the interrupt handler for irq {irq} failed: {cause}")]
    SetupFailed { irq: u32, cause: Errno },
    #[error("irq {0} has no active registration")]
    NotFound(u32),
    #[error("irq {0} is already registered on its device")]
    Busy(u32),
    #[error("host rejected the request for irq {irq}: {cause}")]
    Host { irq: u32, cause: Errno },
    #[error("irq registry is shut down")]
    Shutdown,
}

impl IrqError {
    /// Negative errno value reported to driver code.
    pub fn errno(&self) -> i32 {
        let errno = match self {
            IrqError::NoSuchDevice(_) | IrqError::ResourceUnavailable(_) => Errno::ENXIO,
            IrqError::SetupFailed { cause, .. } | IrqError::Host { cause, .. } => *cause,
            IrqError::NotFound(_) => Errno::ENOENT,
            IrqError::Busy(_) => Errno::EBUSY,
            IrqError::Shutdown => Errno::ESHUTDOWN,
        };
        -(errno as i32)
    }
}

pub type Result<T> = std::result::Result<T, IrqError>;
