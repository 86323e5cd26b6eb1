use gspn_spec::{ErrorCode, LayerId};
use thiserror::Error;

use crate::hal::{CoreId, HalError};

/// Errors raised inside the scheduler.
///
/// `Clone` so a frame can hand the first failure of any member to its
/// synchronous waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GspnError {
    /// Malformed request or configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The pool holds fewer free slots than requested.
    #[error("insufficient capacity: need {need}, have {have}")]
    InsufficientCapacity {
        /// Slots requested.
        need: usize,
        /// Slots free.
        have: usize,
    },
    /// The core is already bound.
    #[error("core {0} is not free")]
    CoreNotFree(CoreId),
    /// A bounded wait expired.
    #[error("timed out")]
    Timeout,
    /// A wait was cut short by device removal.
    #[error("interrupted")]
    Interrupted,
    /// The device is suspending or suspended.
    #[error("device suspended")]
    DeviceSuspended,
    /// A layer's buffer fd could not be resolved.
    #[error("buffer resolution failed for {layer:?} fd {fd}")]
    BufferResolution {
        /// Layer whose buffer failed.
        layer: LayerId,
        /// Fd that failed.
        fd: i32,
    },
    /// A buffer could not be mapped onto the bound core.
    #[error("mapping {layer:?} onto core {core} failed")]
    Map {
        /// Layer whose buffer failed.
        layer: LayerId,
        /// Core being programmed.
        core: CoreId,
    },
    /// A release fence could not be created or an acquire fence imported.
    #[error("fence creation failed: {0}")]
    FenceCreation(String),
    /// Enable rules or register validation rejected the command.
    #[error("parameter check failed: {0}")]
    ParamCheck(String),
    /// The caller's buffer is smaller than the structure.
    #[error("buffer too small: got {got}, need {need}")]
    BufferTooSmall {
        /// Bytes supplied.
        got: usize,
        /// Bytes required.
        need: usize,
    },
    /// Reading the caller's command array failed.
    #[error("copy from user failed: {0}")]
    CopyFromUser(String),
    /// Writing results back to the caller failed.
    #[error("copy to user failed: {0}")]
    CopyToUser(String),
    /// The core stayed busy past its execution deadline.
    #[error("core {0} hardware timeout")]
    HardwareTimeout(CoreId),
    /// The core could not be powered up.
    #[error("core {0} enable failed")]
    CoreEnable(CoreId),
    /// Unknown ioctl control code.
    #[error("unknown control code {0}")]
    Ctl(u8),
    /// The worker thread could not be started.
    #[error("worker thread start failed: {0}")]
    Thread(String),
    /// Collaborator failure.
    #[error(transparent)]
    Hal(#[from] HalError),
}

impl GspnError {
    /// Stable code surfaced at the ioctl boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            GspnError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            GspnError::InsufficientCapacity { .. } => ErrorCode::NotEnoughEmptyKcmd,
            GspnError::CoreNotFree(_) => ErrorCode::GetFreeCore,
            GspnError::Timeout => ErrorCode::Timeout,
            GspnError::Interrupted => ErrorCode::Interrupted,
            GspnError::DeviceSuspended => ErrorCode::Suspended,
            GspnError::BufferResolution { .. } => ErrorCode::GetDmabufByFd,
            GspnError::Map { .. } => ErrorCode::IommuMap,
            GspnError::FenceCreation(_) => ErrorCode::FenceCreate,
            GspnError::ParamCheck(_) => ErrorCode::ParamCheck,
            GspnError::BufferTooSmall { .. } => ErrorCode::BufferTooSmall,
            GspnError::CopyFromUser(_) => ErrorCode::CopyFromUser,
            GspnError::CopyToUser(_) => ErrorCode::CopyToUser,
            GspnError::HardwareTimeout(_) => ErrorCode::HardwareTimeout,
            GspnError::CoreEnable(_) => ErrorCode::CoreEnable,
            GspnError::Ctl(_) => ErrorCode::CtlCode,
            GspnError::Thread(_) => ErrorCode::CreateThread,
            GspnError::Hal(err) => match err {
                HalError::UnknownBuffer(_) => ErrorCode::GetDmabufByFd,
                HalError::Map { .. } => ErrorCode::IommuMap,
                HalError::Fence(_) => ErrorCode::FenceCreate,
                HalError::FenceTimeout => ErrorCode::FenceWait,
                HalError::Enable(_) => ErrorCode::CoreEnable,
                HalError::Irq(_) => ErrorCode::CreateThread,
            },
        }
    }
}

impl From<GspnError> for ErrorCode {
    fn from(err: GspnError) -> Self {
        err.code()
    }
}

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, GspnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_map_to_stable_codes() {
        assert_eq!(GspnError::Timeout.code(), ErrorCode::Timeout);
        assert_eq!(
            GspnError::BufferResolution {
                layer: LayerId::L2,
                fd: 9
            }
            .code(),
            ErrorCode::GetDmabufByFd
        );
        assert_eq!(
            GspnError::from(HalError::FenceTimeout).code(),
            ErrorCode::FenceWait
        );
        let code: ErrorCode = GspnError::ParamCheck("ratio".into()).into();
        assert_eq!(code, ErrorCode::ParamCheck);
    }
}
