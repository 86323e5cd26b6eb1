use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest command count one `SET_PARAM` call may carry.
pub const CMD_ARRAY_MAX: u32 = 8;

/// Bits of the ioctl type byte holding the command count.
pub const IO_CNT_MASK: u32 = 0x7F;

/// Bit of the ioctl type byte selecting asynchronous submission.
pub const IO_ASYNC_MASK: u32 = 0x80;

const NR_SHIFT: u32 = 0;
const TYPE_SHIFT: u32 = 8;
const SIZE_SHIFT: u32 = 16;
const DIR_SHIFT: u32 = 30;
const SIZE_MASK: u32 = (1 << 14) - 1;
const DIR_READ_WRITE: u32 = 3;

/// Control codes understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtlCode {
    /// Copy the capability report out.
    GetCapability,
    /// Submit `n` commands.
    SetParam,
}

impl CtlCode {
    /// Number carried in the ioctl `nr` field.
    pub fn nr(self) -> u8 {
        match self {
            CtlCode::GetCapability => 0,
            CtlCode::SetParam => 1,
        }
    }

    /// Decode an ioctl `nr` field.
    pub fn from_nr(nr: u8) -> Option<Self> {
        match nr {
            0 => Some(CtlCode::GetCapability),
            1 => Some(CtlCode::SetParam),
            _ => None,
        }
    }
}

/// Decoded ioctl number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoctlRequest {
    /// Raw control code; unknown values are kept so the device can reject them.
    pub nr: u8,
    /// Number of commands for `SET_PARAM`.
    pub count: u32,
    /// Asynchronous submission.
    pub async_flag: bool,
    /// Size of the user parameter block in bytes.
    pub param_size: u32,
}

impl IoctlRequest {
    /// Request the capability report into a block of `param_size` bytes.
    pub fn get_capability(param_size: u32) -> Self {
        Self {
            nr: CtlCode::GetCapability.nr(),
            count: 0,
            async_flag: false,
            param_size,
        }
    }

    /// Submit `count` commands whose encoded size is `param_size`.
    pub fn set_param(count: u32, async_flag: bool, param_size: u32) -> Self {
        Self {
            nr: CtlCode::SetParam.nr(),
            count,
            async_flag,
            param_size,
        }
    }

    /// Control code, if known.
    pub fn ctl_code(&self) -> Option<CtlCode> {
        CtlCode::from_nr(self.nr)
    }

    /// Pack into a raw ioctl number.
    pub fn encode(&self) -> u32 {
        let ty = (self.count & IO_CNT_MASK) | if self.async_flag { IO_ASYNC_MASK } else { 0 };
        (DIR_READ_WRITE << DIR_SHIFT)
            | ((self.param_size & SIZE_MASK) << SIZE_SHIFT)
            | (ty << TYPE_SHIFT)
            | (u32::from(self.nr) << NR_SHIFT)
    }

    /// Unpack a raw ioctl number.
    pub fn decode(raw: u32) -> Self {
        let ty = (raw >> TYPE_SHIFT) & 0xFF;
        Self {
            nr: ((raw >> NR_SHIFT) & 0xFF) as u8,
            count: ty & IO_CNT_MASK,
            async_flag: ty & IO_ASYNC_MASK != 0,
            param_size: (raw >> SIZE_SHIFT) & SIZE_MASK,
        }
    }
}

/// Stable error codes returned across the ioctl boundary.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Requested geometry or flags rejected.
    #[error("parameter check failed")]
    ParamCheck,
    /// Reading the user block failed.
    #[error("copy from user failed")]
    CopyFromUser,
    /// Writing the user block failed.
    #[error("copy to user failed")]
    CopyToUser,
    /// User block smaller than the structure.
    #[error("buffer too small")]
    BufferTooSmall,
    /// Pool did not have enough free command slots in time.
    #[error("not enough empty command slots")]
    NotEnoughEmptyKcmd,
    /// No core could accept the command.
    #[error("no free core")]
    GetFreeCore,
    /// Mapping a buffer into a core's address space failed.
    #[error("iommu map failed")]
    IommuMap,
    /// A buffer fd could not be resolved.
    #[error("get dmabuf by fd failed")]
    GetDmabufByFd,
    /// Unknown control code.
    #[error("unknown control code")]
    CtlCode,
    /// Worker thread could not be started.
    #[error("create thread failed")]
    CreateThread,
    /// A bounded wait expired.
    #[error("timeout")]
    Timeout,
    /// A wait was interrupted.
    #[error("interrupted")]
    Interrupted,
    /// Device is suspending.
    #[error("device suspended")]
    Suspended,
    /// Creating a release fence failed.
    #[error("fence create failed")]
    FenceCreate,
    /// Waiting on an acquire fence failed.
    #[error("fence wait failed")]
    FenceWait,
    /// Malformed request.
    #[error("invalid argument")]
    InvalidArgument,
    /// Hardware stayed busy past the execution deadline.
    #[error("hardware timeout")]
    HardwareTimeout,
    /// Enabling a core failed.
    #[error("core enable failed")]
    CoreEnable,
}

impl ErrorCode {
    const ALL: [ErrorCode; 18] = [
        ErrorCode::ParamCheck,
        ErrorCode::CopyFromUser,
        ErrorCode::CopyToUser,
        ErrorCode::BufferTooSmall,
        ErrorCode::NotEnoughEmptyKcmd,
        ErrorCode::GetFreeCore,
        ErrorCode::IommuMap,
        ErrorCode::GetDmabufByFd,
        ErrorCode::CtlCode,
        ErrorCode::CreateThread,
        ErrorCode::Timeout,
        ErrorCode::Interrupted,
        ErrorCode::Suspended,
        ErrorCode::FenceCreate,
        ErrorCode::FenceWait,
        ErrorCode::InvalidArgument,
        ErrorCode::HardwareTimeout,
        ErrorCode::CoreEnable,
    ];

    /// Negative value returned from the ioctl.
    pub fn as_raw(self) -> i32 {
        let position = Self::ALL
            .iter()
            .position(|code| *code == self)
            .unwrap_or(Self::ALL.len() - 1);
        -(position as i32 + 1)
    }

    /// Decode a raw ioctl return value; `0` and unknown values yield `None`.
    pub fn from_raw(raw: i32) -> Option<Self> {
        let index = raw.checked_neg()?.checked_sub(1)?;
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_number_round_trips() {
        let req = IoctlRequest::set_param(5, true, 2080);
        let decoded = IoctlRequest::decode(req.encode());
        assert_eq!(decoded, req);
        assert_eq!(decoded.ctl_code(), Some(CtlCode::SetParam));
    }

    #[test]
    fn count_and_async_share_the_type_byte() {
        let raw = IoctlRequest::set_param(CMD_ARRAY_MAX, false, 0).encode();
        assert_eq!((raw >> 8) & 0xFF, CMD_ARRAY_MAX);
        let raw = IoctlRequest::set_param(1, true, 0).encode();
        assert_eq!((raw >> 8) & 0xFF, 0x81);
    }

    #[test]
    fn unknown_nr_is_preserved() {
        let raw = IoctlRequest::get_capability(100).encode() | 0x7;
        let decoded = IoctlRequest::decode(raw);
        assert_eq!(decoded.nr, 7);
        assert_eq!(decoded.ctl_code(), None);
    }

    #[test]
    fn error_codes_are_distinct_and_negative() {
        for code in ErrorCode::ALL {
            let raw = code.as_raw();
            assert!(raw < 0);
            assert_eq!(ErrorCode::from_raw(raw), Some(code));
        }
        assert_eq!(ErrorCode::ParamCheck.as_raw(), -1);
        assert_eq!(ErrorCode::from_raw(0), None);
        assert_eq!(ErrorCode::from_raw(-100), None);
        assert_eq!(ErrorCode::from_raw(i32::MIN), None);
    }
}
