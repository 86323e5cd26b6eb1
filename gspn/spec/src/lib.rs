//! GSPN command ABI shared by the scheduler engine and its clients.
//!
//! This crate defines the layer descriptors and command struct accepted by
//! `SET_PARAM`, the hardware capability report, the ioctl number layout, the
//! stable error codes surfaced to callers, and the fixed little-endian codec
//! used to move those structs across the user-memory boundary.
#![deny(missing_docs)]

/// Fixed binary layout of commands and capability reports.
pub mod abi;
/// Hardware capability descriptor.
pub mod capability;
/// Ioctl number encoding and the stable error-code set.
pub mod ioctl;
/// Layer descriptors, misc info and the command struct.
pub mod layer;

pub use abi::{AbiError, CAPABILITY_SIZE, CMD_INFO_SIZE};
pub use capability::{Capability, ChipFamily, ScaleLimits, CAPABILITY_MAGIC};
pub use ioctl::{CtlCode, ErrorCode, IoctlRequest, CMD_ARRAY_MAX};
pub use layer::{
    CmdInfo, LayerId, LayerInfo, MiscInfo, PlaneAddr, RunMode, Size, LAYER_COUNT, NO_FD,
    SPLIT_PARTS_MAX,
};
