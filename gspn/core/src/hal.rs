use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Index of a hardware core.
pub type CoreId = usize;

/// Opaque reference to a resolved buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Address of a buffer inside one core's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress(pub u32);

/// Opaque reference to a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub u64);

/// Opaque reference to a synchronization timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimelineHandle(pub u64);

/// Snapshot of the two programmable sub-block busy bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusyBits {
    /// First sub-block (blender).
    pub mod1: bool,
    /// Second sub-block (scaler).
    pub mod2: bool,
}

impl BusyBits {
    /// Either sub-block is still running.
    pub fn any(self) -> bool {
        self.mod1 || self.mod2
    }
}

/// Interrupt callback registered per core.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Collaborator failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HalError {
    /// The fd does not name a buffer.
    #[error("buffer fd {0} cannot be resolved")]
    UnknownBuffer(i32),
    /// Mapping into a core's address space failed.
    #[error("mapping buffer {handle} onto core {core} failed")]
    Map {
        /// Target core.
        core: CoreId,
        /// Buffer being mapped.
        handle: u64,
    },
    /// Fence or timeline operation failed.
    #[error("fence error: {0}")]
    Fence(String),
    /// A fence did not signal in time.
    #[error("fence wait timed out")]
    FenceTimeout,
    /// The core refused to power up.
    #[error("core {0} enable failed")]
    Enable(CoreId),
    /// The interrupt line could not be claimed.
    #[error("irq request for core {0} failed")]
    Irq(CoreId),
}

/// DMA-buffer style provider.
pub trait BufferProvider: Send + Sync {
    /// Take a reference on the buffer behind `fd`.
    fn resolve(&self, fd: i32) -> Result<BufferHandle, HalError>;
    /// Map a resolved buffer into `core`'s address space.
    fn map(&self, core: CoreId, handle: &BufferHandle) -> Result<DeviceAddress, HalError>;
    /// Undo [`BufferProvider::map`].
    fn unmap(&self, core: CoreId, handle: &BufferHandle);
    /// Drop the reference taken by [`BufferProvider::resolve`].
    fn release(&self, handle: BufferHandle);
}

/// Sync-timeline style fence provider.
pub trait FenceProvider: Send + Sync {
    /// Create a timeline whose value starts at zero.
    fn create_timeline(&self, name: &str) -> Result<TimelineHandle, HalError>;
    /// Create a fence that signals once `timeline` reaches `target`; returns the handle and its fd.
    fn create_fence(
        &self,
        timeline: &TimelineHandle,
        target: u64,
    ) -> Result<(FenceHandle, i32), HalError>;
    /// Take a reference on a fence passed in by fd.
    fn import(&self, fd: i32) -> Result<FenceHandle, HalError>;
    /// Block until the fence signals or `timeout` elapses.
    fn wait(&self, fence: &FenceHandle, timeout: Duration) -> Result<(), HalError>;
    /// Drop a fence reference.
    fn put(&self, fence: FenceHandle);
    /// Advance the timeline by one, releasing fences that reached their target.
    fn signal(&self, timeline: &TimelineHandle);
    /// Destroy a timeline, releasing every fence still attached to it.
    fn destroy_timeline(&self, timeline: TimelineHandle);
}

/// Register block of the cores.
pub trait HardwareRegs: Send + Sync {
    /// Raw chip id used to derive the capability table.
    fn chip_id(&self) -> u32;
    /// Write one register.
    fn write(&self, core: CoreId, offset: u32, value: u32);
    /// Read one register.
    fn read(&self, core: CoreId, offset: u32) -> u32;
    /// Current busy bits.
    fn busy(&self, core: CoreId) -> BusyBits;
    /// Power and clock the core.
    fn enable(&self, core: CoreId) -> Result<(), HalError>;
    /// Gate the core.
    fn disable(&self, core: CoreId);
    /// Diagnostic register dump as `(offset, value)` pairs.
    fn dump_registers(&self, core: CoreId) -> Vec<(u32, u32)>;
    /// Reset the core's register block after a hang.
    fn try_recover(&self, core: CoreId);
    /// Route the core's completion interrupt to `handler`.
    fn request_irq(&self, core: CoreId, handler: IrqHandler) -> Result<(), HalError>;
}

/// Register map shared by the programming code and the simulated hardware.
pub mod regs {
    /// Control register.
    pub const CTRL: u32 = 0x000;
    /// Trigger bit of [`CTRL`].
    pub const CTRL_TRIGGER: u32 = 1 << 0;
    /// Status register.
    pub const STATUS: u32 = 0x004;
    /// Busy bit of the first sub-block in [`STATUS`].
    pub const STATUS_MOD1_BUSY: u32 = 1 << 0;
    /// Busy bit of the second sub-block in [`STATUS`].
    pub const STATUS_MOD2_BUSY: u32 = 1 << 1;
    /// Misc configuration (run mode, scale settings).
    pub const MISC: u32 = 0x010;
    /// Split part index and total.
    pub const SPLIT: u32 = 0x014;
    /// First layer block.
    pub const LAYER_BASE: u32 = 0x040;
    /// Distance between layer blocks.
    pub const LAYER_STRIDE: u32 = 0x020;
    /// Layer enable word, relative to the layer block.
    pub const LAYER_CFG: u32 = 0x00;
    /// Y plane address, relative to the layer block.
    pub const LAYER_ADDR_Y: u32 = 0x04;
    /// U plane address, relative to the layer block.
    pub const LAYER_ADDR_U: u32 = 0x08;
    /// V plane address, relative to the layer block.
    pub const LAYER_ADDR_V: u32 = 0x0C;
    /// Clip size, relative to the layer block.
    pub const LAYER_CLIP: u32 = 0x10;
    /// Scale output size, relative to the layer block.
    pub const LAYER_OUT: u32 = 0x14;
    /// Work source size, relative to the layer block.
    pub const LAYER_WORK: u32 = 0x18;
    /// Scaler coefficient table.
    pub const COEF_TAB: u32 = 0x200;
    /// Number of words in the coefficient table.
    pub const COEF_WORDS: usize = 48;
    /// One past the last register.
    pub const END: u32 = COEF_TAB + (COEF_WORDS as u32) * 4;

    /// Absolute offset of a register inside layer block `index`.
    pub const fn layer(index: usize, reg: u32) -> u32 {
        LAYER_BASE + (index as u32) * LAYER_STRIDE + reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_blocks_do_not_overlap_the_coefficient_table() {
        let last = regs::layer(gspn_spec::LAYER_COUNT - 1, regs::LAYER_WORK);
        assert!(last < regs::COEF_TAB);
        assert_eq!(regs::layer(1, regs::LAYER_ADDR_Y), 0x064);
    }

    #[test]
    fn busy_bits() {
        assert!(!BusyBits::default().any());
        assert!(BusyBits { mod1: false, mod2: true }.any());
    }
}
