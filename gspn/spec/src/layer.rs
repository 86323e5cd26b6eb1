use serde::{Deserialize, Serialize};

/// Number of layer descriptors carried by every command (4 sources, 2 destinations).
pub const LAYER_COUNT: usize = 6;

/// Sentinel marking an unused buffer or fence fd.
pub const NO_FD: i32 = -1;

/// Maximum number of trigger cycles a single command may be split into.
pub const SPLIT_PARTS_MAX: u32 = 4;

/// Position of a layer inside [`CmdInfo::layers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerId {
    /// Source layer 0, the only one that may be scaled.
    L0,
    /// Source layer 1.
    L1,
    /// Source layer 2.
    L2,
    /// Source layer 3.
    L3,
    /// First destination.
    Des1,
    /// Second destination, only used by the dual run mode.
    Des2,
}

impl LayerId {
    /// Every layer in descriptor order.
    pub const ALL: [LayerId; LAYER_COUNT] = [
        LayerId::L0,
        LayerId::L1,
        LayerId::L2,
        LayerId::L3,
        LayerId::Des1,
        LayerId::Des2,
    ];

    /// Source layers in descriptor order.
    pub const SOURCES: [LayerId; 4] = [LayerId::L0, LayerId::L1, LayerId::L2, LayerId::L3];

    /// Destination layers in descriptor order.
    pub const DESTINATIONS: [LayerId; 2] = [LayerId::Des1, LayerId::Des2];

    /// Index of this layer in the descriptor array.
    pub fn index(self) -> usize {
        match self {
            LayerId::L0 => 0,
            LayerId::L1 => 1,
            LayerId::L2 => 2,
            LayerId::L3 => 3,
            LayerId::Des1 => 4,
            LayerId::Des2 => 5,
        }
    }

    /// Whether the layer is an output.
    pub fn is_destination(self) -> bool {
        matches!(self, LayerId::Des1 | LayerId::Des2)
    }

    /// Short lowercase name used in logs and timeline names.
    pub fn name(self) -> &'static str {
        match self {
            LayerId::L0 => "l0",
            LayerId::L1 => "l1",
            LayerId::L2 => "l2",
            LayerId::L3 => "l3",
            LayerId::Des1 => "des1",
            LayerId::Des2 => "des2",
        }
    }
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    /// Width in pixels.
    pub w: u16,
    /// Height in pixels.
    pub h: u16,
}

impl Size {
    /// Construct a size.
    pub const fn new(w: u16, h: u16) -> Self {
        Self { w, h }
    }

    /// Pack into one register word, width in the low half.
    pub fn to_reg(self) -> u32 {
        u32::from(self.w) | (u32::from(self.h) << 16)
    }
}

/// Device addresses of the three planes of a mapped buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneAddr {
    /// Luma (or packed RGB) plane.
    pub y: u32,
    /// First chroma plane.
    pub u: u32,
    /// Second chroma plane.
    pub v: u32,
}

/// One source or destination layer of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerInfo {
    /// Layer participates in the job.
    pub layer_en: bool,
    /// Buffer fd, [`NO_FD`] when the layer carries no buffer.
    pub share_fd: i32,
    /// Offset of the U plane from the Y plane in bytes.
    pub uv_offset: u32,
    /// Offset of the V plane from the Y plane in bytes.
    pub v_offset: u32,
    /// Source crop rectangle size.
    pub clip_size: Size,
    /// Size after scaling.
    pub scale_out_size: Size,
    /// Working source size used by the second scale sequence.
    pub work_src_size: Size,
    /// Fence the hardware waits on before reading this layer.
    pub acq_fen_fd: i32,
    /// Fence signalled when the hardware has finished with this layer.
    pub rls_fen_fd: i32,
    /// Device addresses, filled in when the buffer is mapped.
    pub addr: PlaneAddr,
}

impl Default for LayerInfo {
    fn default() -> Self {
        Self {
            layer_en: false,
            share_fd: NO_FD,
            uv_offset: 0,
            v_offset: 0,
            clip_size: Size::default(),
            scale_out_size: Size::default(),
            work_src_size: Size::default(),
            acq_fen_fd: NO_FD,
            rls_fen_fd: NO_FD,
            addr: PlaneAddr::default(),
        }
    }
}

impl LayerInfo {
    /// True when the buffer-resolution path must run for this layer.
    pub fn has_buffer(&self) -> bool {
        self.layer_en && self.share_fd > 0
    }

    /// True when the layer carries an acquire fence to wait on.
    pub fn has_acquire_fence(&self) -> bool {
        self.layer_en && self.acq_fen_fd >= 0
    }
}

/// How the sources are routed to the destinations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// All enabled sources blend into DES1.
    #[default]
    Compose,
    /// L0 scales into DES2 while L1-L3 blend into DES1.
    Dual,
}

impl RunMode {
    /// Raw ABI value.
    pub fn as_raw(self) -> u32 {
        match self {
            RunMode::Compose => 0,
            RunMode::Dual => 1,
        }
    }

    /// Decode a raw ABI value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(RunMode::Compose),
            1 => Some(RunMode::Dual),
            _ => None,
        }
    }
}

/// Command-wide settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiscInfo {
    /// Routing mode.
    pub run_mode: RunMode,
    /// Scale sequence: 0 scales before blending, 1 after.
    pub scale_seq: u8,
    /// Scaling required; derived by the engine, any user value is overwritten.
    pub scale_en: bool,
    /// Horizontal/vertical tap selection code (0..=7).
    pub htap4: u8,
    /// Completion is reported through release fences instead of blocking.
    pub async_flag: bool,
    /// Number of trigger cycles; 0 and 1 both mean "not split".
    pub split_parts: u8,
}

/// Full command as submitted through `SET_PARAM`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmdInfo {
    /// Layer descriptors indexed by [`LayerId::index`].
    pub layers: [LayerInfo; LAYER_COUNT],
    /// Command-wide settings.
    pub misc: MiscInfo,
}

impl CmdInfo {
    /// Borrow one layer.
    pub fn layer(&self, id: LayerId) -> &LayerInfo {
        &self.layers[id.index()]
    }

    /// Mutably borrow one layer.
    pub fn layer_mut(&mut self, id: LayerId) -> &mut LayerInfo {
        &mut self.layers[id.index()]
    }

    /// Enabled layers in descriptor order.
    pub fn enabled_layers(&self) -> impl Iterator<Item = (LayerId, &LayerInfo)> + '_ {
        LayerId::ALL
            .into_iter()
            .map(move |id| (id, self.layer(id)))
            .filter(|(_, layer)| layer.layer_en)
    }

    /// Number of trigger cycles this command needs.
    pub fn split_total(&self) -> u32 {
        u32::from(self.misc.split_parts).clamp(1, SPLIT_PARTS_MAX)
    }

    /// Reset every fence fd to the sentinel.
    pub fn clear_fences(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.acq_fen_fd = NO_FD;
            layer.rls_fen_fd = NO_FD;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layers_carry_sentinels() {
        let cmd = CmdInfo::default();
        for layer in cmd.layers.iter() {
            assert_eq!(layer.share_fd, NO_FD);
            assert_eq!(layer.acq_fen_fd, NO_FD);
            assert_eq!(layer.rls_fen_fd, NO_FD);
            assert!(!layer.has_buffer());
        }
    }

    #[test]
    fn zero_fd_is_not_a_buffer() {
        let layer = LayerInfo {
            layer_en: true,
            share_fd: 0,
            ..LayerInfo::default()
        };
        assert!(!layer.has_buffer());
    }

    #[test]
    fn split_total_is_clamped() {
        let mut cmd = CmdInfo::default();
        assert_eq!(cmd.split_total(), 1);
        cmd.misc.split_parts = 3;
        assert_eq!(cmd.split_total(), 3);
        cmd.misc.split_parts = 200;
        assert_eq!(cmd.split_total(), SPLIT_PARTS_MAX);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"layers":[{"layer_en":true,"share_fd":7},{},{},{},{},{}]}"#;
        let cmd: CmdInfo = serde_json::from_str(json).unwrap();
        assert!(cmd.layer(LayerId::L0).has_buffer());
        assert_eq!(cmd.layer(LayerId::Des2).share_fd, NO_FD);
        assert_eq!(cmd.misc.run_mode, RunMode::Compose);
    }
}
