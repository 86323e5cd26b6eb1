use serde::{Deserialize, Serialize};

use crate::layer::Size;

/// Marker proving a capability block has been initialised.
pub const CAPABILITY_MAGIC: u32 = 0x4753_504E;

/// Input/output colour standard flag: BT.601 full range.
pub const STD_BT601_FULL: u32 = 1 << 0;
/// Input/output colour standard flag: BT.601 narrow range.
pub const STD_BT601_NARROW: u32 = 1 << 1;

/// Address type flag: buffers are reached through the per-core IOMMU.
pub const ADDR_TYPE_IOVIRTUAL: u32 = 1 << 1;

/// Chip families the capability table knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChipFamily {
    /// 0x9631xxxx parts.
    SharkLt8,
    /// Unknown id, treated like [`ChipFamily::SharkLt8`].
    Baseline,
}

impl ChipFamily {
    /// Classify a raw chip-id register value.
    pub fn from_chip_id(chip_id: u32) -> Self {
        match chip_id & 0xFFFF_0000 {
            0x9631_0000 => ChipFamily::SharkLt8,
            _ => ChipFamily::Baseline,
        }
    }
}

/// Scale ratio bounds for one scale sequence.
///
/// `up` is expressed in 1/64 steps (256 allows 4x enlargement) and `down`
/// in 1/16 steps (1 allows shrinking to 1/16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleLimits {
    /// Largest output/input ratio, in 1/64 units.
    pub up: u32,
    /// Smallest output/input ratio, in 1/16 units.
    pub down: u32,
}

impl ScaleLimits {
    /// Whether scaling one dimension from `input` to `output` pixels is allowed.
    pub fn allows(&self, input: u16, output: u16) -> bool {
        if input == 0 || output == 0 {
            return false;
        }
        let (input, output) = (u64::from(input), u64::from(output));
        output * 64 <= input * u64::from(self.up) && input * u64::from(self.down) <= output * 16
    }
}

/// Hardware capability report returned by `GET_CAPABILITY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// [`CAPABILITY_MAGIC`] once initialised.
    pub magic: u32,
    /// Hardware revision.
    pub version: u32,
    /// Maximum number of source layers per command.
    pub max_layer_cnt: u32,
    /// Maximum number of YUV source layers.
    pub max_yuv_layer_cnt: u32,
    /// Maximum number of scaled layers.
    pub max_scale_layer_cnt: u32,
    /// Scale sequence 0 bounds.
    pub seq0: ScaleLimits,
    /// Scale sequence 1 bounds.
    pub seq1: ScaleLimits,
    /// Up- and down-scaling on different axes of the same layer is allowed.
    pub scale_updown_sametime: bool,
    /// YUV source rectangles must be even.
    pub src_yuv_xywh_even_limit: bool,
    /// Maximum video size class.
    pub max_video_size: u32,
    /// Supported address types.
    pub addr_type_support: u32,
    /// Supported input colour standards.
    pub std_support_in: u32,
    /// Supported output colour standards.
    pub std_support_out: u32,
    /// Block alpha restrictions apply.
    pub block_alpha_limit: bool,
    /// Throughput in megapixels per second.
    pub max_throughput: u32,
    /// Smallest crop rectangle.
    pub crop_min: Size,
    /// Largest crop rectangle.
    pub crop_max: Size,
    /// Smallest output rectangle.
    pub out_min: Size,
    /// Largest output rectangle.
    pub out_max: Size,
}

impl Capability {
    /// Build the capability table for a chip id.
    pub fn for_chip(chip_id: u32) -> Self {
        // Both known paths currently report the same table.
        let (version, block_alpha_limit, max_video_size, max_throughput) =
            match ChipFamily::from_chip_id(chip_id) {
                ChipFamily::SharkLt8 | ChipFamily::Baseline => (0x10, true, 1, 256),
            };
        Self {
            magic: CAPABILITY_MAGIC,
            version,
            max_layer_cnt: 4,
            max_yuv_layer_cnt: 1,
            max_scale_layer_cnt: 1,
            seq0: ScaleLimits { up: 256, down: 1 },
            seq1: ScaleLimits { up: 64, down: 4 },
            scale_updown_sametime: true,
            src_yuv_xywh_even_limit: true,
            max_video_size,
            addr_type_support: ADDR_TYPE_IOVIRTUAL,
            std_support_in: STD_BT601_FULL | STD_BT601_NARROW,
            std_support_out: STD_BT601_FULL | STD_BT601_NARROW,
            block_alpha_limit,
            max_throughput,
            crop_min: Size::new(4, 4),
            crop_max: Size::new(8191, 8191),
            out_min: Size::new(4, 4),
            out_max: Size::new(8191, 8191),
        }
    }

    /// Whether the block has been initialised.
    pub fn is_valid(&self) -> bool {
        self.magic == CAPABILITY_MAGIC
    }

    /// Scale bounds for a scale sequence; anything but 0 selects sequence 1.
    pub fn scale_limits(&self, scale_seq: u8) -> ScaleLimits {
        if scale_seq == 0 {
            self.seq0
        } else {
            self.seq1
        }
    }

    /// Whether `size` lies inside the crop bounds.
    pub fn crop_in_range(&self, size: Size) -> bool {
        in_range(size, self.crop_min, self.crop_max)
    }

    /// Whether `size` lies inside the output bounds.
    pub fn out_in_range(&self, size: Size) -> bool {
        in_range(size, self.out_min, self.out_max)
    }
}

fn in_range(size: Size, min: Size, max: Size) -> bool {
    (min.w..=max.w).contains(&size.w) && (min.h..=max.h).contains(&size.h)
}
