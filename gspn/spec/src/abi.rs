//! Little-endian word layout of the structures that cross the ioctl boundary.
//!
//! Every field occupies one 32-bit word; sizes pack width in the low half and
//! height in the high half. Reserved words are written as zero and ignored on
//! decode.

use thiserror::Error;

use crate::capability::{Capability, ScaleLimits};
use crate::layer::{CmdInfo, LayerInfo, MiscInfo, PlaneAddr, RunMode, Size, LAYER_COUNT};

const WORD: usize = 4;
const LAYER_WORDS: usize = 16;
const MISC_WORDS: usize = 8;
const CAPABILITY_WORDS: usize = 25;

/// Encoded size of one layer descriptor.
pub const LAYER_INFO_SIZE: usize = LAYER_WORDS * WORD;

/// Encoded size of one command.
pub const CMD_INFO_SIZE: usize = LAYER_COUNT * LAYER_INFO_SIZE + MISC_WORDS * WORD;

/// Encoded size of the capability report.
pub const CAPABILITY_SIZE: usize = CAPABILITY_WORDS * WORD;

// Word index of the release fence inside a layer descriptor.
const RLS_FENCE_WORD: usize = 8;

/// Codec failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AbiError {
    /// Input shorter than the structure.
    #[error("short buffer: got {got} bytes, need {need}")]
    Short {
        /// Bytes available.
        got: usize,
        /// Bytes required.
        need: usize,
    },
    /// A field holds a value outside its domain.
    #[error("field {field} out of range: {value:#x}")]
    Range {
        /// Field name.
        field: &'static str,
        /// Raw value found.
        value: u32,
    },
}

struct Writer<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        Self { out, pos: 0 }
    }

    fn word(&mut self, value: u32) {
        self.out[self.pos..self.pos + WORD].copy_from_slice(&value.to_le_bytes());
        self.pos += WORD;
    }

    fn int(&mut self, value: i32) {
        self.word(value as u32);
    }

    fn flag(&mut self, value: bool) {
        self.word(u32::from(value));
    }

    fn size(&mut self, value: Size) {
        self.word(value.to_reg());
    }

    fn reserved(&mut self, words: usize) {
        for _ in 0..words {
            self.word(0);
        }
    }
}

struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn word(&mut self) -> u32 {
        let mut bytes = [0u8; WORD];
        bytes.copy_from_slice(&self.input[self.pos..self.pos + WORD]);
        self.pos += WORD;
        u32::from_le_bytes(bytes)
    }

    fn int(&mut self) -> i32 {
        self.word() as i32
    }

    fn flag(&mut self) -> bool {
        self.word() != 0
    }

    fn size(&mut self) -> Size {
        let raw = self.word();
        Size::new((raw & 0xFFFF) as u16, (raw >> 16) as u16)
    }

    fn byte(&mut self, field: &'static str) -> Result<u8, AbiError> {
        let value = self.word();
        u8::try_from(value).map_err(|_| AbiError::Range { field, value })
    }

    fn skip(&mut self, words: usize) {
        self.pos += words * WORD;
    }
}

fn check_len(got: usize, need: usize) -> Result<(), AbiError> {
    if got < need {
        return Err(AbiError::Short { got, need });
    }
    Ok(())
}

fn write_layer(w: &mut Writer<'_>, layer: &LayerInfo) {
    w.flag(layer.layer_en);
    w.int(layer.share_fd);
    w.word(layer.uv_offset);
    w.word(layer.v_offset);
    w.size(layer.clip_size);
    w.size(layer.scale_out_size);
    w.size(layer.work_src_size);
    w.int(layer.acq_fen_fd);
    w.int(layer.rls_fen_fd);
    w.word(layer.addr.y);
    w.word(layer.addr.u);
    w.word(layer.addr.v);
    w.reserved(LAYER_WORDS - 12);
}

fn read_layer(r: &mut Reader<'_>) -> LayerInfo {
    let layer = LayerInfo {
        layer_en: r.flag(),
        share_fd: r.int(),
        uv_offset: r.word(),
        v_offset: r.word(),
        clip_size: r.size(),
        scale_out_size: r.size(),
        work_src_size: r.size(),
        acq_fen_fd: r.int(),
        rls_fen_fd: r.int(),
        addr: PlaneAddr {
            y: r.word(),
            u: r.word(),
            v: r.word(),
        },
    };
    r.skip(LAYER_WORDS - 12);
    layer
}

impl CmdInfo {
    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; CMD_INFO_SIZE];
        // Length is exact, cannot fail.
        let _ = self.encode_into(&mut out);
        out
    }

    /// Encode into the first [`CMD_INFO_SIZE`] bytes of `out`.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), AbiError> {
        check_len(out.len(), CMD_INFO_SIZE)?;
        let mut w = Writer::new(out);
        for layer in self.layers.iter() {
            write_layer(&mut w, layer);
        }
        w.word(self.misc.run_mode.as_raw());
        w.word(u32::from(self.misc.scale_seq));
        w.flag(self.misc.scale_en);
        w.word(u32::from(self.misc.htap4));
        w.flag(self.misc.async_flag);
        w.word(u32::from(self.misc.split_parts));
        w.reserved(MISC_WORDS - 6);
        Ok(())
    }

    /// Decode from the first [`CMD_INFO_SIZE`] bytes of `input`.
    pub fn decode(input: &[u8]) -> Result<Self, AbiError> {
        check_len(input.len(), CMD_INFO_SIZE)?;
        let mut r = Reader::new(input);
        let mut cmd = CmdInfo::default();
        for layer in cmd.layers.iter_mut() {
            *layer = read_layer(&mut r);
        }
        let run_mode = r.word();
        cmd.misc = MiscInfo {
            run_mode: RunMode::from_raw(run_mode).ok_or(AbiError::Range {
                field: "run_mode",
                value: run_mode,
            })?,
            scale_seq: r.byte("scale_seq")?,
            scale_en: r.flag(),
            htap4: r.byte("htap4")?,
            async_flag: r.flag(),
            split_parts: r.byte("split_parts")?,
        };
        Ok(cmd)
    }
}

/// Decode `count` consecutive commands.
pub fn decode_cmd_array(input: &[u8], count: usize) -> Result<Vec<CmdInfo>, AbiError> {
    check_len(input.len(), count * CMD_INFO_SIZE)?;
    input
        .chunks_exact(CMD_INFO_SIZE)
        .take(count)
        .map(CmdInfo::decode)
        .collect()
}

/// Encode a command array into one contiguous buffer.
pub fn encode_cmd_array(cmds: &[CmdInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(cmds.len() * CMD_INFO_SIZE);
    for cmd in cmds {
        out.extend_from_slice(&cmd.encode());
    }
    out
}

/// Overwrite only the release-fence words of command `index` inside an array.
///
/// Other fields the caller may have changed since the copy-in stay untouched.
pub fn patch_release_fences(out: &mut [u8], index: usize, cmd: &CmdInfo) -> Result<(), AbiError> {
    let base = index * CMD_INFO_SIZE;
    check_len(out.len(), base + CMD_INFO_SIZE)?;
    for (i, layer) in cmd.layers.iter().enumerate() {
        let at = base + i * LAYER_INFO_SIZE + RLS_FENCE_WORD * WORD;
        out[at..at + WORD].copy_from_slice(&layer.rls_fen_fd.to_le_bytes());
    }
    Ok(())
}

impl Capability {
    /// Encode into the first [`CAPABILITY_SIZE`] bytes of `out`.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), AbiError> {
        check_len(out.len(), CAPABILITY_SIZE)?;
        let mut w = Writer::new(out);
        w.word(self.magic);
        w.word(self.version);
        w.word(self.max_layer_cnt);
        w.word(self.max_yuv_layer_cnt);
        w.word(self.max_scale_layer_cnt);
        w.word(self.seq0.up);
        w.word(self.seq0.down);
        w.word(self.seq1.up);
        w.word(self.seq1.down);
        w.flag(self.scale_updown_sametime);
        w.flag(self.src_yuv_xywh_even_limit);
        w.word(self.max_video_size);
        w.word(self.addr_type_support);
        w.word(self.std_support_in);
        w.word(self.std_support_out);
        w.flag(self.block_alpha_limit);
        w.word(self.max_throughput);
        w.size(self.crop_min);
        w.size(self.crop_max);
        w.size(self.out_min);
        w.size(self.out_max);
        w.reserved(CAPABILITY_WORDS - 21);
        Ok(())
    }

    /// Decode from the first [`CAPABILITY_SIZE`] bytes of `input`.
    pub fn decode(input: &[u8]) -> Result<Self, AbiError> {
        check_len(input.len(), CAPABILITY_SIZE)?;
        let mut r = Reader::new(input);
        Ok(Self {
            magic: r.word(),
            version: r.word(),
            max_layer_cnt: r.word(),
            max_yuv_layer_cnt: r.word(),
            max_scale_layer_cnt: r.word(),
            seq0: ScaleLimits {
                up: r.word(),
                down: r.word(),
            },
            seq1: ScaleLimits {
                up: r.word(),
                down: r.word(),
            },
            scale_updown_sametime: r.flag(),
            src_yuv_xywh_even_limit: r.flag(),
            max_video_size: r.word(),
            addr_type_support: r.word(),
            std_support_in: r.word(),
            std_support_out: r.word(),
            block_alpha_limit: r.flag(),
            max_throughput: r.word(),
            crop_min: r.size(),
            crop_max: r.size(),
            out_min: r.size(),
            out_max: r.size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerId;

    fn sample() -> CmdInfo {
        let mut cmd = CmdInfo::default();
        let l0 = cmd.layer_mut(LayerId::L0);
        l0.layer_en = true;
        l0.share_fd = 11;
        l0.uv_offset = 0x1000;
        l0.clip_size = Size::new(640, 480);
        l0.acq_fen_fd = 40;
        let des = cmd.layer_mut(LayerId::Des1);
        des.layer_en = true;
        des.share_fd = 12;
        des.scale_out_size = Size::new(1280, 720);
        cmd.misc.run_mode = RunMode::Dual;
        cmd.misc.htap4 = 5;
        cmd.misc.split_parts = 2;
        cmd
    }

    #[test]
    fn sizes_are_word_aligned() {
        assert_eq!(CMD_INFO_SIZE, 416);
        assert_eq!(CAPABILITY_SIZE, 100);
    }

    #[test]
    fn command_survives_the_user_boundary() {
        let cmd = sample();
        let bytes = cmd.encode();
        assert_eq!(CmdInfo::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn short_input_is_rejected() {
        let bytes = sample().encode();
        let err = CmdInfo::decode(&bytes[..CMD_INFO_SIZE - 1]).unwrap_err();
        assert_eq!(
            err,
            AbiError::Short {
                got: CMD_INFO_SIZE - 1,
                need: CMD_INFO_SIZE
            }
        );
        assert!(decode_cmd_array(&bytes, 2).is_err());
    }

    #[test]
    fn bad_run_mode_is_rejected() {
        let mut bytes = sample().encode();
        let at = LAYER_COUNT * LAYER_INFO_SIZE;
        bytes[at..at + 4].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            CmdInfo::decode(&bytes),
            Err(AbiError::Range { field: "run_mode", value: 9 })
        ));
    }

    #[test]
    fn fence_patch_touches_only_release_fds() {
        let original = [sample(), CmdInfo::default()];
        let mut bytes = encode_cmd_array(&original);
        let mut updated = original[1];
        updated.layer_mut(LayerId::Des1).rls_fen_fd = 77;
        updated.layer_mut(LayerId::L0).share_fd = 999;
        patch_release_fences(&mut bytes, 1, &updated).unwrap();

        let decoded = decode_cmd_array(&bytes, 2).unwrap();
        assert_eq!(decoded[0], original[0]);
        assert_eq!(decoded[1].layer(LayerId::Des1).rls_fen_fd, 77);
        assert_eq!(decoded[1].layer(LayerId::L0).share_fd, -1);
    }

    #[test]
    fn capability_survives_the_user_boundary() {
        let cap = Capability::for_chip(0x9631_0000);
        let mut bytes = [0u8; CAPABILITY_SIZE];
        cap.encode_into(&mut bytes).unwrap();
        assert_eq!(Capability::decode(&bytes).unwrap(), cap);
        assert!(cap.encode_into(&mut bytes[..10]).is_err());
    }
}
