//! Turning a command into register writes.
//!
//! [`apply_enable_rules`] runs at submission and derives destination enables
//! and the scaling flag. [`validate`] and [`write_registers`] run on the
//! worker once the command is bound to a core. Scaler coefficient tables are
//! generated on demand and kept in a [`CoefCache`].

use gspn_spec::{Capability, CmdInfo, LayerId, RunMode, Size};

use crate::error::{GspnError, Result};
use crate::hal::{regs, CoreId, HardwareRegs};

/// Number of filter phases per table.
pub const PHASES: usize = 8;

/// Sum of the taps of one phase.
pub const COEF_UNITY: i32 = 256;

const HOR_TAPS_MAX: usize = 8;
const VER_TAPS_MAX: usize = 4;

/// Derive destination enables and `scale_en` from the source layers.
pub fn apply_enable_rules(cmd: &mut CmdInfo) -> Result<()> {
    cmd.misc.scale_en = false;
    match cmd.misc.run_mode {
        RunMode::Compose => {
            cmd.layer_mut(LayerId::Des2).layer_en = false;
            if !LayerId::SOURCES.iter().any(|&id| cmd.layer(id).layer_en) {
                return Err(GspnError::ParamCheck("no source layer enabled".into()));
            }
            cmd.layer_mut(LayerId::Des1).layer_en = true;
            let des1 = cmd.layer(LayerId::Des1);
            let input = if cmd.misc.scale_seq == 0 {
                cmd.layer(LayerId::L0).clip_size
            } else {
                des1.work_src_size
            };
            cmd.misc.scale_en = input != des1.scale_out_size;
        }
        RunMode::Dual => {
            let blend = [LayerId::L1, LayerId::L2, LayerId::L3]
                .iter()
                .any(|&id| cmd.layer(id).layer_en);
            cmd.layer_mut(LayerId::Des1).layer_en = blend;
            let l0 = cmd.layer(LayerId::L0);
            let (l0_en, l0_clip) = (l0.layer_en, l0.clip_size);
            cmd.layer_mut(LayerId::Des2).layer_en = l0_en;
            if l0_en {
                cmd.misc.scale_en = l0_clip != cmd.layer(LayerId::Des2).scale_out_size;
            }
        }
    }
    Ok(())
}

/// Source and destination sizes of the scaler for this command.
pub fn scale_geometry(cmd: &CmdInfo) -> (Size, Size) {
    match cmd.misc.run_mode {
        RunMode::Compose => {
            let des1 = cmd.layer(LayerId::Des1);
            let src = if cmd.misc.scale_seq == 0 {
                cmd.layer(LayerId::L0).clip_size
            } else {
                des1.work_src_size
            };
            (src, des1.scale_out_size)
        }
        RunMode::Dual => (
            cmd.layer(LayerId::L0).clip_size,
            cmd.layer(LayerId::Des2).scale_out_size,
        ),
    }
}

/// Check the command against the capability before any register is written.
pub fn validate(cap: &Capability, cmd: &CmdInfo) -> Result<()> {
    for id in LayerId::SOURCES {
        let layer = cmd.layer(id);
        if layer.layer_en && !cap.crop_in_range(layer.clip_size) {
            return Err(GspnError::ParamCheck(format!(
                "{} clip {}x{} outside crop range",
                id.name(),
                layer.clip_size.w,
                layer.clip_size.h
            )));
        }
    }
    if cmd.misc.htap4 > 7 {
        return Err(GspnError::ParamCheck(format!("htap4 {} out of range", cmd.misc.htap4)));
    }
    if !cmd.misc.scale_en {
        return Ok(());
    }

    let (src, dst) = scale_geometry(cmd);
    if !cap.crop_in_range(src) || !cap.out_in_range(dst) {
        return Err(GspnError::ParamCheck(format!(
            "scale {}x{} -> {}x{} outside size range",
            src.w, src.h, dst.w, dst.h
        )));
    }
    let limits = cap.scale_limits(cmd.misc.scale_seq);
    if !limits.allows(src.w, dst.w) || !limits.allows(src.h, dst.h) {
        return Err(GspnError::ParamCheck(format!(
            "scale ratio {}x{} -> {}x{} not supported",
            src.w, src.h, dst.w, dst.h
        )));
    }
    let up_w = dst.w > src.w;
    let up_h = dst.h > src.h;
    let down_w = dst.w < src.w;
    let down_h = dst.h < src.h;
    if ((up_w && down_h) || (down_w && up_h)) && !cap.scale_updown_sametime {
        return Err(GspnError::ParamCheck("mixed up and down scaling".into()));
    }
    Ok(())
}

fn misc_word(cmd: &CmdInfo) -> u32 {
    cmd.misc.run_mode.as_raw()
        | (u32::from(cmd.misc.scale_seq & 1) << 1)
        | (u32::from(cmd.misc.scale_en) << 2)
        | (u32::from(cmd.misc.htap4 & 7) << 4)
}

/// Write every layer and misc register for one part of the command.
pub fn write_registers(hw: &dyn HardwareRegs, core: CoreId, cmd: &CmdInfo, part: u32) {
    hw.write(core, regs::MISC, misc_word(cmd));
    hw.write(core, regs::SPLIT, part | (cmd.split_total() << 8));
    for id in LayerId::ALL {
        let layer = cmd.layer(id);
        let i = id.index();
        hw.write(core, regs::layer(i, regs::LAYER_CFG), u32::from(layer.layer_en));
        if !layer.layer_en {
            continue;
        }
        hw.write(core, regs::layer(i, regs::LAYER_ADDR_Y), layer.addr.y);
        hw.write(core, regs::layer(i, regs::LAYER_ADDR_U), layer.addr.u);
        hw.write(core, regs::layer(i, regs::LAYER_ADDR_V), layer.addr.v);
        hw.write(core, regs::layer(i, regs::LAYER_CLIP), layer.clip_size.to_reg());
        hw.write(core, regs::layer(i, regs::LAYER_OUT), layer.scale_out_size.to_reg());
        hw.write(core, regs::layer(i, regs::LAYER_WORK), layer.work_src_size.to_reg());
    }
}

/// Load a coefficient table into the core.
pub fn write_coefficients(hw: &dyn HardwareRegs, core: CoreId, table: &CoefTable) {
    for (i, word) in table.iter().enumerate() {
        hw.write(core, regs::COEF_TAB + (i as u32) * 4, *word);
    }
}

/// Start the programmed core.
pub fn trigger(hw: &dyn HardwareRegs, core: CoreId) {
    hw.write(core, regs::CTRL, regs::CTRL_TRIGGER);
}

/// Horizontal and vertical tap counts for an `htap4` code.
pub fn taps(htap4: u8) -> (usize, usize) {
    match htap4 {
        0 => (8, 4),
        1 => (4, 4),
        2 => (6, 4),
        3 => (2, 4),
        4 => (8, 2),
        5 => (4, 2),
        6 => (6, 2),
        7 => (2, 2),
        _ => (8, 4),
    }
}

/// Pre-decimation shift applied before large downscales.
pub fn decimation_order(src: u16, dst: u16) -> u32 {
    let (src, dst) = (u32::from(src), u32::from(dst));
    if dst * 4 < src && src <= dst * 8 {
        1
    } else if dst * 8 < src && src <= dst * 16 {
        2
    } else {
        0
    }
}

/// Packed coefficient table as loaded into [`regs::COEF_TAB`].
pub type CoefTable = [u32; regs::COEF_WORDS];

/// Inputs that fully determine a coefficient table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoefKey {
    /// Scaler input size after decimation.
    pub src: Size,
    /// Scaler output size.
    pub dst: Size,
    /// Horizontal taps.
    pub hor_taps: u8,
    /// Vertical taps.
    pub ver_taps: u8,
}

impl CoefKey {
    /// Key for a command that needs scaling.
    pub fn for_cmd(cmd: &CmdInfo) -> Self {
        let (src, dst) = scale_geometry(cmd);
        let order_h = decimation_order(src.w, dst.w);
        let order_v = decimation_order(src.h, dst.h);
        let (hor, ver) = taps(cmd.misc.htap4);
        Self {
            src: Size::new(src.w >> order_h, src.h >> order_v),
            dst,
            hor_taps: hor as u8,
            ver_taps: ver as u8,
        }
    }
}

// Triangle kernel widened by the downscale factor, normalised to COEF_UNITY.
fn phase_taps(taps: usize, src: u16, dst: u16, phase: usize, out: &mut [i32]) {
    let factor = if dst == 0 {
        1.0
    } else {
        (f64::from(src) / f64::from(dst)).clamp(1.0, taps as f64 / 2.0)
    };
    let frac = phase as f64 / PHASES as f64;
    let center = taps as f64 / 2.0 - 1.0;
    let mut weights = [0f64; HOR_TAPS_MAX];
    for (k, weight) in weights.iter_mut().take(taps).enumerate() {
        let distance = (k as f64 - center - frac).abs() / factor;
        *weight = (1.0 - distance).max(0.0);
    }
    let sum: f64 = weights.iter().take(taps).sum();
    let mut total = 0;
    for k in 0..taps {
        let w = if sum > 0.0 {
            (weights[k] / sum * f64::from(COEF_UNITY)).round() as i32
        } else {
            0
        };
        out[k] = w;
        total += w;
    }
    // Rounding residue goes to the tap nearest the sample point.
    let anchor = (center + frac).round() as usize;
    out[anchor.min(taps - 1)] += COEF_UNITY - total;
}

fn pack(a: i32, b: i32) -> u32 {
    (a as i16 as u16 as u32) | ((b as i16 as u16 as u32) << 16)
}

/// Build the 48-word table: 8 phases of 8 horizontal taps then 8 phases of 4 vertical taps.
pub fn generate_coefficients(key: &CoefKey) -> CoefTable {
    let mut table = [0u32; regs::COEF_WORDS];
    let hor = usize::from(key.hor_taps).clamp(2, HOR_TAPS_MAX);
    let ver = usize::from(key.ver_taps).clamp(2, VER_TAPS_MAX);
    let mut word = 0;
    for phase in 0..PHASES {
        let mut coef = [0i32; HOR_TAPS_MAX];
        // Narrower filters are centred inside the 8-tap slot.
        let pad = (HOR_TAPS_MAX - hor) / 2;
        phase_taps(hor, key.src.w, key.dst.w, phase, &mut coef[pad..pad + hor]);
        for pair in coef.chunks_exact(2) {
            table[word] = pack(pair[0], pair[1]);
            word += 1;
        }
    }
    for phase in 0..PHASES {
        let mut coef = [0i32; VER_TAPS_MAX];
        let pad = (VER_TAPS_MAX - ver) / 2;
        phase_taps(ver, key.src.h, key.dst.h, phase, &mut coef[pad..pad + ver]);
        for pair in coef.chunks_exact(2) {
            table[word] = pack(pair[0], pair[1]);
            word += 1;
        }
    }
    table
}

#[derive(Debug)]
struct CoefEntry {
    key: CoefKey,
    table: Box<CoefTable>,
    last_use: u64,
}

/// Fixed set of coefficient tables reused across commands.
#[derive(Debug)]
pub struct CoefCache {
    entries: Vec<Option<CoefEntry>>,
    free: Vec<usize>,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl CoefCache {
    /// Cache with `capacity` table slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            tick: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Cached table for `key`, generating it into a free or least recently used slot on a miss.
    pub fn get(&mut self, key: &CoefKey) -> &CoefTable {
        self.tick += 1;
        let tick = self.tick;
        let found = self
            .entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.key == *key));
        let index = match found {
            Some(index) => {
                self.hits += 1;
                index
            }
            None => {
                self.misses += 1;
                let index = self.free.pop().unwrap_or_else(|| self.least_recent());
                self.entries[index] = None;
                index
            }
        };
        let entry = self.entries[index].get_or_insert_with(|| CoefEntry {
            key: *key,
            table: Box::new(generate_coefficients(key)),
            last_use: tick,
        });
        entry.last_use = tick;
        &entry.table
    }

    fn least_recent(&self) -> usize {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i, e.last_use)))
            .min_by_key(|&(_, last_use)| last_use)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Drop every table so the next lookups regenerate.
    pub fn invalidate(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = None;
        }
        self.free = (0..self.entries.len()).rev().collect();
    }

    /// Tables currently held.
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    /// Whether no table is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookups served from the cache.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Lookups that generated a table.
    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gspn_spec::LayerInfo;

    fn compose(l0: Size, out: Size) -> CmdInfo {
        let mut cmd = CmdInfo::default();
        *cmd.layer_mut(LayerId::L0) = LayerInfo {
            layer_en: true,
            share_fd: 3,
            clip_size: l0,
            ..LayerInfo::default()
        };
        cmd.layer_mut(LayerId::Des1).scale_out_size = out;
        cmd
    }

    fn unpack(word: u32) -> (i32, i32) {
        ((word & 0xFFFF) as u16 as i16 as i32, (word >> 16) as u16 as i16 as i32)
    }

    #[test]
    fn compose_enables_des1_and_detects_scaling() {
        let mut cmd = compose(Size::new(640, 480), Size::new(640, 480));
        cmd.layer_mut(LayerId::Des2).layer_en = true;
        apply_enable_rules(&mut cmd).unwrap();
        assert!(cmd.layer(LayerId::Des1).layer_en);
        assert!(!cmd.layer(LayerId::Des2).layer_en);
        assert!(!cmd.misc.scale_en);

        let mut cmd = compose(Size::new(640, 480), Size::new(1280, 960));
        apply_enable_rules(&mut cmd).unwrap();
        assert!(cmd.misc.scale_en);
    }

    #[test]
    fn compose_seq1_compares_work_source() {
        let mut cmd = compose(Size::new(640, 480), Size::new(320, 240));
        cmd.misc.scale_seq = 1;
        cmd.layer_mut(LayerId::Des1).work_src_size = Size::new(320, 240);
        apply_enable_rules(&mut cmd).unwrap();
        assert!(!cmd.misc.scale_en);
    }

    #[test]
    fn compose_without_sources_is_rejected() {
        let mut cmd = CmdInfo::default();
        assert!(matches!(
            apply_enable_rules(&mut cmd),
            Err(GspnError::ParamCheck(_))
        ));
    }

    #[test]
    fn dual_routes_l0_to_des2() {
        let mut cmd = compose(Size::new(640, 480), Size::default());
        cmd.misc.run_mode = RunMode::Dual;
        cmd.layer_mut(LayerId::Des2).scale_out_size = Size::new(320, 240);
        apply_enable_rules(&mut cmd).unwrap();
        assert!(!cmd.layer(LayerId::Des1).layer_en);
        assert!(cmd.layer(LayerId::Des2).layer_en);
        assert!(cmd.misc.scale_en);

        cmd.layer_mut(LayerId::L2).layer_en = true;
        apply_enable_rules(&mut cmd).unwrap();
        assert!(cmd.layer(LayerId::Des1).layer_en);
    }

    #[test]
    fn validation_enforces_ratio_limits() {
        let cap = Capability::for_chip(0);
        let mut ok = compose(Size::new(640, 480), Size::new(1280, 960));
        apply_enable_rules(&mut ok).unwrap();
        validate(&cap, &ok).unwrap();

        let mut too_far = compose(Size::new(100, 100), Size::new(800, 100));
        apply_enable_rules(&mut too_far).unwrap();
        assert!(matches!(validate(&cap, &too_far), Err(GspnError::ParamCheck(_))));

        let mut tiny = compose(Size::new(2, 2), Size::new(2, 2));
        apply_enable_rules(&mut tiny).unwrap();
        assert!(validate(&cap, &tiny).is_err());
    }

    #[test]
    fn mixed_scaling_depends_on_capability() {
        let mut cap = Capability::for_chip(0);
        let mut cmd = compose(Size::new(640, 480), Size::new(800, 240));
        apply_enable_rules(&mut cmd).unwrap();
        validate(&cap, &cmd).unwrap();
        cap.scale_updown_sametime = false;
        assert!(validate(&cap, &cmd).is_err());
    }

    #[test]
    fn tap_table_and_decimation() {
        assert_eq!(taps(0), (8, 4));
        assert_eq!(taps(6), (6, 2));
        assert_eq!(taps(200), (8, 4));
        assert_eq!(decimation_order(400, 100), 0);
        assert_eq!(decimation_order(401, 100), 1);
        assert_eq!(decimation_order(800, 100), 1);
        assert_eq!(decimation_order(1600, 100), 2);
        assert_eq!(decimation_order(1601, 100), 0);
    }

    #[test]
    fn every_phase_sums_to_unity() {
        let key = CoefKey {
            src: Size::new(1920, 1080),
            dst: Size::new(640, 360),
            hor_taps: 6,
            ver_taps: 2,
        };
        let table = generate_coefficients(&key);
        for phase in 0..PHASES {
            let sum: i32 = table[phase * 4..phase * 4 + 4]
                .iter()
                .map(|&w| {
                    let (a, b) = unpack(w);
                    a + b
                })
                .sum();
            assert_eq!(sum, COEF_UNITY, "horizontal phase {phase}");
        }
        for phase in 0..PHASES {
            let at = 32 + phase * 2;
            let sum: i32 = table[at..at + 2]
                .iter()
                .map(|&w| {
                    let (a, b) = unpack(w);
                    a + b
                })
                .sum();
            assert_eq!(sum, COEF_UNITY, "vertical phase {phase}");
        }
    }

    #[test]
    fn cache_reuses_and_evicts_least_recent() {
        let mut cache = CoefCache::new(2);
        let key = |w| CoefKey {
            src: Size::new(w, 100),
            dst: Size::new(50, 50),
            hor_taps: 8,
            ver_taps: 4,
        };
        cache.get(&key(100));
        cache.get(&key(200));
        cache.get(&key(100));
        assert_eq!((cache.hits(), cache.misses()), (1, 2));
        cache.get(&key(300));
        assert_eq!(cache.len(), 2);
        cache.get(&key(100));
        assert_eq!(cache.hits(), 2);
        cache.get(&key(200));
        assert_eq!(cache.misses(), 4);

        cache.invalidate();
        assert!(cache.is_empty());
    }

    #[test]
    fn registers_follow_the_layer_map() {
        use crate::sim::SimHardware;
        let hw = SimHardware::new(1, 0x9631_0000);
        let mut cmd = compose(Size::new(64, 64), Size::new(64, 64));
        cmd.layer_mut(LayerId::L0).addr.y = 0xA000;
        apply_enable_rules(&mut cmd).unwrap();
        write_registers(&hw, 0, &cmd, 0);
        assert_eq!(hw.read(0, regs::layer(0, regs::LAYER_ADDR_Y)), 0xA000);
        assert_eq!(hw.read(0, regs::layer(4, regs::LAYER_CFG)), 1);
        assert_eq!(hw.read(0, regs::layer(5, regs::LAYER_CFG)), 0);
        assert_eq!(hw.read(0, regs::SPLIT), 1 << 8);
    }
}
