use crate::{
    state::{CdbArr, Hdb, LoopMode},
    Player,
};

/// Fixed-point fraction bits of the voice phase accumulator.
const FRACTION_BITS: u32 = 14;
const FRACTION_MASK: u32 = (1 << FRACTION_BITS) - 1;

/// Ticks-per-second reference for burst sizing: `e_clocks` of one tick
/// over this clock gives the tick's real-time length.
const TICK_CLOCK: u64 = 357_955;

/// Mix-buffer capacity in frames; one burst never exceeds it.
const BLOCK: usize = 8192;

/// Accumulates one tick's burst of voice output and shapes it into float
/// frames: low-pass, stereo cross-blend, scale.
pub(crate) struct Mixer {
    e_rem: u64,
    filter_l: i32,
    filter_r: i32,
    acc_l: Vec<i32>,
    acc_r: Vec<i32>,
    out_l: Vec<f32>,
    out_r: Vec<f32>,
    out_pos: usize,
}

impl Mixer {
    pub(crate) fn new() -> Self {
        Self {
            e_rem: 0,
            filter_l: 0,
            filter_r: 0,
            acc_l: vec![0; BLOCK],
            acc_r: vec![0; BLOCK],
            out_l: Vec::with_capacity(BLOCK),
            out_r: Vec::with_capacity(BLOCK),
            out_pos: 0,
        }
    }

    /// Frames of an already-mixed burst still waiting to be drained.
    pub(crate) fn has_pending(&self) -> bool {
        self.out_pos < self.out_l.len()
    }

    /// Throw away any not-yet-drained burst output.
    pub(crate) fn discard_pending(&mut self) {
        self.out_l.clear();
        self.out_r.clear();
        self.out_pos = 0;
    }

    /// Copy pending frames out; returns how many were written.
    pub(crate) fn drain(&mut self, left: &mut [f32], right: &mut [f32]) -> usize {
        let n = (self.out_l.len() - self.out_pos)
            .min(left.len())
            .min(right.len());
        left[..n].copy_from_slice(&self.out_l[self.out_pos..self.out_pos + n]);
        right[..n].copy_from_slice(&self.out_r[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        n
    }

    /// Burst length for one tick of `e_clocks`, with the fractional
    /// remainder carried across ticks so long-run output length tracks
    /// `sum(e_clocks) * rate / 2 / TICK_CLOCK` to within one frame.
    pub(crate) fn burst_len(&mut self, e_clocks: u32, out_rate: u32) -> usize {
        let raw = u64::from(e_clocks) * u64::from(out_rate >> 1);
        self.e_rem += raw % TICK_CLOCK;
        let mut nb = raw / TICK_CLOCK;
        if self.e_rem > TICK_CLOCK {
            nb += 1;
            self.e_rem -= TICK_CLOCK;
        }
        (nb as usize).clamp(1, BLOCK)
    }

    /// Filter, blend, and scale one burst of accumulator content into the
    /// pending float buffers.
    fn postprocess(&mut self, nb: usize, filter_level: u8, blend: bool) {
        if filter_level > 0 {
            let (wi, ws) = match filter_level {
                1 => (3, 1),
                2 => (2, 2),
                _ => (1, 3),
            };
            for i in 0..nb {
                self.filter_l = (self.acc_l[i] * wi + self.filter_l * ws) / 4;
                self.acc_l[i] = self.filter_l;
                self.filter_r = (self.acc_r[i] * wi + self.filter_r * ws) / 4;
                self.acc_r[i] = self.filter_r;
            }
        }
        if blend {
            for i in 0..nb {
                let (l, r) = (self.acc_l[i], self.acc_r[i]);
                self.acc_l[i] = (l * 11 + r * 5) >> 4;
                self.acc_r[i] = (r * 11 + l * 5) >> 4;
            }
        }
        self.out_l.clear();
        self.out_r.clear();
        self.out_pos = 0;
        for i in 0..nb {
            self.out_l
                .push((self.acc_l[i] as f32 / 32_768.0).clamp(-1.0, 1.0));
            self.out_r
                .push((self.acc_r[i] as f32 / 32_768.0).clamp(-1.0, 1.0));
        }
    }
}

impl Player<'_> {
    /// Mix the burst for the tick that just ran: voices 0 and 3..=7 to
    /// the left accumulator, 1 and 2 to the right, then postprocess.
    pub(crate) fn mix_burst(&mut self) {
        let nb = self.mixer.burst_len(self.mdb.e_clocks, self.out_rate);
        let smpl = match &self.module {
            Some(m) => m.samples(),
            None => return,
        };
        self.mixer.acc_l[..nb].fill(0);
        self.mixer.acc_r[..nb].fill(0);
        let over = self.cfg.oversampling;
        if self.multimode {
            for ch in 4..8 {
                if self.ch_on[ch] {
                    mix_voice(
                        &mut self.hdb[ch],
                        &mut self.cdb,
                        smpl,
                        &mut self.mixer.acc_l[..nb],
                        over,
                    );
                }
            }
        } else if self.ch_on[3] {
            mix_voice(
                &mut self.hdb[3],
                &mut self.cdb,
                smpl,
                &mut self.mixer.acc_l[..nb],
                over,
            );
        }
        if self.ch_on[0] {
            mix_voice(
                &mut self.hdb[0],
                &mut self.cdb,
                smpl,
                &mut self.mixer.acc_l[..nb],
                over,
            );
        }
        if self.ch_on[1] {
            mix_voice(
                &mut self.hdb[1],
                &mut self.cdb,
                smpl,
                &mut self.mixer.acc_r[..nb],
                over,
            );
        }
        if self.ch_on[2] {
            mix_voice(
                &mut self.hdb[2],
                &mut self.cdb,
                smpl,
                &mut self.mixer.acc_r[..nb],
                over,
            );
        }
        self.mixer
            .postprocess(nb, self.cfg.filter_level, self.cfg.blend);
    }
}

/// A sample fetch past the bank reads as silence.
fn sample_at(smpl: &[i8], idx: usize) -> i32 {
    smpl.get(idx).map_or(0, |&s| i32::from(s))
}

/// What the loop wrap does besides restarting: in DMA-wait mode it
/// counts the owning controller down and wakes its macro on expiry.
fn on_loop_wrap(hw: &mut Hdb, cdb_arr: &mut CdbArr) -> bool {
    match hw.loop_mode {
        LoopMode::Off => true,
        LoopMode::WaitDma => {
            let c = &mut cdb_arr[hw.owner];
            let prior = c.wait_dma_count;
            c.wait_dma_count = c.wait_dma_count.wrapping_sub(1);
            if prior == 0 {
                hw.loop_mode = LoopMode::Off;
                c.macro_run = -1;
            }
            true
        }
    }
}

/// Resample one voice into an accumulator. The phase accumulator runs in
/// 14-bit fixed point against the current sample window; crossing the end
/// restarts from the saved region or kills the voice when that region is
/// below the minimum playable length.
fn mix_voice(hw: &mut Hdb, cdb_arr: &mut CdbArr, smpl: &[i8], out: &mut [i32], oversample: bool) {
    if hw.sample_start >= smpl.len() && !smpl.is_empty() {
        log::error!("voice sample start {} outside the bank", hw.sample_start);
        hw.sample_start = 0;
    }
    let mut pos = hw.pos;
    let mut delta = hw.delta;
    let mut sbeg = hw.sbeg;
    let mut len = hw.slen << FRACTION_BITS;
    let volume = i32::from(hw.vol.min(0x40));
    if hw.mode & 1 == 0 || len < 0x10000 || (volume == 0 && delta == 0) {
        return;
    }
    if hw.mode & 3 == 1 {
        // just armed: latch the saved region and restart the phase
        sbeg = hw.sample_start;
        hw.slen = hw.sample_len;
        len = hw.slen << FRACTION_BITS;
        pos = 0;
        hw.mode |= 2;
    }
    for sample in out.iter_mut() {
        let pos_real = (pos >> FRACTION_BITS) as usize;
        let v1 = sample_at(smpl, sbeg + pos_real);
        let value = if oversample {
            let v2 = if (pos_real as u32) + 1 < hw.slen {
                sample_at(smpl, sbeg + pos_real + 1)
            } else {
                sample_at(smpl, hw.sample_start)
            };
            v1 + (((v2 - v1) * (pos & FRACTION_MASK) as i32) >> FRACTION_BITS)
        } else {
            v1
        };
        *sample += volume * value;
        pos = pos.wrapping_add(delta);
        if pos < len {
            continue;
        }
        pos -= len;
        sbeg = hw.sample_start;
        hw.slen = hw.sample_len;
        len = hw.slen << FRACTION_BITS;
        if len < 0x10000 || !on_loop_wrap(hw, cdb_arr) {
            delta = 0;
            pos = 0;
            sbeg = 0;
            hw.slen = 0;
            hw.mode = 0;
            break;
        }
    }
    hw.sbeg = sbeg;
    hw.pos = pos;
    hw.delta = delta;
    if hw.mode & 4 != 0 {
        hw.mode = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Cdb;

    fn armed_voice() -> Hdb {
        Hdb {
            mode: 3,
            vol: 0x40,
            slen: 8,
            sample_len: 8,
            ..Hdb::default()
        }
    }

    #[test]
    fn burst_length_tracks_the_clock_ratio() {
        let mut mixer = Mixer::new();
        let mut total: u64 = 0;
        for _ in 0..100 {
            total += mixer.burst_len(14318, 44_100) as u64;
        }
        let expected = 100 * 14318 * (44_100 / 2) / TICK_CLOCK;
        assert!(total.abs_diff(expected) <= 1, "{total} vs {expected}");
    }

    #[test]
    fn burst_length_is_clamped() {
        let mut mixer = Mixer::new();
        assert_eq!(mixer.burst_len(1, 8000), 1);
        let mut mixer = Mixer::new();
        assert_eq!(mixer.burst_len(u32::MAX, 192_000), BLOCK);
    }

    #[test]
    fn blend_applies_the_cross_matrix() {
        let mut mixer = Mixer::new();
        mixer.acc_l[0] = 16_000;
        mixer.acc_r[0] = 0;
        mixer.postprocess(1, 0, true);
        let l = 16_000.0 * 11.0 / 16.0 / 32_768.0;
        let r = 16_000.0 * 5.0 / 16.0 / 32_768.0;
        assert!((mixer.out_l[0] - l).abs() < 1e-6);
        assert!((mixer.out_r[0] - r).abs() < 1e-6);
    }

    #[test]
    fn filter_weights_follow_the_level() {
        for (level, expected) in [(1u8, 3072), (2, 2048), (3, 1024)] {
            let mut mixer = Mixer::new();
            mixer.acc_l[0] = 4096;
            mixer.postprocess(1, level, false);
            assert!(
                (mixer.out_l[0] - expected as f32 / 32_768.0).abs() < 1e-6,
                "level {level}"
            );
        }
    }

    #[test]
    fn output_is_clamped_to_unit_range() {
        let mut mixer = Mixer::new();
        mixer.acc_l[0] = 40_000;
        mixer.acc_r[0] = -40_000;
        mixer.postprocess(1, 0, false);
        assert_eq!(mixer.out_l[0], 1.0);
        assert_eq!(mixer.out_r[0], -1.0);
    }

    #[test]
    fn plain_mix_reads_nearest_sample() {
        let mut hw = armed_voice();
        hw.delta = 1 << FRACTION_BITS;
        let mut cdb = [Cdb::default(); 16];
        let smpl: [i8; 8] = [10, 20, 30, 40, 50, 60, 70, 80];
        let mut out = [0i32; 4];
        mix_voice(&mut hw, &mut cdb, &smpl, &mut out, false);
        assert_eq!(out, [640, 1280, 1920, 2560]);
        assert_eq!(hw.pos, 4 << FRACTION_BITS);
    }

    #[test]
    fn oversampled_mix_interpolates() {
        let mut hw = armed_voice();
        hw.delta = 1 << (FRACTION_BITS - 1);
        let mut cdb = [Cdb::default(); 16];
        let smpl: [i8; 8] = [0, 100, 0, 0, 0, 0, 0, 0];
        let mut out = [0i32; 2];
        mix_voice(&mut hw, &mut cdb, &smpl, &mut out, true);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 50 * 0x40);
    }

    #[test]
    fn loop_wrap_restarts_from_saved_region() {
        let mut hw = armed_voice();
        hw.slen = 4;
        hw.sample_len = 4;
        hw.pos = 3 << FRACTION_BITS;
        hw.delta = 2 << FRACTION_BITS;
        let mut cdb = [Cdb::default(); 16];
        let smpl: [i8; 8] = [1, 2, 3, 4, 0, 0, 0, 0];
        let mut out = [0i32; 2];
        mix_voice(&mut hw, &mut cdb, &smpl, &mut out, false);
        // second fetch happens after the wrap, back inside the region
        assert_eq!(out[0], 4 * 0x40);
        assert_eq!(out[1], 2 * 0x40);
        assert_eq!(hw.mode, 3);
    }

    #[test]
    fn short_region_kills_the_voice_on_wrap() {
        let mut hw = armed_voice();
        hw.slen = 4;
        hw.sample_len = 2; // below the minimum playable length
        hw.pos = 3 << FRACTION_BITS;
        hw.delta = 2 << FRACTION_BITS;
        let mut cdb = [Cdb::default(); 16];
        let smpl: [i8; 8] = [1, 2, 3, 4, 0, 0, 0, 0];
        let mut out = [0i32; 4];
        mix_voice(&mut hw, &mut cdb, &smpl, &mut out, false);
        assert_eq!(hw.mode, 0);
        assert_eq!(hw.delta, 0);
        assert_eq!(hw.slen, 0);
    }

    #[test]
    fn dma_wait_expiry_wakes_the_macro() {
        let mut hw = armed_voice();
        hw.slen = 4;
        hw.sample_len = 4;
        hw.pos = 3 << FRACTION_BITS;
        hw.delta = 2 << FRACTION_BITS;
        hw.loop_mode = LoopMode::WaitDma;
        hw.owner = 5;
        let mut cdb = [Cdb::default(); 16];
        cdb[5].wait_dma_count = 0;
        let smpl: [i8; 8] = [1, 2, 3, 4, 0, 0, 0, 0];
        let mut out = [0i32; 2];
        mix_voice(&mut hw, &mut cdb, &smpl, &mut out, false);
        assert_eq!(cdb[5].macro_run, -1);
        assert_eq!(hw.loop_mode, LoopMode::Off);
    }

    #[test]
    fn disabled_or_silent_voice_is_skipped() {
        let mut cdb = [Cdb::default(); 16];
        let smpl: [i8; 4] = [100, 100, 100, 100];
        let mut out = [0i32; 2];

        let mut hw = armed_voice();
        hw.mode = 0;
        mix_voice(&mut hw, &mut cdb, &smpl, &mut out, false);
        assert_eq!(out, [0, 0]);

        let mut hw = armed_voice();
        hw.vol = 0;
        hw.delta = 0;
        mix_voice(&mut hw, &mut cdb, &smpl, &mut out, false);
        assert_eq!(out, [0, 0]);
    }
}
