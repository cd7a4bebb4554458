use crate::{
    module::Word,
    state::LoopMode,
    tracks::MAX_OPS_PER_TICK,
    Player,
};

/// Note index (0..=63) to period lookup.
pub(crate) static NOTEVALS: [u16; 64] = [
    0x6AE, 0x64E, 0x5F4, 0x59E, 0x54D, 0x501, 0x4B9, 0x475, 0x435, 0x3F9, 0x3C0, 0x38C, 0x358,
    0x32A, 0x2FC, 0x2D0, 0x2A8, 0x282, 0x25E, 0x23B, 0x21B, 0x1FD, 0x1E0, 0x1C6, 0x1AC, 0x194,
    0x17D, 0x168, 0x154, 0x140, 0x12F, 0x11E, 0x10E, 0x0FE, 0x0F0, 0x0E3, 0x0D6, 0x0CA, 0x0BF,
    0x0B4, 0x0AA, 0x0A0, 0x097, 0x08F, 0x087, 0x07F, 0x078, 0x071, 0x0D6, 0x0CA, 0x0BF, 0x0B4,
    0x0AA, 0x0A0, 0x097, 0x08F, 0x087, 0x07F, 0x078, 0x071, 0x0D6, 0x0CA, 0x0BF, 0x0B4,
];

/// Shared tails for opcodes that end in the same code path. The original
/// dispatcher falls through between these cases; the enum keeps those
/// fall-throughs as explicit sequences.
#[derive(Debug)]
enum Tail {
    /// 0x00/0x13: voice DMA off, with the one-shot-fade variant.
    DmaOff,
    /// 0x08/0x09/0x1F: period from the note table, relative to a base.
    Note(u8),
    /// 0x05/0x10: loop-counter jump.
    LoopJump,
    /// 0x06/0x15: continue into another macro.
    MacroCont,
}

impl Player<'_> {
    /// One controller's per-tick macro service: SFX lock bookkeeping,
    /// deferred note dispatch, the fetch-execute loop when awake, then
    /// effects and the voice refresh.
    pub(crate) fn do_macro(&mut self, ci: usize) {
        {
            let c = &mut self.cdb[ci];
            if c.sfx_lock_time >= 0 {
                c.sfx_lock_time -= 1;
            } else {
                c.sfx_flag = 0;
                c.sfx_priority = 0;
            }
        }
        let sfx_code = self.cdb[ci].sfx_code;
        if sfx_code != 0 {
            self.cdb[ci].sfx_flag = 0;
            self.cdb[ci].sfx_code = 0;
            self.note_port(sfx_code);
            self.cdb[ci].sfx_flag = self.cdb[ci].sfx_priority;
        }
        let (run, wait) = {
            let c = &mut self.cdb[ci];
            let prior = (c.macro_run, c.macro_wait);
            c.macro_wait = c.macro_wait.wrapping_sub(1);
            prior
        };
        if run != 0 && wait == 0 {
            self.run_macro(ci);
        }
        self.do_effects(ci);
        self.refresh_voice(ci);
    }

    /// The macro fetch-decode-execute loop. Opcodes either `continue` to
    /// the next instruction or return to let the tick settle; note- and
    /// wait-flavored opcodes consult `new_style_macro` for which of the
    /// two applies.
    pub(crate) fn run_macro(&mut self, ci: usize) {
        self.cdb[ci].macro_wait = 0;
        for _ in 0..MAX_OPS_PER_TICK {
            let (ptr, step) = {
                let c = &mut self.cdb[ci];
                let step = c.macro_step;
                c.macro_step = c.macro_step.wrapping_add(1);
                (c.macro_ptr, step)
            };
            let mut word = Word(self.word(ptr.wrapping_add(u32::from(step))));
            let op = word.byte0();
            word.set_byte0(0);
            let tail = match op {
                0x00 => {
                    // DMAoff + reset all effects
                    let gemx = self.cfg.gemx;
                    let c = &mut self.cdb[ci];
                    c.add_begin_time = 0;
                    c.porta_rate = 0;
                    c.vib_reset = 0;
                    c.env_reset = 0;
                    if gemx {
                        if word.byte2() == 0 {
                            c.cur_vol = (i32::from(word.byte3()) + i32::from(c.velocity) * 3) as i8;
                        } else {
                            c.cur_vol = word.byte3() as i8;
                        }
                    }
                    Tail::DmaOff
                }
                0x13 => Tail::DmaOff,
                0x01 => {
                    // DMAon
                    let restart = {
                        let c = &mut self.cdb[ci];
                        c.efx_run = word.byte1() as i8;
                        c.new_style_macro == 0
                    } || self.cfg.danger_freak_hack;
                    let (save_addr, save_len, hw_idx) = {
                        let c = &self.cdb[ci];
                        (c.save_addr, c.save_len, c.hw_idx)
                    };
                    let hw = &mut self.hdb[hw_idx];
                    hw.mode = 1;
                    if restart {
                        hw.sample_start = save_addr as usize;
                        hw.sample_len = if save_len == 0 {
                            131_072
                        } else {
                            u32::from(save_len) << 1
                        };
                        hw.sbeg = hw.sample_start;
                        hw.slen = hw.sample_len;
                        hw.pos = 0;
                        hw.mode |= 2;
                    }
                    continue;
                }
                0x02 => {
                    // SetBegin
                    let c = &mut self.cdb[ci];
                    c.add_begin_time = 0;
                    c.curr_addr = word.low24();
                    c.save_addr = c.curr_addr;
                    continue;
                }
                0x11 => {
                    // AddBegin: sample-address vibrato
                    let c = &mut self.cdb[ci];
                    c.add_begin_reset = word.byte1();
                    c.add_begin_time = c.add_begin_reset;
                    c.add_begin = i32::from(word.half1_signed());
                    c.curr_addr = c.curr_addr.wrapping_add(c.add_begin as u32);
                    c.save_addr = c.curr_addr;
                    continue;
                }
                0x03 => {
                    // SetLen
                    let c = &mut self.cdb[ci];
                    c.curr_len = word.half1();
                    c.save_len = c.curr_len;
                    continue;
                }
                0x12 => {
                    // AddLen
                    let c = &mut self.cdb[ci];
                    c.curr_len = c.curr_len.wrapping_add(word.half1());
                    c.save_len = c.curr_len;
                    continue;
                }
                0x04 => {
                    // Wait
                    let c = &mut self.cdb[ci];
                    if word.byte1() & 0x1 != 0 {
                        let really_wait = c.really_wait;
                        c.really_wait = c.really_wait.wrapping_add(1);
                        if really_wait != 0 {
                            return;
                        }
                    }
                    c.macro_wait = word.half1();
                    if c.new_style_macro == 0 {
                        c.new_style_macro = 0xFF;
                        continue;
                    }
                    return;
                }
                0x1A => {
                    // WaitOnDMA: sleep until the mixer's loop wrap wakes us
                    let hw_idx = self.cdb[ci].hw_idx;
                    let hw = &mut self.hdb[hw_idx];
                    hw.loop_mode = LoopMode::WaitDma;
                    hw.owner = ci;
                    let c = &mut self.cdb[ci];
                    c.wait_dma_count = word.half1();
                    c.macro_run = 0;
                    if c.new_style_macro == 0 {
                        c.new_style_macro = 0xFF;
                        continue;
                    }
                    return;
                }
                0x1C => {
                    // SplitKey
                    let c = &mut self.cdb[ci];
                    if c.curr_note > word.byte1() {
                        c.macro_step = word.half1();
                    }
                    continue;
                }
                0x1D => {
                    // SplitVol
                    let c = &mut self.cdb[ci];
                    if i32::from(c.cur_vol) > i32::from(word.byte1()) {
                        c.macro_step = word.half1();
                    }
                    continue;
                }
                0x10 => {
                    // LoopKeyUp
                    if self.cdb[ci].key_up == 0 {
                        continue;
                    }
                    Tail::LoopJump
                }
                0x05 => Tail::LoopJump,
                0x07 => {
                    // Stop
                    self.cdb[ci].macro_run = 0;
                    return;
                }
                0x0D => {
                    // AddVolume
                    if word.byte2() != 0xFE {
                        let c = &mut self.cdb[ci];
                        let vol = i32::from(c.velocity) * 3 + i32::from(word.byte3() as i8);
                        c.cur_vol = vol.clamp(0, 0x40) as i8;
                    }
                    continue;
                }
                0x0E => {
                    // SetVolume
                    if word.byte2() != 0xFE {
                        self.cdb[ci].cur_vol = word.byte3() as i8;
                    }
                    continue;
                }
                0x21 => {
                    // PlayMacro: replay the current note elsewhere
                    let (note, velocity) = {
                        let c = &self.cdb[ci];
                        (c.curr_note, c.velocity)
                    };
                    word.set_byte0(note);
                    word.set_byte2(word.byte2() | velocity << 4);
                    self.note_port(word.0);
                    continue;
                }
                0x1F => Tail::Note(self.cdb[ci].prev_note),
                0x08 => Tail::Note(self.cdb[ci].curr_note),
                0x09 => Tail::Note(0),
                0x17 => {
                    // SetPeriod
                    let c = &mut self.cdb[ci];
                    c.dest_period = word.half1();
                    if c.porta_rate == 0 {
                        c.cur_period = word.half1();
                    }
                    continue;
                }
                0x0B => {
                    // Portamento
                    let c = &mut self.cdb[ci];
                    c.porta_reset = word.byte1();
                    c.porta_time = 1;
                    if c.porta_rate == 0 {
                        c.porta_per = c.dest_period;
                    }
                    c.porta_rate = word.half1_signed();
                    continue;
                }
                0x0C => {
                    // Vibrato
                    let c = &mut self.cdb[ci];
                    c.vib_reset = word.byte1();
                    c.vib_time = c.vib_reset >> 1;
                    c.vib_width = word.byte3() as i8;
                    c.vib_flag = 1;
                    if c.porta_rate == 0 {
                        c.cur_period = c.dest_period;
                        c.vib_offset = 0;
                    }
                    continue;
                }
                0x0F => {
                    // Envelope
                    let c = &mut self.cdb[ci];
                    c.env_time = word.byte2();
                    c.env_reset = c.env_time;
                    c.env_end_vol = word.byte3() as i8;
                    c.env_rate = word.byte1();
                    continue;
                }
                0x0A => {
                    // Reset all effects
                    let c = &mut self.cdb[ci];
                    c.add_begin_time = 0;
                    c.porta_rate = 0;
                    c.vib_reset = 0;
                    c.env_reset = 0;
                    continue;
                }
                0x14 => {
                    // WaitKeyUp, with the loop counter as a timeout
                    let c = &mut self.cdb[ci];
                    if c.key_up == 0 {
                        c.loop_ = 0;
                    }
                    if c.loop_ == 0 {
                        c.loop_ = -1;
                        continue;
                    }
                    if c.loop_ == -1 {
                        c.loop_ = i16::from(word.byte3()) - 1;
                    } else {
                        c.loop_ -= 1;
                    }
                    c.macro_step = c.macro_step.wrapping_sub(1);
                    return;
                }
                0x15 => {
                    // GoSub
                    let c = &mut self.cdb[ci];
                    c.return_ptr = c.macro_ptr;
                    c.return_step = c.macro_step;
                    Tail::MacroCont
                }
                0x06 => Tail::MacroCont,
                0x16 => {
                    // Return
                    let c = &mut self.cdb[ci];
                    c.macro_ptr = c.return_ptr;
                    c.macro_step = c.return_step;
                    continue;
                }
                0x18 => {
                    // Sampleloop
                    let c = &mut self.cdb[ci];
                    c.save_addr = c.save_addr.wrapping_add(u32::from(word.half1()) & 0xFFFE);
                    c.save_len = c.save_len.wrapping_sub(word.half1() >> 1);
                    c.curr_len = c.save_len;
                    c.curr_addr = c.save_addr;
                    continue;
                }
                0x19 => {
                    // OneShot: drop the sample region
                    let c = &mut self.cdb[ci];
                    c.add_begin_time = 0;
                    c.curr_addr = 0;
                    c.save_addr = 0;
                    c.curr_len = 1;
                    c.save_len = 1;
                    continue;
                }
                0x20 => {
                    // Cue
                    self.idb.cue[usize::from(word.byte1() & 0x3)] = word.half1();
                    continue;
                }
                0x22 => {
                    // Retarget the running sample pointer only
                    let c = &mut self.cdb[ci];
                    c.add_begin_time = 0;
                    c.curr_addr = word.low24();
                    continue;
                }
                0x1B | 0x1E => {
                    // Random / AddVol+Note exist in the format but are
                    // inert here
                    continue;
                }
                _ => {
                    log::warn!("unknown macro opcode {op:#04x}");
                    continue;
                }
            };
            match tail {
                Tail::DmaOff => {
                    let hw_idx = self.cdb[ci].hw_idx;
                    self.hdb[hw_idx].loop_mode = LoopMode::Off;
                    if word.byte1() == 0 {
                        self.hdb[hw_idx].mode = 0;
                        if self.cdb[ci].new_style_macro != 0 {
                            self.hdb[hw_idx].slen = 0;
                        }
                    } else {
                        self.hdb[hw_idx].mode |= 4;
                        self.cdb[ci].new_style_macro = 0;
                        return;
                    }
                }
                Tail::Note(base) => {
                    let note_idx = usize::from(base.wrapping_add(word.byte1()) & 0x3F);
                    let c = &mut self.cdb[ci];
                    let period = (i32::from(NOTEVALS[note_idx])
                        * (0x100 + i32::from(c.fine_tune) + i32::from(word.byte3() as i8)))
                        >> 8;
                    c.dest_period = period as u16;
                    if c.porta_rate == 0 {
                        c.cur_period = period as u16;
                    }
                    if c.new_style_macro == 0 {
                        c.new_style_macro = 0xFF;
                    } else {
                        return;
                    }
                }
                Tail::LoopJump => {
                    let c = &mut self.cdb[ci];
                    let prior = c.loop_;
                    c.loop_ = c.loop_.wrapping_sub(1);
                    if prior == 0 {
                        continue;
                    }
                    if c.loop_ < 0 {
                        c.loop_ = i16::from(word.byte1()) - 1;
                    }
                    c.macro_step = word.half1();
                }
                Tail::MacroCont => {
                    let maddr = self.macro_addr(word.byte1());
                    let c = &mut self.cdb[ci];
                    c.macro_num = u16::from(word.byte1());
                    c.macro_ptr = maddr;
                    c.macro_step = word.half1();
                    c.loop_ = -1;
                }
            }
        }
        log::warn!("macro on controller {ci} ran away; stopping it");
        self.cdb[ci].macro_run = 0;
    }

    /// Dispatch one 32-bit note command to its controller.
    pub(crate) fn note_port(&mut self, cmd: u32) {
        let word = Word(cmd);
        let ci = usize::from(word.byte2() & self.chan_mask());
        if word.byte0() == 0xFC {
            // lock the controller for sound effects
            let c = &mut self.cdb[ci];
            c.sfx_flag = word.byte1();
            c.sfx_priority = word.byte1();
            c.sfx_lock_time = i16::from(word.byte3());
            return;
        }
        if self.cdb[ci].sfx_flag != 0 {
            return;
        }
        if word.byte0() < 0xC0 {
            // plain note: arm the macro
            let maddr = self.macro_addr(word.byte1());
            let danger_freak_hack = self.cfg.danger_freak_hack;
            let c = &mut self.cdb[ci];
            c.fine_tune = if danger_freak_hack {
                0
            } else {
                word.byte3() as i8
            };
            c.velocity = (word.byte2() >> 4) & 0xF;
            c.prev_note = c.curr_note;
            c.curr_note = word.byte0();
            c.really_wait = 1;
            c.new_style_macro = 0xFF;
            c.macro_num = u16::from(word.byte1());
            c.macro_ptr = maddr;
            c.macro_step = 0;
            c.efx_run = 0;
            c.macro_wait = 0;
            c.key_up = 1;
            c.loop_ = -1;
            c.macro_run = -1;
        } else if word.byte0() < 0xF0 {
            // portamento note
            let c = &mut self.cdb[ci];
            c.porta_reset = word.byte1();
            c.porta_time = 1;
            if c.porta_rate == 0 {
                c.porta_per = c.dest_period;
            }
            c.porta_rate = i16::from(word.byte3() as i8);
            c.curr_note = word.byte0() & 0x3F;
            c.dest_period = NOTEVALS[usize::from(c.curr_note)];
        } else {
            match word.byte0() {
                0xF7 => {
                    // enve
                    let c = &mut self.cdb[ci];
                    c.env_rate = word.byte1();
                    c.env_reset = (word.byte2() >> 4) + 1;
                    c.env_time = (word.byte2() >> 4) + 1;
                    c.env_end_vol = word.byte3() as i8;
                }
                0xF6 => {
                    // vibr
                    let c = &mut self.cdb[ci];
                    c.vib_reset = (word.byte1() & 0xFE) >> 1;
                    c.vib_time = c.vib_reset;
                    c.vib_width = word.byte3() as i8;
                    c.vib_flag = 1;
                    c.vib_offset = 0;
                }
                0xF5 => {
                    // kup^
                    self.cdb[ci].key_up = 0;
                }
                other => {
                    log::warn!("unhandled note command {other:#04x}");
                }
            }
        }
    }
}
