use crate::{module::Word, state::channel_off, Player, MAX_CHANNELS};

/// Upper bound on decoded instructions per cursor per tick; a runaway
/// stream (e.g. zero-filled data) trips it instead of hanging the tick.
pub(crate) const MAX_OPS_PER_TICK: usize = 4096;

/// Upper bound on End-triggered track rescans within one tick.
const MAX_TRACK_RESTARTS: usize = 64;

impl Player<'_> {
    /// Advance the sequencer by one tick: count the speed prescaler down
    /// and, when it fires, run every track's pattern cursor. A track that
    /// executes End reloads the trackstep line and rescans from track 0.
    pub(crate) fn do_tracks(&mut self) {
        self.jiffies = self.jiffies.wrapping_add(1);
        let ready = self.mdb.speed_cnt == 0;
        self.mdb.speed_cnt = self.mdb.speed_cnt.wrapping_sub(1);
        if !ready {
            return;
        }
        self.mdb.speed_cnt = self.pdblk.prescale;
        if self.cfg.oops_up_hack {
            self.mdb.speed_cnt = 5;
        }
        let mut restarts = 0;
        let mut x = 0;
        while x < MAX_CHANNELS {
            if !self.mdb.player_enable {
                return;
            }
            if self.do_track(x) {
                restarts += 1;
                if restarts > MAX_TRACK_RESTARTS {
                    log::warn!("trackstep rescan limit hit at position {}", self.pdblk.curr_pos);
                    return;
                }
                x = 0;
                continue;
            }
            x += 1;
        }
    }

    /// Interpret one trackstep line at the current position. Meta rows
    /// (first halfword `0xEFFE`) loop here until a pattern-assignment row
    /// or a stop lands.
    pub(crate) fn get_track_step(&mut self) {
        for _ in 0..MAX_OPS_PER_TICK {
            let count = self.module.as_ref().map_or(0, |m| m.trackstep_count());
            if count > 0 && usize::from(self.pdblk.curr_pos) >= count {
                log::warn!("trackstep table exhausted at position {}", self.pdblk.curr_pos);
                self.mdb.player_enable = false;
                return;
            }
            let line = self
                .module
                .as_ref()
                .map_or([0u16; 8], |m| m.trackstep_line(self.pdblk.curr_pos));
            self.jiffies = 0;
            if line[0] != 0xEFFE {
                for (i, &half) in line.iter().enumerate() {
                    let num = (half >> 8) as u8;
                    let addr = if num < 0x80 { self.pattern_addr(num) } else { 0 };
                    let p = &mut self.pdblk.p[i];
                    p.xpose = half as i8;
                    p.num = num;
                    if num < 0x80 {
                        p.step = 0;
                        p.wait = 0;
                        p.loop_ = 0xFFFF;
                        p.addr = addr;
                    }
                }
                return;
            }
            match line[1] {
                0 => {
                    // stop
                    self.mdb.player_enable = false;
                    return;
                }
                1 => {
                    // loop
                    if self.loops_left > 0 {
                        self.loops_left -= 1;
                        if self.loops_left == 0 {
                            self.mdb.player_enable = false;
                            return;
                        }
                    }
                    let track_loop = self.mdb.track_loop;
                    self.mdb.track_loop = self.mdb.track_loop.wrapping_sub(1);
                    if track_loop == 0 {
                        self.mdb.track_loop = -1;
                        self.pdblk.curr_pos = self.pdblk.curr_pos.wrapping_add(1);
                    } else {
                        if self.mdb.track_loop < 0 {
                            self.mdb.track_loop = line[3] as i16;
                        }
                        self.pdblk.curr_pos = line[2];
                    }
                }
                2 => {
                    // speed
                    self.pdblk.prescale = line[2];
                    self.mdb.speed_cnt = line[2];
                    let x = u32::from(line[3] & 0x1FF);
                    if line[3] & 0xF200 == 0 && x > 0xF {
                        self.mdb.e_clocks = 0x001B_51F8 / x;
                    }
                    self.pdblk.curr_pos = self.pdblk.curr_pos.wrapping_add(1);
                }
                3 => {
                    // timeshare: eight voices on a slowed tick
                    if line[3] & 0x8000 == 0 {
                        let x = i32::from(line[3] as u8 as i8).max(-0x20);
                        self.mdb.e_clocks = (14318 * (x + 100) / 100) as u32;
                        self.multimode = true;
                    }
                    self.pdblk.curr_pos = self.pdblk.curr_pos.wrapping_add(1);
                }
                4 => {
                    // fade
                    self.do_fade((line[2] & 0xFF) as i8, (line[3] & 0xFF) as i8);
                    self.pdblk.curr_pos = self.pdblk.curr_pos.wrapping_add(1);
                }
                other => {
                    log::warn!("unknown trackstep meta command {other:#x}");
                    self.pdblk.curr_pos = self.pdblk.curr_pos.wrapping_add(1);
                }
            }
        }
        log::warn!("trackstep meta rows ran away; stopping the player");
        self.mdb.player_enable = false;
    }

    /// Run one track's pattern cursor. Returns true when the cursor
    /// executed End and the trackstep advanced.
    pub(crate) fn do_track(&mut self, track: usize) -> bool {
        {
            let p = &mut self.pdblk.p[track];
            if p.num == 0xFE {
                // silence request: the transpose byte doubles as the
                // controller index
                p.num = p.num.wrapping_add(1);
                let ch = (p.xpose & 0xF) as usize;
                channel_off(ch, &mut self.cdb, &mut self.hdb);
                return false;
            }
            if p.addr == 0 || p.num >= 0x90 {
                return false;
            }
            let wait = p.wait;
            p.wait = p.wait.wrapping_sub(1);
            if wait != 0 {
                return false;
            }
        }
        let muted = self.muted[track];
        for _ in 0..MAX_OPS_PER_TICK {
            let (addr, step, xpose) = {
                let p = &mut self.pdblk.p[track];
                let step = p.step;
                p.step = p.step.wrapping_add(1);
                (p.addr, step, p.xpose)
            };
            let mut word = Word(self.word(addr.wrapping_add(u32::from(step))));
            let t = word.byte0();
            if t < 0xF0 {
                if t & 0xC0 == 0x80 {
                    self.pdblk.p[track].wait = word.byte3();
                    word.set_byte3(0);
                }
                word.set_byte0(t.wrapping_add_signed(xpose) & 0x3F);
                if t & 0xC0 == 0xC0 {
                    word.set_byte0(word.byte0() | 0xC0);
                }
                if !muted {
                    self.note_port(word.0);
                }
                if t & 0xC0 == 0x80 {
                    return false;
                }
                continue;
            }
            match t & 0xF {
                0 => {
                    // End
                    self.pdblk.p[track].num = 0xFF;
                    if self.pdblk.curr_pos == self.pdblk.last_pos {
                        if self.loops_left < 0 {
                            self.mdb.player_enable = false;
                            return true;
                        }
                        if self.loops_left > 0 {
                            self.loops_left -= 1;
                            if self.loops_left == 0 {
                                self.mdb.player_enable = false;
                                return true;
                            }
                        }
                        self.pdblk.curr_pos = self.pdblk.first_pos;
                    } else {
                        self.pdblk.curr_pos = self.pdblk.curr_pos.wrapping_add(1);
                    }
                    self.get_track_step();
                    return true;
                }
                1 => {
                    // Loop
                    let p = &mut self.pdblk.p[track];
                    if p.loop_ == 0 {
                        p.loop_ = 0xFFFF;
                    } else {
                        if p.loop_ == 0xFFFF {
                            p.loop_ = u16::from(word.byte1());
                        }
                        p.loop_ = p.loop_.wrapping_sub(1);
                        p.step = word.half1();
                    }
                }
                8 => {
                    // GsPt: save the cursor, then jump like Cont
                    let addr = self.pattern_addr(word.byte1());
                    let p = &mut self.pdblk.p[track];
                    p.ro_addr = p.addr;
                    p.ro_step = p.step;
                    p.addr = addr;
                    p.step = word.half1();
                }
                2 => {
                    // Cont
                    let addr = self.pattern_addr(word.byte1());
                    let p = &mut self.pdblk.p[track];
                    p.addr = addr;
                    p.step = word.half1();
                }
                3 => {
                    // Wait
                    self.pdblk.p[track].wait = word.byte1();
                    return false;
                }
                14 => {
                    // StCu: clear the play flag, then stop like Stop
                    self.mdb.play_patt_flag = 0;
                    self.pdblk.p[track].num = 0xFF;
                    return false;
                }
                4 => {
                    // Stop
                    self.pdblk.p[track].num = 0xFF;
                    return false;
                }
                5 | 6 | 7 | 12 => {
                    // Kup^ | Vibr | Enve | Lock
                    if !muted {
                        self.note_port(word.0);
                    }
                }
                9 => {
                    // RoPt
                    let p = &mut self.pdblk.p[track];
                    p.addr = p.ro_addr;
                    p.step = p.ro_step;
                }
                10 => {
                    // Fade
                    self.do_fade(word.byte1() as i8, word.byte3() as i8);
                }
                13 => {
                    // Cue
                    self.idb.cue[usize::from(word.byte1() & 0x3)] = word.half1();
                }
                11 => {
                    // PPat: retarget another track's cursor
                    let addr = self.pattern_addr(word.byte1());
                    let other = usize::from(word.byte2() & 0x7);
                    let p = &mut self.pdblk.p[other];
                    p.num = word.byte1();
                    p.addr = addr;
                    p.xpose = word.byte3() as i8;
                    p.step = 0;
                    p.wait = 0;
                    p.loop_ = 0xFFFF;
                }
                _ => {
                    // NOP
                }
            }
        }
        log::warn!("pattern cursor on track {track} ran away; parking it");
        self.pdblk.p[track].num = 0xFF;
        false
    }
}

#[cfg(test)]
mod tests {
    use crate::{parse, Player};

    /// Builds an mdat image with the trackstep table at word 0 and the
    /// given patterns following it.
    fn build_mdat(tracksteps: &[[u16; 8]], patterns: &[&[u32]]) -> Vec<u8> {
        let mut words: Vec<u32> = Vec::new();
        for line in tracksteps {
            for pair in line.chunks_exact(2) {
                words.push(u32::from(pair[0]) << 16 | u32::from(pair[1]));
            }
        }
        let mut pattern_offsets = Vec::new();
        for pat in patterns {
            pattern_offsets.push(0x200 + words.len() as u32 * 4);
            words.extend_from_slice(pat);
        }
        let patt_table = 0x200 + words.len() as u32 * 4;
        words.extend_from_slice(&pattern_offsets);
        words.push(0); // table terminator
        let macro_table = 0x200 + words.len() as u32 * 4;
        words.push(0);

        let mut v = vec![0u8; 512];
        v[..10].copy_from_slice(b"TFMX-SONG ");
        // one sub-song spanning the whole trackstep table
        v[320..322].copy_from_slice(&(tracksteps.len() as u16 - 1).to_be_bytes());
        v[464..468].copy_from_slice(&0x200u32.to_be_bytes());
        v[468..472].copy_from_slice(&patt_table.to_be_bytes());
        v[472..476].copy_from_slice(&macro_table.to_be_bytes());
        for w in &words {
            v.extend_from_slice(&w.to_be_bytes());
        }
        v
    }

    const IDLE: u16 = 0xFF00;

    #[test]
    fn assignment_row_arms_cursors() {
        let mdat = build_mdat(
            &[[0x0000, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE]],
            &[&[0xF400_0000]],
        );
        let module = parse(&mdat, &[]).unwrap();
        let mut p = Player::new(44_100);
        p.load(module);
        p.start_song(0, false);
        let ds = p.display_state();
        assert!(ds.active);
        assert_eq!(ds.tracks[0].pattern_num, 0);
        assert!(ds.tracks[0].active);
        assert!(!ds.tracks[1].active);
    }

    #[test]
    fn stop_meta_row_disables_player() {
        // row 0 plays a pattern whose End walks into the stop meta row
        let mdat = build_mdat(
            &[
                [0x0000, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE],
                [0xEFFE, 0, 0, 0, 0, 0, 0, 0],
            ],
            &[&[0xF301_0000, 0xF000_0000]],
        );
        let module = parse(&mdat, &[]).unwrap();
        let mut p = Player::new(44_100);
        p.load(module);
        p.start_song(0, false);
        assert!(p.display_state().active);
        p.tick();
        p.tick();
        p.tick(); // End advances into the stop row
        assert!(!p.display_state().active);
    }

    #[test]
    fn speed_meta_row_sets_prescale_and_clock() {
        let mdat = build_mdat(
            &[
                [0xEFFE, 2, 3, 0x20, 0, 0, 0, 0],
                [0x0000, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE],
            ],
            &[&[0xF400_0000]],
        );
        let module = parse(&mdat, &[]).unwrap();
        let mut p = Player::new(44_100);
        p.load(module);
        p.start_song(0, false);
        assert_eq!(p.pdblk.prescale, 3);
        assert_eq!(p.mdb.e_clocks, 0x001B_51F8 / 0x20);
        assert_eq!(p.pdblk.curr_pos, 1);
    }

    #[test]
    fn speed_meta_row_flag_bits_gate_the_clock() {
        let mdat = build_mdat(
            &[
                [0xEFFE, 2, 3, 0xF220, 0, 0, 0, 0],
                [0x0000, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE],
            ],
            &[&[0xF400_0000]],
        );
        let module = parse(&mdat, &[]).unwrap();
        let mut p = Player::new(44_100);
        p.load(module);
        p.start_song(0, false);
        assert_eq!(p.pdblk.prescale, 3);
        assert_eq!(p.mdb.e_clocks, 14318);
    }

    #[test]
    fn timeshare_meta_row_enables_multimode() {
        let mdat = build_mdat(
            &[
                [0xEFFE, 3, 0, 0, 0, 0, 0, 0],
                [0x0000, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE],
            ],
            &[&[0xF400_0000]],
        );
        let module = parse(&mdat, &[]).unwrap();
        let mut p = Player::new(44_100);
        p.load(module);
        p.start_song(0, false);
        assert!(p.multimode);
        assert_eq!(p.mdb.e_clocks, 14318);
    }

    #[test]
    fn end_wraps_to_first_position_and_reloads() {
        // single row; pattern: Wait(1) then End
        let mdat = build_mdat(
            &[[0x0000, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE]],
            &[&[0xF301_0000, 0xF000_0000]],
        );
        let module = parse(&mdat, &[]).unwrap();
        let mut p = Player::new(44_100);
        p.load(module);
        p.start_song(0, false);
        p.tick(); // consumes the Wait
        p.tick(); // wait counts down
        p.tick(); // End: wrap + reload + rescan hits the Wait again
        let ds = p.display_state();
        assert!(ds.active);
        assert_eq!(ds.position, 0);
        assert_eq!(ds.tracks[0].pattern_num, 0);
        assert_eq!(ds.tracks[0].step, 1);
    }

    #[test]
    fn negative_loop_config_stops_at_sub_song_end() {
        let mdat = build_mdat(
            &[[0x0000, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE]],
            &[&[0xF301_0000, 0xF000_0000]],
        );
        let module = parse(&mdat, &[]).unwrap();
        let mut p = Player::new(44_100);
        p.config_mut().loops = -1;
        p.load(module);
        p.start_song(0, false);
        for _ in 0..3 {
            p.tick();
        }
        assert!(!p.display_state().active);
    }

    #[test]
    fn track_loop_meta_row_repeats_then_releases() {
        // row 0: assignment; row 1: loop back to row 0 once (count 1)
        let mdat = build_mdat(
            &[
                [0x0000, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE],
                [0xEFFE, 1, 0, 1, 0, 0, 0, 0],
            ],
            &[&[0xF301_0000, 0xF000_0000]],
        );
        let module = parse(&mdat, &[]).unwrap();
        let mut p = Player::new(44_100);
        p.load(module);
        p.start_song(0, false);
        // track_loop starts at -1: first hit reloads the count and jumps
        p.pdblk.curr_pos = 1;
        p.get_track_step();
        assert_eq!(p.pdblk.curr_pos, 0);
        assert_eq!(p.mdb.track_loop, 1);
        // next hit decrements
        p.pdblk.curr_pos = 1;
        p.get_track_step();
        assert_eq!(p.pdblk.curr_pos, 0);
        assert_eq!(p.mdb.track_loop, 0);
        // count exhausted: fall through to the next row
        p.pdblk.curr_pos = 1;
        p.get_track_step();
        assert_eq!(p.pdblk.curr_pos, 2);
        assert_eq!(p.mdb.track_loop, -1);
    }

    #[test]
    fn pattern_wait_holds_the_cursor() {
        let mdat = build_mdat(
            &[[0x0000, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE]],
            &[&[0xF303_0000, 0xF000_0000]],
        );
        let module = parse(&mdat, &[]).unwrap();
        let mut p = Player::new(44_100);
        p.load(module);
        p.start_song(0, false);
        p.tick();
        assert_eq!(p.display_state().tracks[0].step, 1);
        p.tick();
        p.tick();
        p.tick();
        // three wait ticks pass before the cursor moves again
        assert_eq!(p.display_state().position, 0);
        assert_eq!(p.display_state().tracks[0].step, 1);
    }

    #[test]
    fn silence_request_parks_and_bumps_sentinel() {
        let mdat = build_mdat(
            &[[0x0000, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE, IDLE]],
            &[&[0xF400_0000]],
        );
        let module = parse(&mdat, &[]).unwrap();
        let mut p = Player::new(44_100);
        p.load(module);
        p.start_song(0, false);
        p.cdb[2].macro_run = -1;
        p.hdb[2].mode = 1;
        p.pdblk.p[1].num = 0xFE;
        p.pdblk.p[1].xpose = 2;
        p.do_track(1);
        assert_eq!(p.pdblk.p[1].num, 0xFF);
        assert_eq!(p.cdb[2].macro_run, 0);
        assert_eq!(p.hdb[2].mode, 0);
    }
}
