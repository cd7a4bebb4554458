use crate::{
    mixer::Mixer,
    module::{channel_mask, note_command, Module},
    state::{channel_off, Cdb, CdbArr, Hdb, HdbArr, Idb, LoopMode, Mdb, Pdblk},
    MAX_CHANNELS, MAX_SONGS,
};

/// Default note used when auditioning a macro.
const PREVIEW_NOTE: u8 = 0x1E;

/// Playback configuration toggles.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Volume fixup on DMA-off, needed by GemX modules.
    pub gemx: bool,
    /// Zero the finetune on note load and force a sample restart on
    /// DMA-on (Danger Freak workaround).
    pub danger_freak_hack: bool,
    /// Force the speed counter to 5 on reload (Oops Up tempo workaround).
    pub oops_up_hack: bool,
    /// Linear interpolation in the mixer.
    pub oversampling: bool,
    /// Stereo cross-blend.
    pub blend: bool,
    /// Output low-pass strength, 0 (off) to 3.
    pub filter_level: u8,
    /// Song looping: 0 plays forever, `n > 0` stops after n loops,
    /// negative stops at sub-song end.
    pub loops: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gemx: false,
            danger_freak_hack: false,
            oops_up_hack: false,
            oversampling: true,
            blend: true,
            filter_level: 0,
            loops: 0,
        }
    }
}

/// One track's slice of [`DisplayState`].
#[derive(Debug, Clone, Copy)]
pub struct TrackState {
    /// Pattern number the track is playing (sentinels included).
    pub pattern_num: u8,
    /// Step within the pattern.
    pub step: u16,
    /// Whether the track has a live pattern cursor.
    pub active: bool,
}

/// Snapshot of playback state for host UIs.
#[derive(Debug, Clone, Copy)]
pub struct DisplayState {
    /// Per-track cursor state.
    pub tracks: [TrackState; MAX_CHANNELS],
    /// Current hardware-voice volumes.
    pub channel_volumes: [u8; MAX_CHANNELS],
    /// Current position in the trackstep table.
    pub position: u16,
    /// Ticks left until the next trackstep evaluation.
    pub speed_count: u16,
    /// Master volume, 0..=64.
    pub master_volume: i8,
    /// Whether the player is producing anything at all.
    pub active: bool,
}

/// The playback engine: three nested state machines (tracks, patterns,
/// macros) driving eight resampled voices.
///
/// All state mutation happens inside [`Player::tick`]/[`Player::render`];
/// the borrowed [`Module`] is never written to.
pub struct Player<'a> {
    pub(crate) module: Option<Module<'a>>,
    pub(crate) cfg: Config,
    pub(crate) out_rate: u32,
    pub(crate) mdb: Mdb,
    pub(crate) pdblk: Pdblk,
    pub(crate) cdb: CdbArr,
    pub(crate) hdb: HdbArr,
    pub(crate) idb: Idb,
    pub(crate) multimode: bool,
    pub(crate) jiffies: u32,
    pub(crate) loops_left: i32,
    pub(crate) muted: [bool; MAX_CHANNELS],
    pub(crate) ch_on: [bool; MAX_CHANNELS],
    pub(crate) mixer: Mixer,
}

impl<'a> Player<'a> {
    /// Create an idle player that renders at `out_rate` Hz.
    #[must_use]
    pub fn new(out_rate: u32) -> Self {
        Self {
            module: None,
            cfg: Config::default(),
            out_rate,
            mdb: Mdb {
                e_clocks: 14318,
                curr_song: -1,
                ..Mdb::default()
            },
            pdblk: Pdblk::default(),
            cdb: [Cdb::default(); 16],
            hdb: [Hdb::default(); MAX_CHANNELS],
            idb: Idb::default(),
            multimode: false,
            jiffies: 0,
            loops_left: 0,
            muted: [false; MAX_CHANNELS],
            ch_on: [true; MAX_CHANNELS],
            mixer: Mixer::new(),
        }
    }

    /// Create a player with explicit configuration.
    #[must_use]
    pub fn with_config(out_rate: u32, cfg: Config) -> Self {
        let mut this = Self::new(out_rate);
        this.cfg = cfg;
        this
    }

    /// Access the configuration for live toggling.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.cfg
    }

    /// Attach a module. Call [`Player::init`] before starting playback.
    pub fn load(&mut self, module: Module<'a>) {
        self.module = Some(module);
    }

    /// The attached module, if any.
    pub fn module(&self) -> Option<&Module<'a>> {
        self.module.as_ref()
    }

    /// Reset every controller, voice and pattern cursor to silence.
    pub fn init(&mut self) {
        self.prepare();
        for ch_idx in 0..MAX_CHANNELS {
            self.hdb[ch_idx].owner = ch_idx;
            self.pdblk.p[ch_idx].num = 0xFF;
            self.pdblk.p[ch_idx].addr = 0;
            channel_off(ch_idx & 0xF, &mut self.cdb, &mut self.hdb);
        }
    }

    fn prepare(&mut self) {
        self.mdb.player_enable = false;
        for (i, (hw, c)) in self.hdb.iter_mut().zip(self.cdb.iter_mut()).enumerate() {
            hw.mode = 0;
            hw.vol = 0;
            hw.owner = i;
            hw.sbeg = 0;
            hw.sample_start = 0;
            hw.sample_len = 2;
            hw.slen = 2;
            hw.loop_mode = LoopMode::Off;
            c.hw_idx = i;
            c.macro_wait = 0;
            c.macro_run = 0;
            c.sfx_flag = 0;
            c.sfx_code = 0;
            c.cur_vol = 0;
            c.save_addr = 0;
            c.loop_ = -1;
            c.new_style_macro = u8::MAX;
            c.sfx_lock_time = -1;
            c.save_len = 2;
        }
    }

    /// Start playing sub-song `song`. With `cont` set, tempo and position
    /// state are kept and only the player is re-armed.
    pub fn start_song(&mut self, song: usize, cont: bool) {
        if self.module.is_none() || song >= MAX_SONGS {
            return;
        }
        if !cont {
            self.init();
        }
        self.mdb.player_enable = false;
        self.mdb.master_vol = 0x40;
        self.mdb.fade_slope = 0;
        self.mdb.track_loop = -1;
        self.mdb.play_patt_flag = 0;
        self.mdb.e_clocks = 14318; // 125 bpm NTSC unless the song says otherwise
        self.loops_left = self.cfg.loops;
        if !cont {
            let header = self.module.as_ref().map(|m| m.header);
            if let Some(header) = header {
                self.pdblk.first_pos = header.song_starts[song];
                self.pdblk.curr_pos = header.song_starts[song];
                self.pdblk.last_pos = header.song_ends[song];
                let tempo = header.song_tempos[song];
                if tempo >= 0x10 {
                    self.mdb.e_clocks = 0x001B_51F8 / u32::from(tempo);
                    self.pdblk.prescale = 0;
                } else {
                    self.pdblk.prescale = tempo;
                }
            }
        }
        for pdb in &mut self.pdblk.p {
            pdb.addr = 0;
            pdb.num = 0xFF;
            pdb.xpose = 0;
            pdb.step = 0;
        }
        if !cont {
            self.get_track_step();
        }
        self.mdb.speed_cnt = 0;
        self.mdb.curr_song = song as i8;
        self.mdb.player_enable = true;
    }

    /// Stop playback and drop back to full silence.
    pub fn stop(&mut self) {
        self.init();
        self.mdb.curr_song = -1;
        self.mixer.discard_pending();
    }

    /// Run one sequencer tick: macros and effects on every controller,
    /// the master fade, then (with a song active) the track sequencer.
    pub fn tick(&mut self) {
        if !self.mdb.player_enable {
            return;
        }
        self.do_all_macros();
        self.step_fade();
        if self.mdb.curr_song >= 0 {
            self.do_tracks();
        }
    }

    pub(crate) fn do_all_macros(&mut self) {
        self.do_macro(0);
        self.do_macro(1);
        self.do_macro(2);
        if self.multimode {
            self.do_macro(4);
            self.do_macro(5);
            self.do_macro(6);
            self.do_macro(7);
        }
        self.do_macro(3);
    }

    /// Audition macro `n` on voice 0 without a song playing.
    pub fn trigger_macro(&mut self, n: u8, note: Option<u8>) {
        let note = note.unwrap_or(PREVIEW_NOTE) & 0x3F;
        let cmd = note_command(note, n, 0xF0, 0);
        self.note_port(cmd);
    }

    /// Arm the engine for macro auditioning: macros run, the track
    /// sequencer stays off.
    pub fn enable_preview(&mut self) {
        self.mdb.curr_song = -1;
        self.mdb.master_vol = 0x40;
        if self.mdb.e_clocks == 0 {
            self.mdb.e_clocks = 14318;
        }
        self.mdb.player_enable = true;
    }

    /// Snapshot of the sequencer and voice state.
    #[must_use]
    pub fn display_state(&self) -> DisplayState {
        let mut tracks = [TrackState {
            pattern_num: 0xFF,
            step: 0,
            active: false,
        }; MAX_CHANNELS];
        for (t, p) in tracks.iter_mut().zip(self.pdblk.p.iter()) {
            t.pattern_num = p.num;
            t.step = p.step;
            t.active = p.addr != 0 && p.num < 0x90;
        }
        let mut channel_volumes = [0u8; MAX_CHANNELS];
        for (v, hw) in channel_volumes.iter_mut().zip(self.hdb.iter()) {
            *v = hw.vol;
        }
        DisplayState {
            tracks,
            channel_volumes,
            position: self.pdblk.curr_pos,
            speed_count: self.mdb.speed_cnt,
            master_volume: self.mdb.master_vol,
            active: self.mdb.player_enable,
        }
    }

    /// Read one of the four cue slots patterns and macros write for UI
    /// synchronization.
    #[must_use]
    pub fn signal(&self, slot: usize) -> u16 {
        self.idb.cue.get(slot).copied().unwrap_or(0)
    }

    /// Mute or unmute a track: structural pattern commands keep running,
    /// note dispatches are dropped.
    pub fn set_track_muted(&mut self, track: usize, muted: bool) {
        if let Some(m) = self.muted.get_mut(track) {
            *m = muted;
        }
    }

    /// Gate a hardware voice in or out of the mix.
    pub fn set_channel_enabled(&mut self, ch: usize, on: bool) {
        if let Some(c) = self.ch_on.get_mut(ch) {
            *c = on;
        }
    }

    /// Render stereo float frames, driving ticks as needed. Returns the
    /// number of frames written (the shorter of the two slices); a stopped
    /// player writes silence.
    pub fn render(&mut self, left: &mut [f32], right: &mut [f32]) -> usize {
        let frames = left.len().min(right.len());
        let mut done = 0;
        while done < frames {
            if !self.mixer.has_pending() {
                if self.mdb.player_enable && self.module.is_some() {
                    self.tick();
                    self.mix_burst();
                } else {
                    left[done..frames].fill(0.0);
                    right[done..frames].fill(0.0);
                    break;
                }
            }
            done += self
                .mixer
                .drain(&mut left[done..frames], &mut right[done..frames]);
        }
        frames
    }

    /// Fetch an instruction word from the module; no module or an
    /// out-of-range index reads as zero.
    pub(crate) fn word(&self, idx: u32) -> u32 {
        self.module.as_ref().map_or(0, |m| m.word(idx as usize))
    }

    pub(crate) fn pattern_addr(&self, num: u8) -> u32 {
        self.module.as_ref().map_or(0, |m| m.pattern_addr(num))
    }

    pub(crate) fn macro_addr(&self, num: u8) -> u32 {
        self.module.as_ref().map_or(0, |m| m.macro_addr(num))
    }

    pub(crate) fn chan_mask(&self) -> u8 {
        channel_mask(self.multimode)
    }
}
