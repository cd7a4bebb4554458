use byteorder::{BigEndian, ByteOrder};

use crate::{
    header::{Header, HEADER_LEN},
    MAX_CHANNELS,
};

/// mdat parsing error
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// File doesn't proclaim itself as a TFMX file
    #[error("not a TFMX module (magic mismatch)")]
    MagicMismatch,
    /// Music data shorter than the fixed header
    #[error("music data truncated: {len} bytes")]
    Truncated {
        /// Length of the music-data input
        len: usize,
    },
    /// A section offset in the header points before the data region
    #[error("section offset {offset:#x} points before the data region")]
    BadSectionOffset {
        /// The offending file offset
        offset: u32,
    },
}

/// A loaded music-data file plus a borrowed view of its sample bank.
///
/// Immutable after [`parse`]; a player only ever reads from it.
#[derive(Clone, Debug)]
pub struct Module<'a> {
    /// Decoded header.
    pub header: Header,
    words: Vec<i32>,
    patterns: Vec<u32>,
    macros: Vec<u32>,
    num_tracksteps: usize,
    samples: &'a [i8],
}

/// Parse a music-data file and its sample bank into a [`Module`].
///
/// The post-header region is decoded into host-order 32-bit words, and the
/// pattern/macro offset tables are rewritten into indices of that word
/// array. Malformed table entries truncate the table; a bad magic or a
/// short file is fatal.
///
/// # Errors
///
/// Errors when the header is unusable (see [`FormatError`]).
pub fn parse<'a>(mdat: &[u8], smpl: &'a [u8]) -> Result<Module<'a>, FormatError> {
    let header = Header::from_bytes(mdat)?;
    let n = (mdat.len() - HEADER_LEN) / 4;
    let mut words = Vec::with_capacity(n + 1);
    for chunk in mdat[HEADER_LEN..HEADER_LEN + n * 4].chunks_exact(4) {
        words.push(BigEndian::read_i32(chunk));
    }
    words.push(-1);

    let patterns = offset_table(&words, header.patt_start, "pattern");
    let macros = offset_table(&words, header.macro_start, "macro");

    // Trackstep lines are four words each, and the table runs up to the
    // first pattern's data.
    let num_tracksteps = patterns.first().map_or(0, |&first| {
        (first as usize).saturating_sub(header.track_start) / 4
    });

    Ok(Module {
        header,
        words,
        patterns,
        macros,
        num_tracksteps,
        samples: bytemuck::cast_slice(smpl),
    })
}

/// Rewrite a table of big-endian file offsets into word indices, stopping
/// at the first entry that is misaligned or out of range.
fn offset_table(words: &[i32], table_start: usize, what: &str) -> Vec<u32> {
    let mut out = Vec::new();
    for i in 0..128 {
        let Some(&raw) = words.get(table_start + i) else {
            break;
        };
        let Some(rel) = (raw as u32).checked_sub(HEADER_LEN as u32) else {
            break;
        };
        if rel & 3 != 0 || (rel >> 2) as usize >= words.len() {
            break;
        }
        out.push(rel >> 2);
    }
    log::debug!("counted {} {what}s", out.len());
    out
}

impl Module<'_> {
    /// Number of sub-songs with a valid end position.
    pub fn sub_song_count(&self) -> usize {
        self.header.sub_song_count()
    }

    /// The decoded post-header word array (with its `-1` end sentinel).
    pub fn words(&self) -> &[i32] {
        &self.words
    }

    /// Word indices of the pattern starts.
    pub fn pattern_table(&self) -> &[u32] {
        &self.patterns
    }

    /// Word indices of the macro starts.
    pub fn macro_table(&self) -> &[u32] {
        &self.macros
    }

    /// Number of lines in the trackstep table.
    pub fn trackstep_count(&self) -> usize {
        self.num_tracksteps
    }

    /// The raw sample bank.
    pub fn samples(&self) -> &[i8] {
        self.samples
    }

    /// Fetch a word; anything out of range reads as zero so a corrupt
    /// reference degrades to silence instead of stopping playback.
    pub(crate) fn word(&self, idx: usize) -> u32 {
        self.words.get(idx).copied().unwrap_or(0) as u32
    }

    /// The eight halfwords of one trackstep line.
    pub(crate) fn trackstep_line(&self, pos: u16) -> [u16; 8] {
        let base = self.header.track_start + usize::from(pos) * 4;
        let mut line = [0u16; 8];
        for (i, half) in line.iter_mut().enumerate() {
            let w = self.word(base + i / 2);
            *half = if i % 2 == 0 { (w >> 16) as u16 } else { w as u16 };
        }
        line
    }

    /// Start word index of a pattern, or 0 for an unknown pattern number.
    pub(crate) fn pattern_addr(&self, num: u8) -> u32 {
        self.patterns.get(usize::from(num)).copied().unwrap_or(0)
    }

    /// Start word index of a macro, or 0 for an unknown macro number.
    pub(crate) fn macro_addr(&self, num: u8) -> u32 {
        self.macros.get(usize::from(num)).copied().unwrap_or(0)
    }
}

/// One 32-bit pattern or macro instruction, stored host-order.
///
/// Byte 0 is the most significant byte (the opcode); "half 1" is the low
/// halfword, bytes 2..=3.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Word(pub(crate) u32);

impl Word {
    pub(crate) const fn byte0(self) -> u8 {
        (self.0 >> 24) as u8
    }
    pub(crate) const fn byte1(self) -> u8 {
        (self.0 >> 16) as u8
    }
    pub(crate) const fn byte2(self) -> u8 {
        (self.0 >> 8) as u8
    }
    pub(crate) const fn byte3(self) -> u8 {
        self.0 as u8
    }
    pub(crate) const fn half1(self) -> u16 {
        self.0 as u16
    }
    pub(crate) const fn half1_signed(self) -> i16 {
        self.0 as i16
    }
    pub(crate) const fn low24(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }
    pub(crate) fn set_byte0(&mut self, v: u8) {
        self.0 = (self.0 & 0x00FF_FFFF) | (u32::from(v) << 24);
    }
    pub(crate) fn set_byte2(&mut self, v: u8) {
        self.0 = (self.0 & 0xFFFF_00FF) | (u32::from(v) << 8);
    }
    pub(crate) fn set_byte3(&mut self, v: u8) {
        self.0 = (self.0 & 0xFFFF_FF00) | u32::from(v);
    }
}

/// `note | macro | velocity/channel | detune` packed the way patterns
/// store note commands.
pub(crate) const fn note_command(note: u8, macro_num: u8, velo_chan: u8, detune: u8) -> u32 {
    (note as u32) << 24 | (macro_num as u32) << 16 | (velo_chan as u32) << 8 | detune as u32
}

/// Channel mask for note commands: four voices normally, eight in
/// timeshared multimode.
pub(crate) const fn channel_mask(multimode: bool) -> u8 {
    if multimode {
        (MAX_CHANNELS - 1) as u8
    } else {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HEADER_LEN;

    /// Minimal mdat: magic, explicit section offsets, then raw words.
    fn mdat_with_words(
        track_off: u32,
        patt_off: u32,
        macro_off: u32,
        words: &[u32],
    ) -> Vec<u8> {
        let mut v = vec![0u8; HEADER_LEN];
        v[..10].copy_from_slice(b"TFMX-SONG ");
        v[464..468].copy_from_slice(&track_off.to_be_bytes());
        v[468..472].copy_from_slice(&patt_off.to_be_bytes());
        v[472..476].copy_from_slice(&macro_off.to_be_bytes());
        for w in words {
            v.extend_from_slice(&w.to_be_bytes());
        }
        v
    }

    #[test]
    fn words_decode_big_endian_with_sentinel() {
        let mdat = mdat_with_words(0x200, 0x204, 0x208, &[0x0102_0304, 0xFFFF_FFFF]);
        let module = parse(&mdat, &[]).unwrap();
        assert_eq!(module.words(), &[0x0102_0304, -1, -1]);
    }

    #[test]
    fn parse_is_idempotent() {
        let mdat = mdat_with_words(0x200, 0x204, 0x208, &[0x0102_0304, 0x0000_020C, 0]);
        let a = parse(&mdat, &[]).unwrap();
        let b = parse(&mdat, &[]).unwrap();
        assert_eq!(a.pattern_table(), &[3]);
        assert_eq!(a.words(), b.words());
        assert_eq!(a.pattern_table(), b.pattern_table());
        assert_eq!(a.macro_table(), b.macro_table());
    }

    #[test]
    fn pattern_table_stops_on_misaligned_entry() {
        // entries: 0x210 (ok), 0x215 (misaligned), 0x218 (never reached)
        let words = [0x210, 0x215, 0x218, 0, 0, 0];
        let mdat = mdat_with_words(0x224, 0x200, 0x224, &words);
        let module = parse(&mdat, &[]).unwrap();
        assert_eq!(module.pattern_table(), &[4]);
    }

    #[test]
    fn pattern_table_stops_on_out_of_range_entry() {
        let words = [0x210, 0xFFFF_FF00, 0x218, 0, 0, 0];
        let mdat = mdat_with_words(0x224, 0x200, 0x224, &words);
        let module = parse(&mdat, &[]).unwrap();
        assert_eq!(module.pattern_table(), &[4]);
    }

    #[test]
    fn pattern_table_rejects_index_one_past_the_words() {
        // seven words incl. sentinel: an entry resolving to index 7 is
        // already outside [0, len)
        let words = [0x210, 0x21C, 0x218, 0, 0, 0];
        let mdat = mdat_with_words(0x224, 0x200, 0x224, &words);
        let module = parse(&mdat, &[]).unwrap();
        assert_eq!(module.pattern_table(), &[4]);
    }

    #[test]
    fn table_length_survives_trailing_garbage() {
        let words = [0x210, 0x214, 0, 0, 0, 0];
        let mdat = mdat_with_words(0x224, 0x200, 0x224, &words);
        let with_garbage = {
            let mut v = mdat.clone();
            v.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
            v
        };
        let a = parse(&mdat, &[]).unwrap();
        let b = parse(&with_garbage, &[]).unwrap();
        assert_eq!(a.pattern_table().len(), b.pattern_table().len());
        assert_eq!(a.macro_table().len(), b.macro_table().len());
    }

    #[test]
    fn trackstep_count_spans_up_to_first_pattern() {
        // trackstep at word 0, first pattern data at word 8: two lines
        let words = [0, 0, 0, 0, 0, 0, 0, 0, 0x1111_1111, 0x220, 0, 0x224, 0];
        let mdat = mdat_with_words(0x200, 0x224, 0x22C, &words);
        let module = parse(&mdat, &[]).unwrap();
        assert_eq!(module.pattern_table(), &[8]);
        assert_eq!(module.trackstep_count(), 2);
    }

    #[test]
    fn trackstep_line_splits_halfwords() {
        let words = [0xEFFE_0001, 0x0002_0003, 0, 0];
        let mdat = mdat_with_words(0x200, 0x210, 0x210, &words);
        let module = parse(&mdat, &[]).unwrap();
        let line = module.trackstep_line(0);
        assert_eq!(&line[..4], &[0xEFFE, 1, 2, 3]);
    }

    #[test]
    fn out_of_range_word_reads_as_zero() {
        let mdat = mdat_with_words(0x200, 0x204, 0x208, &[]);
        let module = parse(&mdat, &[]).unwrap();
        assert_eq!(module.word(1000), 0);
    }

    #[test]
    fn word_field_access() {
        let mut w = Word(0x8041_F203);
        assert_eq!(w.byte0(), 0x80);
        assert_eq!(w.byte1(), 0x41);
        assert_eq!(w.byte2(), 0xF2);
        assert_eq!(w.byte3(), 0x03);
        assert_eq!(w.half1(), 0xF203);
        assert_eq!(w.low24(), 0x41_F203);
        w.set_byte0(0x12);
        w.set_byte3(0xFF);
        assert_eq!(w.0, 0x1241_F2FF);
    }
}
