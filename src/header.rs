use crate::{module::FormatError, MAX_CHANNELS, MAX_SONGS, TEXT_ROWS, TEXT_ROW_LEN};

/// Size of the on-disk header; module data follows immediately after.
pub(crate) const HEADER_LEN: usize = 512;

/// Magic prefixes a music-data file may announce itself with.
const MAGICS: [&[u8]; 4] = [b"TFMX-SONG ", b"TFMX_SONG ", b"TFMXSONG ", b"TFMX "];

/// Decoded music-data header: song metadata plus the word indices of the
/// trackstep, pattern and macro sections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Six fixed-width text lines, raw bytes with null padding preserved.
    pub text: [u8; TEXT_ROWS * TEXT_ROW_LEN],
    /// First trackstep position per sub-song.
    pub song_starts: [u16; MAX_SONGS],
    /// Last trackstep position per sub-song.
    pub song_ends: [u16; MAX_SONGS],
    /// Tempo per sub-song; below 16 it is a tick prescale, otherwise a
    /// divisor for the tempo clock.
    pub song_tempos: [u16; MAX_SONGS],
    /// Word index of the trackstep table.
    pub track_start: usize,
    /// Word index of the pattern start-offset table.
    pub patt_start: usize,
    /// Word index of the macro start-offset table.
    pub macro_start: usize,
}

impl Header {
    /// Decode the header from the first [`HEADER_LEN`] bytes of an mdat
    /// file.
    ///
    /// # Errors
    ///
    /// Errors when the data is too short, the magic is unrecognized, or a
    /// section offset points before the data region.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_LEN {
            return Err(FormatError::Truncated { len: bytes.len() });
        }
        let img: HeaderImage = bytemuck::pod_read_unaligned(&bytes[..HEADER_LEN]);
        if !MAGICS.iter().any(|m| img.magic.starts_with(m)) {
            return Err(FormatError::MagicMismatch);
        }
        Ok(Self {
            text: img.text,
            song_starts: img.song_starts.map(u16::from_be),
            song_ends: img.song_ends.map(u16::from_be),
            song_tempos: img.song_tempos.map(u16::from_be),
            track_start: section_index(u32::from_be(img.trackstart), 0x180)?,
            patt_start: section_index(u32::from_be(img.pattstart), 0x80)?,
            macro_start: section_index(u32::from_be(img.macrostart), 0x100)?,
        })
    }

    /// Return the rows of text that are valid UTF-8 and aren't empty
    pub fn text_rows(&self) -> impl Iterator<Item = &str> {
        self.text.chunks_exact(TEXT_ROW_LEN).filter_map(|chk| {
            std::str::from_utf8(chk)
                .ok()
                .filter(|txt| !txt.trim_matches('\0').trim().is_empty())
        })
    }

    /// Number of sub-songs: the largest index with a nonzero end position,
    /// plus one.
    pub fn sub_song_count(&self) -> usize {
        self.song_ends
            .iter()
            .rposition(|&end| end > 0)
            .map_or(0, |i| i + 1)
    }
}

/// A zero file offset selects the format's fixed default section index;
/// anything else is converted from a byte offset into a word index.
fn section_index(file_offset: u32, default: usize) -> Result<usize, FormatError> {
    if file_offset == 0 {
        return Ok(default);
    }
    let rel = file_offset
        .checked_sub(HEADER_LEN as u32)
        .ok_or(FormatError::BadSectionOffset {
            offset: file_offset,
        })?;
    Ok((rel >> 2) as usize)
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct HeaderImage {
    magic: [u8; 10],
    _pad: [u8; 6],
    text: [u8; TEXT_ROWS * TEXT_ROW_LEN],
    song_starts: [u16; MAX_SONGS],
    song_ends: [u16; MAX_SONGS],
    song_tempos: [u16; MAX_SONGS],
    mute: [i16; MAX_CHANNELS],
    trackstart: u32,
    pattstart: u32,
    macrostart: u32,
    _pad2: [u8; 36],
}
