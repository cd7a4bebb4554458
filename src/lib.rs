//! Playback engine for TFMX music modules.
//!
//! A TFMX song ships as two files: a music-data file (`mdat.*`) holding the
//! header, track steps, patterns and voice macros, and a raw 8-bit signed
//! PCM sample bank (`smpl.*`). [`parse`] turns the pair into a [`Module`];
//! a [`Player`] interprets the module tick by tick and resamples the active
//! voices into stereo float output via [`Player::render`].

#![forbid(unsafe_code)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    clippy::pedantic,
    clippy::nursery,
    missing_docs
)]
#![expect(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
#![allow(
    clippy::too_many_lines,
    clippy::struct_excessive_bools,
    clippy::redundant_pub_crate,
    clippy::cognitive_complexity
)]

mod effects;
mod header;
mod macros;
mod mixer;
mod module;
mod player;
mod state;
mod tracks;

use std::path::{Path, PathBuf};

pub use {
    header::Header,
    module::{parse, FormatError, Module},
    player::{Config, DisplayState, Player, TrackState},
};

pub(crate) const TEXT_ROW_LEN: usize = 40;
pub(crate) const TEXT_ROWS: usize = 6;
pub(crate) const MAX_SONGS: usize = 32;
pub(crate) const MAX_CHANNELS: usize = 8;

/// Error when trying to load a song from disk.
#[derive(Debug, thiserror::Error)]
pub enum SongLoadError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The music-data file is not a usable TFMX module
    #[error("mdat load error: {0}")]
    Format(#[from] FormatError),
}

/// Owns the bytes of an `mdat.*`/`smpl.*` file pair.
///
/// [`Module`] borrows the sample bank, so the bytes have to live somewhere;
/// this is that somewhere for file-based hosts.
pub struct SongData {
    mdat: Vec<u8>,
    smpl: Vec<u8>,
}

impl SongData {
    /// Parse the owned bytes into a [`Module`].
    ///
    /// # Errors
    ///
    /// Errors if the music-data bytes are not a valid TFMX module.
    pub fn module(&self) -> Result<Module<'_>, FormatError> {
        parse(&self.mdat, &self.smpl)
    }
}

/// Used to load a [`SongData`] from an `mdat.*`/`smpl.*` file pair
pub struct PlayerBuilder {
    mdat_path: PathBuf,
    smpl_path: Option<PathBuf>,
}

impl PlayerBuilder {
    /// Create a new [`PlayerBuilder`] with the specified mdat path
    pub fn new<P: Into<PathBuf>>(mdat_path: P) -> Self {
        Self {
            mdat_path: mdat_path.into(),
            smpl_path: None,
        }
    }

    /// Specify a file to use as the sample file (usually `smpl.*`).
    ///
    /// When not given, the path is derived from the mdat path by the
    /// `mdat.` to `smpl.` filename substitution.
    pub fn smpl_file<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
        self.smpl_path = Some(path.into());
        self
    }

    /// Read both files.
    ///
    /// # Errors
    ///
    /// Errors on I/O failure or when the music data fails the header check.
    pub fn build(&mut self) -> Result<SongData, SongLoadError> {
        let mdat = std::fs::read(&self.mdat_path)?;
        let smpl_path = self
            .smpl_path
            .take()
            .unwrap_or_else(|| derive_smpl_path(&self.mdat_path));
        let smpl = std::fs::read(smpl_path)?;
        let data = SongData { mdat, smpl };
        // Validate up front so hosts learn about a bad file at load time.
        data.module()?;
        Ok(data)
    }
}

fn derive_smpl_path(mdat_path: &Path) -> PathBuf {
    let Some(name) = mdat_path.file_name().and_then(|n| n.to_str()) else {
        return mdat_path.to_owned();
    };
    mdat_path.with_file_name(name.replacen("mdat.", "smpl.", 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smpl_path_derived_from_mdat_name() {
        let p = derive_smpl_path(Path::new("/music/mdat.monkey"));
        assert_eq!(p, Path::new("/music/smpl.monkey"));
    }

    #[test]
    fn smpl_path_left_alone_without_mdat_prefix() {
        let p = derive_smpl_path(Path::new("/music/song.tfx"));
        assert_eq!(p, Path::new("/music/song.tfx"));
    }
}
