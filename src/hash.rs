//! Perceptual hashing of pictures.
//!
//! Every picture is fingerprinted with a 64-bit difference hash (dHash): the image is
//! resampled to a 9×8 grid, converted to grayscale, and each row contributes one bit per
//! pair of neighbouring pixels (set when the left pixel is strictly darker than the right one).
//! Two fingerprints are compared through their Hamming distance.

use image::{DynamicImage, ImageError, imageops::FilterType};
use std::{
    error::Error,
    fmt::Display,
    path::{Path, PathBuf},
};

/// The Hamming distance at or under which two hashes are considered similar.
pub const SIM_DIST_THRESHOLD: u32 = 10;

const GRID_WIDTH: u32 = 9;
const GRID_HEIGHT: u32 = 8;

/// Represents a 64-bit difference hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PictureHash(u64);

impl PictureHash {
    /// Reinterprets the hash as a signed integer, the representation used by SQLite columns.
    pub fn to_signed(self) -> i64 {
        self.0 as i64
    }

    /// Number of differing bits between the two hashes.
    pub fn distance(self, other: PictureHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Compares this hash with another one.
    ///
    /// The confidence is `(11 - d - 0.1) / 11` when the distance `d` is at most
    /// [`SIM_DIST_THRESHOLD`], and 0 otherwise. It therefore never reaches 1.0, even for
    /// identical hashes, and stays positive at the threshold itself.
    pub fn similarity(self, other: PictureHash) -> Similarity {
        let distance = self.distance(other);
        let confidence = if distance <= SIM_DIST_THRESHOLD {
            let range = (SIM_DIST_THRESHOLD + 1) as f32;
            (range - distance as f32 - 0.1) / range
        } else {
            0.0
        };

        Similarity {
            distance,
            confidence,
        }
    }
}

/// Result of comparing two [`PictureHash`]es.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Similarity {
    /// Hamming distance, between 0 and 64.
    pub distance: u32,
    /// Confidence index, between 0.0 and 1.0 (exclusive).
    pub confidence: f32,
}

impl Similarity {
    pub fn is_similar(&self) -> bool {
        self.distance <= SIM_DIST_THRESHOLD
    }
}

impl Display for PictureHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl TryFrom<&str> for PictureHash {
    type Error = HashParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.len() != 16 {
            return Err(HashParseError::InvalidLength);
        }

        u64::from_str_radix(value, 16)
            .map(PictureHash)
            .map_err(|_| HashParseError::InvalidHex)
    }
}

impl TryFrom<String> for PictureHash {
    type Error = HashParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<u64> for PictureHash {
    fn from(value: u64) -> Self {
        PictureHash(value)
    }
}

impl From<i64> for PictureHash {
    fn from(value: i64) -> Self {
        PictureHash(value as u64)
    }
}

impl From<PictureHash> for u64 {
    fn from(value: PictureHash) -> Self {
        value.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum HashParseError {
    InvalidLength,
    InvalidHex,
}

impl Display for HashParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashParseError::InvalidLength => {
                write!(f, "picture hash must be exactly 16 hexadecimal characters.")
            }
            HashParseError::InvalidHex => {
                write!(f, "picture hash contains invalid hexadecimal characters.")
            }
        }
    }
}

impl Error for HashParseError {}

/// Errors that can occur while hashing a picture.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("could not read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not decode image")]
    Decode(#[source] ImageError),
}

/// Computes the dHash of an already decoded image.
pub fn compute_for_image(img: &DynamicImage) -> PictureHash {
    let grid = img
        .resize_exact(GRID_WIDTH, GRID_HEIGHT, FilterType::Triangle)
        .to_rgb8();

    let mut hash = 0u64;
    let mut p = 0;
    for y in 0..GRID_HEIGHT {
        for x in 0..GRID_WIDTH - 1 {
            if luma(grid.get_pixel(x, y).0) < luma(grid.get_pixel(x + 1, y).0) {
                hash |= 1 << p;
            }
            p += 1;
        }
    }

    PictureHash(hash)
}

/// Decodes the given bytes and computes their dHash.
pub fn compute_for_bytes(bytes: &[u8]) -> Result<PictureHash, HashError> {
    let img = image::load_from_memory(bytes).map_err(HashError::Decode)?;
    Ok(compute_for_image(&img))
}

/// Reads and decodes the file at `path`, then computes its dHash.
///
/// This performs blocking I/O and decoding; callers on an async runtime should run it
/// on a blocking worker.
pub fn compute_for_file(path: &Path) -> Result<PictureHash, HashError> {
    let img = image::open(path).map_err(|e| match e {
        ImageError::IoError(source) => HashError::Io {
            path: path.to_path_buf(),
            source,
        },
        other => HashError::Decode(other),
    })?;

    Ok(compute_for_image(&img))
}

fn luma([r, g, b]: [u8; 3]) -> u8 {
    (r as f32 * 0.299 + g as f32 * 0.587 + b as f32 * 0.114) as u8
}
