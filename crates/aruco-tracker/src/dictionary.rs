//! Marker dictionaries.
//!
//! Codes use row-major bit ordering: bit `y * n + x` is the inner cell at
//! column `x`, row `y` (top-left first); a set bit is a white cell.

use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Closed set of recognised dictionary identifiers (OpenCV naming).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DictionaryName {
    Dict4x4_50,
    Dict4x4_100,
    Dict4x4_250,
    Dict4x4_1000,
    Dict5x5_50,
    Dict5x5_100,
    Dict5x5_250,
    Dict5x5_1000,
    Dict6x6_50,
    Dict6x6_100,
    Dict6x6_250,
    Dict6x6_1000,
    Dict7x7_50,
    Dict7x7_100,
    Dict7x7_250,
    Dict7x7_1000,
    ArucoOriginal,
    AprilTag16h5,
    AprilTag25h9,
    AprilTag36h10,
    AprilTag36h11,
}

impl DictionaryName {
    pub const ALL: [DictionaryName; 21] = [
        DictionaryName::Dict4x4_50,
        DictionaryName::Dict4x4_100,
        DictionaryName::Dict4x4_250,
        DictionaryName::Dict4x4_1000,
        DictionaryName::Dict5x5_50,
        DictionaryName::Dict5x5_100,
        DictionaryName::Dict5x5_250,
        DictionaryName::Dict5x5_1000,
        DictionaryName::Dict6x6_50,
        DictionaryName::Dict6x6_100,
        DictionaryName::Dict6x6_250,
        DictionaryName::Dict6x6_1000,
        DictionaryName::Dict7x7_50,
        DictionaryName::Dict7x7_100,
        DictionaryName::Dict7x7_250,
        DictionaryName::Dict7x7_1000,
        DictionaryName::ArucoOriginal,
        DictionaryName::AprilTag16h5,
        DictionaryName::AprilTag25h9,
        DictionaryName::AprilTag36h10,
        DictionaryName::AprilTag36h11,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DictionaryName::Dict4x4_50 => "DICT_4X4_50",
            DictionaryName::Dict4x4_100 => "DICT_4X4_100",
            DictionaryName::Dict4x4_250 => "DICT_4X4_250",
            DictionaryName::Dict4x4_1000 => "DICT_4X4_1000",
            DictionaryName::Dict5x5_50 => "DICT_5X5_50",
            DictionaryName::Dict5x5_100 => "DICT_5X5_100",
            DictionaryName::Dict5x5_250 => "DICT_5X5_250",
            DictionaryName::Dict5x5_1000 => "DICT_5X5_1000",
            DictionaryName::Dict6x6_50 => "DICT_6X6_50",
            DictionaryName::Dict6x6_100 => "DICT_6X6_100",
            DictionaryName::Dict6x6_250 => "DICT_6X6_250",
            DictionaryName::Dict6x6_1000 => "DICT_6X6_1000",
            DictionaryName::Dict7x7_50 => "DICT_7X7_50",
            DictionaryName::Dict7x7_100 => "DICT_7X7_100",
            DictionaryName::Dict7x7_250 => "DICT_7X7_250",
            DictionaryName::Dict7x7_1000 => "DICT_7X7_1000",
            DictionaryName::ArucoOriginal => "DICT_ARUCO_ORIGINAL",
            DictionaryName::AprilTag16h5 => "DICT_APRILTAG_16H5",
            DictionaryName::AprilTag25h9 => "DICT_APRILTAG_25H9",
            DictionaryName::AprilTag36h10 => "DICT_APRILTAG_36H10",
            DictionaryName::AprilTag36h11 => "DICT_APRILTAG_36H11",
        }
    }

    /// Index into OpenCV's predefined dictionary table.
    pub fn opencv_id(self) -> i32 {
        Self::ALL.iter().position(|n| *n == self).unwrap_or(0) as i32
    }

    /// Whether a code table ships with this crate (no OpenCV needed).
    pub fn is_builtin(self) -> bool {
        matches!(
            self,
            DictionaryName::Dict4x4_50 | DictionaryName::Dict4x4_100 | DictionaryName::ArucoOriginal
        )
    }
}

impl Default for DictionaryName {
    fn default() -> Self {
        DictionaryName::Dict4x4_50
    }
}

impl fmt::Display for DictionaryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DictionaryName {
    type Err = Error;

    /// Accepts `DICT_4X4_50`, `4x4_50`, `aruco_original`, ... (case-insensitive).
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let key = upper.strip_prefix("DICT_").unwrap_or(&upper);
        Self::ALL
            .iter()
            .copied()
            .find(|n| n.as_str().strip_prefix("DICT_") == Some(key))
            .ok_or_else(|| Error::Config(format!("unknown marker dictionary '{s}'")))
    }
}

/// A resolved dictionary handle.
#[derive(Clone, Debug)]
pub struct Dictionary {
    name: DictionaryName,
    /// Inner grid size in cells (4 for 4x4).
    marker_size: usize,
    max_correction_bits: u32,
    codes: Vec<u64>,
    code_to_id: HashMap<u64, u32>,
}

impl Dictionary {
    /// Resolve a name to a built-in code table.
    pub fn builtin(name: DictionaryName) -> Result<Self> {
        let (marker_size, max_correction_bits, codes) = match name {
            DictionaryName::Dict4x4_50 => (4, 1, ARUCO_4X4_100_CODES[..50].to_vec()),
            DictionaryName::Dict4x4_100 => (4, 1, ARUCO_4X4_100_CODES.to_vec()),
            DictionaryName::ArucoOriginal => (5, 0, aruco_original_codes()),
            _ => {
                return Err(Error::Config(format!(
                    "dictionary {name} has no built-in code table; enable the opencv backend"
                )))
            }
        };
        Ok(Self::from_codes(name, marker_size, max_correction_bits, codes))
    }

    pub fn from_codes(
        name: DictionaryName,
        marker_size: usize,
        max_correction_bits: u32,
        codes: Vec<u64>,
    ) -> Self {
        let code_to_id = codes
            .iter()
            .enumerate()
            .map(|(id, &c)| (c, id as u32))
            .collect();
        Self {
            name,
            marker_size,
            max_correction_bits,
            codes,
            code_to_id,
        }
    }

    pub fn name(&self) -> DictionaryName {
        self.name
    }

    pub fn marker_size(&self) -> usize {
        self.marker_size
    }

    pub fn max_correction_bits(&self) -> u32 {
        self.max_correction_bits
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn code(&self, id: u32) -> Option<u64> {
        self.codes.get(id as usize).copied()
    }

    /// Inner bit of marker `id` at (`x`, `y`); `true` is white.
    pub fn cell(&self, id: u32, x: usize, y: usize) -> Option<bool> {
        let n = self.marker_size;
        if x >= n || y >= n {
            return None;
        }
        self.code(id).map(|c| (c >> (y * n + x)) & 1 == 1)
    }

    /// Match an observed code in the marker's own orientation.
    /// Returns (id, corrected bits).
    pub fn identify(&self, bits: u64) -> Option<(u32, u32)> {
        if let Some(&id) = self.code_to_id.get(&bits) {
            return Some((id, 0));
        }
        if self.max_correction_bits == 0 {
            return None;
        }
        self.codes
            .iter()
            .enumerate()
            .map(|(id, &c)| (id as u32, (c ^ bits).count_ones()))
            .filter(|&(_, h)| h <= self.max_correction_bits)
            .min_by_key(|&(_, h)| h)
    }
}

/// Original ArUco library markers: each 5-bit row carries 2 id bits.
fn aruco_original_codes() -> Vec<u64> {
    const WORDS: [u64; 4] = [0x10, 0x17, 0x09, 0x0e];
    (0..1024u64)
        .map(|id| {
            let mut code = 0u64;
            for y in 0..5 {
                let word = WORDS[((id >> (2 * (4 - y))) & 0x3) as usize];
                for x in 0..5 {
                    if (word >> (4 - x)) & 1 == 1 {
                        code |= 1 << (y * 5 + x);
                    }
                }
            }
            code
        })
        .collect()
}

/// ArUco 4x4 codes; the first 50 form DICT_4X4_50.
#[rustfmt::skip]
const ARUCO_4X4_100_CODES: [u64; 100] = [
    0x4cad, 0x59f0, 0xb4cc, 0x6299, 0x792a, 0xb39e, 0x7479, 0x4f23,
    0x5b7f, 0x6af3, 0x899f, 0xe588, 0xed70, 0xf054, 0x8d24, 0x7c64,
    0xa662, 0x0066, 0x7a36, 0xf56e, 0xd161, 0xd40d, 0xab33, 0x41bb,
    0xe27f, 0x8e29, 0x2735, 0x2aa5, 0xc484, 0xf62c, 0xa822, 0x4dea,
    0xf379, 0xd30f, 0x7510, 0x9490, 0xae18, 0xff20, 0x6fb0, 0x5a38,
    0x18e8, 0x1454, 0x314c, 0x4d1c, 0x1724, 0xd774, 0xfcb4, 0x26d2,
    0x740a, 0xc80a, 0x298a, 0x16aa, 0x82ba, 0xe9fa, 0x8016, 0xe616,
    0x2486, 0x9786, 0x48d6, 0xa7f6, 0xfbe6, 0xd87e, 0x0501, 0x22c1,
    0x45d1, 0x5ec9, 0x3621, 0x54a1, 0x39a1, 0x9139, 0x85f9, 0x3edd,
    0x203d, 0xda6d, 0x13fd, 0xd5ed, 0xf853, 0x4693, 0x1a9b, 0xabcb,
    0x1933, 0x05e3, 0xeca3, 0xba97, 0xa49f, 0xdddf, 0x5477, 0xb2ef,
    0xaeac, 0xb551, 0xe86e, 0xf350, 0xd260, 0x83b4, 0x1b92, 0x2fc2,
    0x6cf2, 0xcbf2, 0x2796, 0xe30e,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(
            "DICT_4X4_50".parse::<DictionaryName>().unwrap(),
            DictionaryName::Dict4x4_50
        );
        assert_eq!(
            "aruco_original".parse::<DictionaryName>().unwrap(),
            DictionaryName::ArucoOriginal
        );
        assert_eq!(
            "dict_apriltag_36h11".parse::<DictionaryName>().unwrap(),
            DictionaryName::AprilTag36h11
        );
        assert!(matches!(
            "DICT_9X9_12".parse::<DictionaryName>(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_display_round_trip() {
        for name in DictionaryName::ALL {
            assert_eq!(name.to_string().parse::<DictionaryName>().unwrap(), name);
        }
        assert_eq!(DictionaryName::default().opencv_id(), 0);
        assert_eq!(DictionaryName::ArucoOriginal.opencv_id(), 16);
    }

    #[test]
    fn test_builtin_tables() {
        let d = Dictionary::builtin(DictionaryName::Dict4x4_50).unwrap();
        assert_eq!(d.len(), 50);
        assert_eq!(d.marker_size(), 4);
        let d = Dictionary::builtin(DictionaryName::ArucoOriginal).unwrap();
        assert_eq!(d.len(), 1024);
        assert!(Dictionary::builtin(DictionaryName::Dict6x6_250).is_err());
    }

    #[test]
    fn test_identify_exact_and_corrected() {
        let d = Dictionary::builtin(DictionaryName::Dict4x4_50).unwrap();
        let code = d.code(7).unwrap();
        assert_eq!(d.identify(code), Some((7, 0)));
        assert_eq!(d.identify(code ^ 0b100), Some((7, 1)));
        let orig = Dictionary::builtin(DictionaryName::ArucoOriginal).unwrap();
        let c = orig.code(300).unwrap();
        assert_eq!(orig.identify(c), Some((300, 0)));
        assert_eq!(orig.identify(c ^ 1), None);
    }

    #[test]
    fn test_aruco_original_ids_are_unique() {
        let codes = aruco_original_codes();
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), 1024);
    }
}
