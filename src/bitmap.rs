// Presence bitmaps ↔ display strings
//
// Used by both enrichment blocks: enrollment months and wage quarters.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PRESENT: char = '#';
pub const DEFAULT_ABSENT: char = '_';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapCodec {
    pub present: char,
    pub absent: char,
}

impl BitmapCodec {
    pub fn new(present: char, absent: char) -> Self {
        BitmapCodec { present, absent }
    }

    /// 1 → present marker, anything else → absent marker.
    pub fn encode(&self, bits: &[u8]) -> String {
        encode_bitmap(bits, self.present, self.absent)
    }

    pub fn decode(&self, display: &str) -> Vec<u8> {
        decode_bitmap(display, self.present)
    }
}

impl Default for BitmapCodec {
    fn default() -> Self {
        BitmapCodec::new(DEFAULT_PRESENT, DEFAULT_ABSENT)
    }
}

pub fn encode_bitmap(bits: &[u8], present: char, absent: char) -> String {
    bits.iter()
        .map(|&bit| if bit == 1 { present } else { absent })
        .collect()
}

/// Only the presence marker maps to 1.
pub fn decode_bitmap(display: &str, present: char) -> Vec<u8> {
    display
        .chars()
        .map(|c| u8::from(c == present))
        .collect()
}
