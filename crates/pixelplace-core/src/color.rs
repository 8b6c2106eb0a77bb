//! Opaque RGB colors.

use crate::error::CanvasError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 3-byte RGB color. Pixel writes are always opaque.
///
/// Serialized as a `[r, g, b]` array on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct ColorValue {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl ColorValue {
    pub const BLACK: ColorValue = ColorValue::new(0, 0, 0);
    pub const WHITE: ColorValue = ColorValue::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// The color as `[r, g, b]`.
    pub fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    /// Parse whatever a user typed into a color field.
    ///
    /// Non-hex characters are dropped, the remainder is right-padded with `0`
    /// to six digits and anything past six digits is ignored. This never fails:
    /// an empty string yields black.
    pub fn from_hex_lenient(input: &str) -> Self {
        let mut digits = [0u8; 6];
        for (slot, value) in digits
            .iter_mut()
            .zip(input.chars().filter_map(|c| c.to_digit(16)))
        {
            *slot = value as u8;
        }
        Self::new(
            digits[0] << 4 | digits[1],
            digits[2] << 4 | digits[3],
            digits[4] << 4 | digits[5],
        )
    }

    /// Convert to a peniko color for drawing surfaces.
    pub fn to_peniko(self) -> peniko::Color {
        peniko::Color::from_rgba8(self.r, self.g, self.b, 255)
    }
}

impl From<[u8; 3]> for ColorValue {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self::new(r, g, b)
    }
}

impl From<ColorValue> for [u8; 3] {
    fn from(color: ColorValue) -> Self {
        color.to_array()
    }
}

impl fmt::Display for ColorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Strict parse of `#RRGGBB` or `RRGGBB`.
impl FromStr for ColorValue {
    type Err = CanvasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CanvasError::InvalidColor(s.to_string()));
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16)
                .map_err(|_| CanvasError::InvalidColor(s.to_string()))
        };
        Ok(Self::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}
