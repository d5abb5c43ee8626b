//! Participant color assignment

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Color assigned to a participant (cursor, selection highlights).
///
/// Serialized as a `#rrggbb` hex string so clients can use it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipantColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl ParticipantColor {
    pub fn from_index(index: usize) -> Self {
        const COLORS: [(u8, u8, u8); 10] = [
            (66, 133, 244),   // Blue
            (234, 67, 53),    // Red
            (251, 188, 4),    // Yellow
            (52, 168, 83),    // Green
            (156, 39, 176),   // Purple
            (255, 87, 34),    // Orange
            (0, 188, 212),    // Cyan
            (233, 30, 99),    // Pink
            (63, 81, 181),    // Indigo
            (139, 195, 74),   // Light Green
        ];
        let (r, g, b) = COLORS[index % COLORS.len()];
        Self { r, g, b }
    }

    /// Parse a `#rrggbb` string.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.strip_prefix('#')?;
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(Self { r, g, b })
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn to_rgba(&self, alpha: f32) -> String {
        format!("rgba({}, {}, {}, {})", self.r, self.g, self.b, alpha)
    }
}

impl Serialize for ParticipantColor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ParticipantColor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex)
            .ok_or_else(|| D::Error::custom(format!("invalid color: {hex}")))
    }
}
