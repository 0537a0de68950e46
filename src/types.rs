//! Shared value types

use crate::error::{RenderError, Result};

/// Unique identifier of an open document handle within this process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DocumentId(pub u64);

impl DocumentId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Format of the document behind a handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentType {
    Pdf,
    Xps,
    Cbz,
}

impl DocumentType {
    /// File extension, also the format hint handed to native openers
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Xps => "xps",
            Self::Cbz => "cbz",
        }
    }

    /// Whether the native layer can extract hyperlinks for this format
    #[must_use]
    pub const fn supports_links(self) -> bool {
        match self {
            Self::Pdf => true,
            Self::Xps | Self::Cbz => false,
        }
    }
}

/// Pixel layout produced by a rasterization
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ColorMode {
    /// `0x00RRGGBB` per pixel
    #[default]
    Rgb,
    /// `0xAARRGGBB` per pixel, straight alpha
    Argb,
    /// `0xAARRGGBB` per pixel, premultiplied alpha
    ArgbPre,
    /// `0x00BBGGRR` per pixel
    Bgr,
    /// One luma byte per pixel
    Gray,
    /// One byte per pixel, 0 or 255, thresholded
    Binary,
    /// One byte per pixel, 0 or 255, Floyd-Steinberg dithered
    BinaryDither,
}

impl ColorMode {
    pub const ALL: [ColorMode; 7] = [
        Self::Rgb,
        Self::Argb,
        Self::ArgbPre,
        Self::Bgr,
        Self::Gray,
        Self::Binary,
        Self::BinaryDither,
    ];

    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Rgb => 1,
            Self::Argb => 2,
            Self::ArgbPre => 3,
            Self::Bgr => 4,
            Self::Gray => 10,
            Self::Binary => 12,
            Self::BinaryDither => 121,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.code() == code)
            .ok_or_else(|| RenderError::invalid(format!("unknown color mode {code}")))
    }

    /// Bytes per pixel in the packed buffer
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        if self.is_packed_int() { 4 } else { 1 }
    }

    /// Modes delivered as one `u32` per pixel
    #[must_use]
    pub const fn is_packed_int(self) -> bool {
        matches!(self, Self::Rgb | Self::Argb | Self::ArgbPre | Self::Bgr)
    }

    /// Modes rendered onto a transparent background
    #[must_use]
    pub const fn has_alpha(self) -> bool {
        matches!(self, Self::Argb | Self::ArgbPre)
    }

    #[must_use]
    pub const fn is_binary(self) -> bool {
        matches!(self, Self::Binary | Self::BinaryDither)
    }
}

/// Pixels copied out of the native buffer into process memory
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PixelData {
    Int(Vec<u32>),
    Byte(Vec<u8>),
}

impl PixelData {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int(p) => p.len(),
            Self::Byte(p) => p.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_int(&self) -> Option<&[u32]> {
        match self {
            Self::Int(p) => Some(p),
            Self::Byte(_) => None,
        }
    }

    #[must_use]
    pub fn as_byte(&self) -> Option<&[u8]> {
        match self {
            Self::Byte(p) => Some(p),
            Self::Int(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_codes_are_stable() {
        for mode in ColorMode::ALL {
            assert_eq!(ColorMode::from_code(mode.code()).unwrap(), mode);
        }
        assert_eq!(ColorMode::Rgb.code(), 1);
        assert_eq!(ColorMode::BinaryDither.code(), 121);
        assert!(ColorMode::from_code(7).is_err());
    }

    #[test]
    fn link_support_follows_document_type() {
        assert!(DocumentType::Pdf.supports_links());
        assert!(!DocumentType::Xps.supports_links());
        assert!(!DocumentType::Cbz.supports_links());
    }

    #[test]
    fn binary_modes_are_byte_modes() {
        for mode in ColorMode::ALL {
            if mode.is_binary() {
                assert_eq!(mode.bytes_per_pixel(), 1);
            }
        }
        assert!(!ColorMode::Gray.is_binary());
    }
}
