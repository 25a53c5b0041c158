//! CPU images in the texel formats the blitter accepts.
//!
//! Texels decode to linear `[f32; 4]` before filtering and encode back after.
//! Alpha is always stored linearly, sRGB only applies to color.

use std::path::Path;

use half::f16;

use crate::util::{Error, Extent3, Result};

/// Storage format of an [`Image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TexelFormat {
    Rgba8Unorm,
    Rgba8Srgb,
    Rgba16Float,
    Rgba32Float,
}

impl TexelFormat {
    pub fn bytes_per_texel(self) -> usize {
        match self {
            Self::Rgba8Unorm | Self::Rgba8Srgb => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }

    pub fn is_normalized(self) -> bool {
        matches!(self, Self::Rgba8Unorm | Self::Rgba8Srgb)
    }
}

#[inline]
pub fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 { c / 12.92 } else { ((c + 0.055) / 1.055).powf(2.4) }
}

#[inline]
pub fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 { c * 12.92 } else { 1.055 * c.powf(1.0 / 2.4) - 0.055 }
}

#[inline]
fn unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Tightly packed 1D/2D/3D image, x fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    extent: Extent3,
    format: TexelFormat,
    data: Vec<u8>,
}

impl Image {
    /// Zero-filled image.
    pub fn new(extent: Extent3, format: TexelFormat) -> Self {
        let len = extent.texel_count() as usize * format.bytes_per_texel();
        Self { extent, format, data: vec![0; len] }
    }

    pub fn from_bytes(extent: Extent3, format: TexelFormat, data: Vec<u8>) -> Result<Self> {
        let expected = extent.texel_count() as usize * format.bytes_per_texel();
        if data.len() != expected {
            return Err(Error::range(format!("{:?} image {:?} needs {expected} bytes, got {}", format, extent, data.len())));
        }
        Ok(Self { extent, format, data })
    }

    /// Encode linear texels into `format`.
    pub fn from_linear(extent: Extent3, format: TexelFormat, texels: &[[f32; 4]]) -> Result<Self> {
        if texels.len() as u64 != extent.texel_count() {
            return Err(Error::range(format!("{} texels for an image of {:?}", texels.len(), extent)));
        }
        let mut data = Vec::with_capacity(texels.len() * format.bytes_per_texel());
        for t in texels {
            match format {
                TexelFormat::Rgba8Unorm => data.extend(t.iter().map(|&c| unorm8(c))),
                TexelFormat::Rgba8Srgb => {
                    data.extend(t[..3].iter().map(|&c| unorm8(linear_to_srgb(c.clamp(0.0, 1.0)))));
                    data.push(unorm8(t[3]));
                }
                TexelFormat::Rgba16Float => {
                    for &c in t {
                        data.extend_from_slice(&f16::from_f32(c).to_le_bytes());
                    }
                }
                TexelFormat::Rgba32Float => data.extend_from_slice(bytemuck::cast_slice(t)),
            }
        }
        Ok(Self { extent, format, data })
    }

    pub fn extent(&self) -> Extent3 {
        self.extent
    }

    pub fn format(&self) -> TexelFormat {
        self.format
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn texel_count(&self) -> usize {
        self.extent.texel_count() as usize
    }

    /// Decode texel `index` to linear RGBA.
    pub fn texel(&self, index: usize) -> [f32; 4] {
        let size = self.format.bytes_per_texel();
        let raw = &self.data[index * size..(index + 1) * size];
        match self.format {
            TexelFormat::Rgba8Unorm => [0, 1, 2, 3].map(|i| raw[i] as f32 / 255.0),
            TexelFormat::Rgba8Srgb => {
                let c = [0, 1, 2].map(|i| srgb_to_linear(raw[i] as f32 / 255.0));
                [c[0], c[1], c[2], raw[3] as f32 / 255.0]
            }
            TexelFormat::Rgba16Float => {
                [0, 1, 2, 3].map(|i| f16::from_le_bytes([raw[2 * i], raw[2 * i + 1]]).to_f32())
            }
            TexelFormat::Rgba32Float => bytemuck::pod_read_unaligned(raw),
        }
    }

    pub fn to_linear(&self) -> Vec<[f32; 4]> {
        (0..self.texel_count()).map(|i| self.texel(i)).collect()
    }

    /// Load a PNG (sRGB) or an HDR/EXR (float) file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::AssetNotFound(path.to_path_buf()));
        }
        let img = image::ImageReader::open(path)?.with_guessed_format()?.decode()?;
        let (width, height) = (img.width(), img.height());
        if width == 0 || height == 0 {
            return Err(Error::EmptyAsset(path.to_path_buf()));
        }
        let extent = Extent3::d2(width, height);
        let hdr = matches!(
            img,
            image::DynamicImage::ImageRgb32F(_) | image::DynamicImage::ImageRgba32F(_)
        );
        if hdr {
            let rgba = img.to_rgba32f();
            Self::from_bytes(extent, TexelFormat::Rgba32Float, bytemuck::cast_slice(rgba.as_raw()).to_vec())
        } else {
            Self::from_bytes(extent, TexelFormat::Rgba8Srgb, img.to_rgba8().into_raw())
        }
    }

    /// Save a 2D image. The extension picks the container: `exr` and `hdr`
    /// store linear floats, anything else is written as 8-bit sRGB.
    pub fn save(&self, path: &Path) -> Result<()> {
        if self.extent.depth != 1 {
            return Err(Error::Unsupported(format!("saving a 3D image of depth {}", self.extent.depth)));
        }
        let (w, h) = (self.extent.width, self.extent.height);
        let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("exr") | Some("hdr") => {
                let raw: Vec<f32> = self.to_linear().into_iter().flatten().collect();
                let buf = image::Rgba32FImage::from_raw(w, h, raw)
                    .ok_or_else(|| Error::other("image buffer size mismatch"))?;
                let dynamic = image::DynamicImage::ImageRgba32F(buf);
                if ext.as_deref() == Some("hdr") {
                    image::DynamicImage::ImageRgb32F(dynamic.to_rgb32f()).save(path)?;
                } else {
                    dynamic.save(path)?;
                }
            }
            _ => {
                let srgb = if self.format == TexelFormat::Rgba8Srgb {
                    self.data.clone()
                } else {
                    Self::from_linear(self.extent, TexelFormat::Rgba8Srgb, &self.to_linear())?.data
                };
                let buf = image::RgbaImage::from_raw(w, h, srgb)
                    .ok_or_else(|| Error::other("image buffer size mismatch"))?;
                buf.save(path)?;
            }
        }
        tracing::debug!(path = %path.display(), width = w, height = h, "image saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_srgb_decodes_color_but_not_alpha() {
        let img = Image::from_bytes(Extent3::d2(1, 1), TexelFormat::Rgba8Srgb, vec![128, 0, 255, 128]).unwrap();
        let t = img.texel(0);
        assert!((t[0] - 0.2158).abs() < 1e-3);
        assert_eq!(t[2], 1.0);
        assert!((t[3] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_half_storage_is_lossy_within_precision() {
        let texels = vec![[0.1, 0.5, 2.0, 0.75]; 4];
        let img = Image::from_linear(Extent3::d2(2, 2), TexelFormat::Rgba16Float, &texels).unwrap();
        assert_eq!(img.bytes().len(), 32);
        let back = img.texel(3);
        assert!((back[0] - 0.1).abs() < 1e-3);
        assert_eq!(back[2], 2.0);
    }

    #[test]
    fn test_png_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.png");
        let texels: Vec<[f32; 4]> = (0..6).map(|i| [i as f32 / 5.0, 0.0, 1.0, 1.0]).collect();
        let img = Image::from_linear(Extent3::d2(3, 2), TexelFormat::Rgba32Float, &texels).unwrap();
        img.save(&path).unwrap();
        let loaded = Image::load(&path).unwrap();
        assert_eq!(loaded.extent(), Extent3::d2(3, 2));
        assert_eq!(loaded.format(), TexelFormat::Rgba8Srgb);
        assert!((loaded.texel(5)[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_file() {
        let err = Image::load(Path::new("/nonexistent/none.png")).unwrap_err();
        assert!(matches!(err, Error::AssetNotFound(_)));
    }
}
