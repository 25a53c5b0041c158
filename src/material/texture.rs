//! Texture parameters of IR nodes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::blit::{Image, TexelFormat};
use crate::util::{Extent3, Result};

use super::bsdf::TextureElement;

/// Cache key of the 2x2 magenta/black error texture.
pub const ERROR_TEXTURE_KEY: &str = "nbl/builtin/image_view/dummy2d";
/// Cache key of the sampler every texture is read with.
pub const DEFAULT_SAMPLER_KEY: &str = "nbl/builtin/sampler/default";

/// A resolved texture: cache keys of image and sampler plus the folded scale.
#[derive(Debug, Clone, PartialEq)]
pub struct IrTexture {
    pub image: String,
    pub sampler: String,
    pub scale: f32,
}

impl IrTexture {
    pub fn error() -> Self {
        Self { image: ERROR_TEXTURE_KEY.into(), sampler: DEFAULT_SAMPLER_KEY.into(), scale: 1.0 }
    }

    pub fn is_error(&self) -> bool {
        self.image == ERROR_TEXTURE_KEY
    }
}

/// How an image is consumed, which decides whether it is used as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageSemantic {
    Identity,
    BlendWeight,
    BumpMap,
    NormalMap,
}

/// Image lookup the compiler resolves texture references through.
pub trait TextureResolver {
    fn find_image(&self, key: &str) -> Option<Arc<Image>>;
    fn insert_image(&self, key: &str, image: Arc<Image>);
}

/// The error texture.
pub fn checkerboard() -> Image {
    let magenta = [1.0, 0.0, 1.0, 1.0];
    let black = [0.0, 0.0, 0.0, 1.0];
    let texels = [magenta, black, black, magenta];
    Image::from_linear(Extent3::d2(2, 2), TexelFormat::Rgba8Srgb, &texels)
        .unwrap_or_else(|_| Image::new(Extent3::d2(2, 2), TexelFormat::Rgba8Srgb))
}

/// Screen-space derivative map of a height or normal map, normalized so the
/// largest derivative is 1. Returns the map and the normalization factor.
pub fn derivative_map(source: &Image, was_normal: bool) -> Result<(Image, f32)> {
    let extent = source.extent();
    let (w, h) = (extent.width.max(1) as usize, extent.height.max(1) as usize);
    let texels = source.to_linear();
    let height = |x: usize, y: usize| {
        let t = texels[(y % h) * w + (x % w)];
        (t[0] + t[1] + t[2]) / 3.0
    };

    let mut derivatives = Vec::with_capacity(w * h);
    for y in 0..h {
        for x in 0..w {
            let d = if was_normal {
                let t = texels[y * w + x];
                let n = [t[0] * 2.0 - 1.0, t[1] * 2.0 - 1.0, (t[2] * 2.0 - 1.0).max(1e-3)];
                [-n[0] / n[2], -n[1] / n[2]]
            } else {
                let dx = (height(x + 1, y) - height(x + w - 1, y)) * 0.5 * w as f32;
                let dy = (height(x, y + 1) - height(x, y + h - 1)) * 0.5 * h as f32;
                [dx, dy]
            };
            derivatives.push(d);
        }
    }
    let max = derivatives.iter().fold(0.0f32, |m, d| m.max(d[0].abs()).max(d[1].abs()));
    let factor = if max > 0.0 { max } else { 1.0 };
    let out: Vec<[f32; 4]> = derivatives.iter().map(|d| [d[0] / factor, d[1] / factor, 0.0, 1.0]).collect();
    Ok((Image::from_linear(Extent3::d2(w as u32, h as u32), TexelFormat::Rgba32Float, &out)?, factor))
}

/// Texture resolution state kept across compiles: the normalization factor
/// of every derivative map built so far, keyed by derived image.
#[derive(Debug, Default)]
pub struct TextureStage {
    derivative_scales: HashMap<String, f32>,
}

impl TextureStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn derivative_maps(&self) -> usize {
        self.derivative_scales.len()
    }

    /// Resolve `element`, substituting the error texture when the reference
    /// dangles or names an image the resolver does not have.
    pub fn resolve(&mut self, element: &TextureElement, semantic: ImageSemantic, resolver: &dyn TextureResolver) -> IrTexture {
        let mut scale = 1.0f32;
        let mut current = Some(element);
        let filename = loop {
            match current {
                Some(TextureElement::Scale { scale: s, texture }) => {
                    scale *= s;
                    current = texture.as_deref();
                }
                Some(TextureElement::Bitmap { filename }) => break filename,
                None => {
                    tracing::error!("dangling texture reference after scale unwind, substituting error texture");
                    return IrTexture::error();
                }
            }
        };

        let key = match semantic {
            ImageSemantic::Identity | ImageSemantic::BlendWeight => {
                if resolver.find_image(filename).is_none() {
                    tracing::error!(%filename, "texture not in asset cache, substituting error texture");
                    return IrTexture::error();
                }
                filename.clone()
            }
            ImageSemantic::BumpMap | ImageSemantic::NormalMap => {
                let was_normal = semantic == ImageSemantic::NormalMap;
                let derived = format!("{filename}?{}", if was_normal { "normal-derivative" } else { "derivative" });
                match self.derivative_scales.get(&derived) {
                    Some(factor) => scale *= factor,
                    None => {
                        let Some(source) = resolver.find_image(filename) else {
                            tracing::error!(%filename, "bump map not in asset cache, substituting error texture");
                            return IrTexture::error();
                        };
                        match derivative_map(&source, was_normal) {
                            Ok((map, factor)) => {
                                tracing::debug!(%filename, factor, "derivative map built");
                                resolver.insert_image(&derived, Arc::new(map));
                                self.derivative_scales.insert(derived.clone(), factor);
                                scale *= factor;
                            }
                            Err(e) => {
                                tracing::error!(%filename, "derivative map failed ({e}), substituting error texture");
                                return IrTexture::error();
                            }
                        }
                    }
                }
                derived
            }
        };
        IrTexture { image: key, sampler: DEFAULT_SAMPLER_KEY.into(), scale }
    }
}
