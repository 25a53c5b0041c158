//! Asset loading and the shared asset cache.
//!
//! [`AssetManager::load`] turns a path into an [`AssetBundle`]: `.json` files
//! are BSDF graphs, `.exr`/`.hdr`/`.png` files are images. Images land in the
//! [`AssetCache`] under the path they were requested with, which is also the
//! key material textures resolve through.

mod convert;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::blit::{BorderColor, Image, WrapMode};
use crate::material::bsdf::{BsdfKind, FloatOrTexture, SpectrumOrTexture, TextureElement};
use crate::material::texture::{checkerboard, TextureResolver};
use crate::material::{BsdfGraph, DEFAULT_SAMPLER_KEY, ERROR_TEXTURE_KEY};
use crate::util::{Error, Result};

pub use convert::{GpuImage, GpuObjectConverter, PendingConversion, GPU_IMAGE_USAGE};

/// Sampler state referenced by IR textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerParams {
    pub wrap: [WrapMode; 3],
    pub border: BorderColor,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self { wrap: [WrapMode::Repeat; 3], border: BorderColor::OpaqueBlack }
    }
}

/// One loaded object.
#[derive(Debug, Clone)]
pub enum Asset {
    Image(Arc<Image>),
    Bsdf(Arc<BsdfGraph>),
}

/// Result of a load: everything one path produced.
#[derive(Debug, Clone, Default)]
pub struct AssetBundle {
    contents: Vec<Asset>,
}

impl AssetBundle {
    pub fn contents(&self) -> &[Asset] {
        &self.contents
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    pub fn image(&self) -> Option<Arc<Image>> {
        self.contents.iter().find_map(|a| match a {
            Asset::Image(i) => Some(i.clone()),
            Asset::Bsdf(_) => None,
        })
    }

    pub fn bsdf(&self) -> Option<Arc<BsdfGraph>> {
        self.contents.iter().find_map(|a| match a {
            Asset::Bsdf(g) => Some(g.clone()),
            Asset::Image(_) => None,
        })
    }
}

/// Thread-safe cache of images and samplers, seeded with the built-ins.
pub struct AssetCache {
    images: RwLock<HashMap<String, Arc<Image>>>,
    samplers: RwLock<HashMap<String, SamplerParams>>,
    image_bytes: AtomicUsize,
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCache")
            .field("images", &self.images.read().len())
            .field("samplers", &self.samplers.read().len())
            .field("image_bytes", &self.image_bytes())
            .finish()
    }
}

impl Default for AssetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetCache {
    pub fn new() -> Self {
        let cache = Self {
            images: RwLock::new(HashMap::new()),
            samplers: RwLock::new(HashMap::new()),
            image_bytes: AtomicUsize::new(0),
        };
        cache.insert_image(ERROR_TEXTURE_KEY, Arc::new(checkerboard()));
        cache.samplers.write().insert(DEFAULT_SAMPLER_KEY.into(), SamplerParams::default());
        cache
    }

    #[inline]
    pub fn image(&self, key: &str) -> Option<Arc<Image>> {
        self.images.read().get(key).cloned()
    }

    pub fn insert_image(&self, key: &str, image: Arc<Image>) {
        let size = image.bytes().len();
        if let Some(old) = self.images.write().insert(key.to_string(), image) {
            let _ = self.image_bytes.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(old.bytes().len()))
            });
        }
        self.image_bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub fn sampler(&self, key: &str) -> Option<SamplerParams> {
        self.samplers.read().get(key).copied()
    }

    pub fn insert_sampler(&self, key: &str, params: SamplerParams) {
        self.samplers.write().insert(key.to_string(), params);
    }

    /// Cached images, built-ins included.
    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.read().len()
    }

    #[inline]
    pub fn image_bytes(&self) -> usize {
        self.image_bytes.load(Ordering::Relaxed)
    }
}

impl TextureResolver for AssetCache {
    fn find_image(&self, key: &str) -> Option<Arc<Image>> {
        self.image(key)
    }

    fn insert_image(&self, key: &str, image: Arc<Image>) {
        AssetCache::insert_image(self, key, image)
    }
}

/// Loads assets by path into a shared [`AssetCache`].
#[derive(Debug)]
pub struct AssetManager {
    cache: Arc<AssetCache>,
    root: Option<PathBuf>,
}

impl Default for AssetManager {
    fn default() -> Self {
        Self::new()
    }
}

fn bitmaps(graph: &BsdfGraph) -> Vec<String> {
    fn walk(t: &TextureElement, out: &mut Vec<String>) {
        match t {
            TextureElement::Bitmap { filename } => out.push(filename.clone()),
            TextureElement::Scale { texture: Some(inner), .. } => walk(inner, out),
            TextureElement::Scale { texture: None, .. } => {}
        }
    }
    let mut out = Vec::new();
    let float = |p: &FloatOrTexture, out: &mut Vec<String>| {
        if let FloatOrTexture::Texture(t) = p {
            walk(t, out)
        }
    };
    let spectrum = |p: &SpectrumOrTexture, out: &mut Vec<String>| {
        if let SpectrumOrTexture::Texture(t) = p {
            walk(t, out)
        }
    };
    for (_, element) in graph.elements() {
        match &element.kind {
            BsdfKind::Diffuse { reflectance } => spectrum(reflectance, &mut out),
            BsdfKind::RoughDiffuse { reflectance, alpha } => {
                spectrum(reflectance, &mut out);
                float(alpha, &mut out);
            }
            BsdfKind::Plastic { diffuse_reflectance, .. } => spectrum(diffuse_reflectance, &mut out),
            BsdfKind::DiffuseTransmitter { transmittance } => spectrum(transmittance, &mut out),
            BsdfKind::Blend { weight, .. } => float(weight, &mut out),
            BsdfKind::BumpMap { texture, .. } => walk(texture, &mut out),
            BsdfKind::Mask { opacity, .. } => spectrum(opacity, &mut out),
            BsdfKind::Coating { sigma_a, .. } => spectrum(sigma_a, &mut out),
            _ => {}
        }
        let roughness = match &element.kind {
            BsdfKind::Conductor { roughness, .. }
            | BsdfKind::Dielectric { roughness, .. }
            | BsdfKind::Plastic { roughness, .. }
            | BsdfKind::Coating { roughness, .. } => roughness.as_ref(),
            _ => None,
        };
        if let Some(r) = roughness {
            float(&r.alpha_u, &mut out);
            if let Some(v) = &r.alpha_v {
                float(v, &mut out);
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

impl AssetManager {
    pub fn new() -> Self {
        Self { cache: Arc::new(AssetCache::new()), root: None }
    }

    /// Resolve relative paths against `root`.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.cache
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Load `path`. Images are cached under `path` as given.
    #[tracing::instrument(skip(self), fields(path = %path.display()))]
    pub fn load(&self, path: &Path) -> Result<AssetBundle> {
        let key = path.to_string_lossy().into_owned();
        if let Some(image) = self.cache.image(&key) {
            return Ok(AssetBundle { contents: vec![Asset::Image(image)] });
        }
        let full = self.resolve(path);
        if !full.exists() {
            return Err(Error::AssetNotFound(full));
        }
        let ext = full.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).unwrap_or_default();
        let bundle = match ext.as_str() {
            "json" => {
                let graph = BsdfGraph::load(&full)?;
                tracing::debug!(elements = graph.len(), "bsdf graph loaded");
                AssetBundle { contents: vec![Asset::Bsdf(Arc::new(graph))] }
            }
            "exr" | "hdr" | "png" => {
                let image = Image::load(&full)?;
                if image.texel_count() == 0 {
                    return Err(Error::EmptyAsset(full));
                }
                let image = Arc::new(image);
                self.cache.insert_image(&key, image.clone());
                tracing::debug!(extent = ?image.extent(), "image loaded");
                AssetBundle { contents: vec![Asset::Image(image)] }
            }
            other => return Err(Error::Unsupported(format!("asset type '.{other}' of {}", full.display()))),
        };
        if bundle.is_empty() {
            return Err(Error::EmptyAsset(full));
        }
        Ok(bundle)
    }

    /// Load every bitmap `graph` references that is not cached yet. Missing
    /// files are skipped: the compiler substitutes the error texture for them.
    pub fn preload_textures(&self, graph: &BsdfGraph) -> Result<usize> {
        let mut loaded = 0;
        for filename in bitmaps(graph) {
            if self.cache.image(&filename).is_some() {
                continue;
            }
            match self.load(Path::new(&filename)) {
                Ok(_) => loaded += 1,
                Err(Error::AssetNotFound(path)) => tracing::warn!(path = %path.display(), "texture not found"),
                Err(e) => return Err(e),
            }
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blit::TexelFormat;
    use crate::util::Extent3;

    #[test]
    fn test_builtins_present() {
        let cache = AssetCache::new();
        let board = cache.image(ERROR_TEXTURE_KEY).unwrap();
        assert_eq!(board.extent(), Extent3::d2(2, 2));
        assert_eq!(cache.sampler(DEFAULT_SAMPLER_KEY), Some(SamplerParams::default()));
        assert_eq!(cache.image_count(), 1);
        assert_eq!(cache.image_bytes(), board.bytes().len());
    }

    #[test]
    fn test_load_image_and_graph() {
        let dir = tempfile::tempdir().unwrap();
        let image = Image::from_linear(Extent3::d2(3, 2), TexelFormat::Rgba8Srgb, &[[0.5, 0.5, 0.5, 1.0]; 6]).unwrap();
        image.save(&dir.path().join("albedo.png")).unwrap();
        std::fs::write(
            dir.path().join("mat.json"),
            r#"{ "elements": [ { "id": "d", "type": "diffuse",
                 "reflectance": { "type": "bitmap", "filename": "albedo.png" } },
               { "id": "bump", "type": "bump_map", "texture": { "type": "bitmap", "filename": "missing.png" }, "bsdf": 0 } ] }"#,
        )
        .unwrap();

        let assets = AssetManager::new().with_root(dir.path());
        let bundle = assets.load(Path::new("mat.json")).unwrap();
        let graph = bundle.bsdf().unwrap();
        assert_eq!(assets.preload_textures(&graph).unwrap(), 1);
        let cached = assets.cache().image("albedo.png").unwrap();
        assert_eq!(cached.extent(), Extent3::d2(3, 2));
        assert!(assets.load(Path::new("albedo.png")).unwrap().image().is_some());
    }

    #[test]
    fn test_load_failures_name_path() {
        let dir = tempfile::tempdir().unwrap();
        let assets = AssetManager::new().with_root(dir.path());
        match assets.load(Path::new("nothing.exr")).unwrap_err() {
            Error::AssetNotFound(path) => assert!(path.ends_with("nothing.exr")),
            other => panic!("unexpected {other}"),
        }
        std::fs::write(dir.path().join("empty.json"), r#"{ "elements": [] }"#).unwrap();
        assert!(matches!(assets.load(Path::new("empty.json")), Err(Error::EmptyAsset(_))));
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        assert!(matches!(assets.load(Path::new("notes.txt")), Err(Error::Unsupported(_))));
    }
}
