//! BSDF scene graph.
//!
//! Elements live in a [`BsdfGraph`] arena and reference their children by
//! [`ElementId`], so a graph is a DAG rather than a tree. Graphs are loaded
//! from JSON:
//!
//! ```json
//! { "elements": [
//!     { "id": "base", "type": "diffuse", "reflectance": [0.8, 0.2, 0.2] },
//!     { "id": "paper", "type": "two_sided", "bsdfs": [0] }
//! ] }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::Vec3;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::util::{Error, Result};

/// Index of an element inside its graph.
pub type ElementId = u32;

/// Identity of a graph, distinct for every graph created in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(u64);

impl GraphId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Texture element: a bitmap, possibly under a chain of scales.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextureElement {
    Bitmap { filename: String },
    /// `texture: None` is a dangling reference.
    Scale {
        scale: f32,
        #[serde(default)]
        texture: Option<Box<TextureElement>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FloatOrTexture {
    Value(f32),
    Texture(TextureElement),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpectrumOrTexture {
    Value(Vec3),
    Texture(TextureElement),
}

impl From<f32> for FloatOrTexture {
    fn from(v: f32) -> Self {
        Self::Value(v)
    }
}

impl From<Vec3> for SpectrumOrTexture {
    fn from(v: Vec3) -> Self {
        Self::Value(v)
    }
}

/// Microfacet distribution of the rough variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    Beckmann,
    #[default]
    Ggx,
    Phong,
    AshikhminShirley,
}

/// Roughness of a rough specular variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roughness {
    #[serde(default)]
    pub distribution: Distribution,
    pub alpha_u: FloatOrTexture,
    /// Read only for Ashikhmin-Shirley.
    #[serde(default)]
    pub alpha_v: Option<FloatOrTexture>,
}

impl Roughness {
    pub fn isotropic(distribution: Distribution, alpha: f32) -> Self {
        Self { distribution, alpha_u: FloatOrTexture::Value(alpha), alpha_v: None }
    }
}

fn default_ior() -> f32 {
    1.5
}

fn one() -> f32 {
    1.0
}

fn default_reflectance() -> SpectrumOrTexture {
    SpectrumOrTexture::Value(Vec3::splat(0.5))
}

/// Closed set of element kinds. `phong` and `ward` parse but do not compile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BsdfKind {
    Diffuse {
        #[serde(default = "default_reflectance")]
        reflectance: SpectrumOrTexture,
    },
    RoughDiffuse {
        #[serde(default = "default_reflectance")]
        reflectance: SpectrumOrTexture,
        alpha: FloatOrTexture,
    },
    Conductor {
        eta: Vec3,
        k: Vec3,
        #[serde(default = "one")]
        ext_eta: f32,
        #[serde(default)]
        roughness: Option<Roughness>,
    },
    Dielectric {
        #[serde(default = "default_ior")]
        int_ior: f32,
        #[serde(default = "one")]
        ext_ior: f32,
        #[serde(default)]
        roughness: Option<Roughness>,
    },
    ThinDielectric {
        #[serde(default = "default_ior")]
        int_ior: f32,
        #[serde(default = "one")]
        ext_ior: f32,
    },
    Plastic {
        #[serde(default = "default_ior")]
        int_ior: f32,
        #[serde(default = "one")]
        ext_ior: f32,
        #[serde(default = "default_reflectance")]
        diffuse_reflectance: SpectrumOrTexture,
        #[serde(default)]
        roughness: Option<Roughness>,
    },
    DiffuseTransmitter {
        #[serde(default = "default_reflectance")]
        transmittance: SpectrumOrTexture,
    },
    Blend {
        weight: FloatOrTexture,
        bsdfs: [ElementId; 2],
    },
    Mixture {
        weights: Vec<f32>,
        bsdfs: Vec<ElementId>,
    },
    BumpMap {
        texture: TextureElement,
        #[serde(default)]
        was_normal: bool,
        bsdf: ElementId,
    },
    TwoSided {
        bsdfs: SmallVec<[ElementId; 2]>,
    },
    Mask {
        opacity: SpectrumOrTexture,
        bsdf: ElementId,
    },
    Coating {
        #[serde(default = "default_ior")]
        int_ior: f32,
        #[serde(default = "one")]
        ext_ior: f32,
        #[serde(default = "one")]
        thickness: f32,
        #[serde(default = "zero_sigma")]
        sigma_a: SpectrumOrTexture,
        #[serde(default)]
        roughness: Option<Roughness>,
        bsdf: ElementId,
    },
    Phong {
        #[serde(default)]
        exponent: f32,
    },
    Ward {
        #[serde(default)]
        alpha_u: f32,
        #[serde(default)]
        alpha_v: f32,
    },
}

fn zero_sigma() -> SpectrumOrTexture {
    SpectrumOrTexture::Value(Vec3::ZERO)
}

impl BsdfKind {
    /// Name as written in graph files.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Diffuse { .. } => "diffuse",
            Self::RoughDiffuse { .. } => "rough_diffuse",
            Self::Conductor { roughness: None, .. } => "conductor",
            Self::Conductor { .. } => "rough_conductor",
            Self::Dielectric { roughness: None, .. } => "dielectric",
            Self::Dielectric { .. } => "rough_dielectric",
            Self::ThinDielectric { .. } => "thin_dielectric",
            Self::Plastic { roughness: None, .. } => "plastic",
            Self::Plastic { .. } => "rough_plastic",
            Self::DiffuseTransmitter { .. } => "diffuse_transmitter",
            Self::Blend { .. } => "blend",
            Self::Mixture { .. } => "mixture",
            Self::BumpMap { .. } => "bump_map",
            Self::TwoSided { .. } => "two_sided",
            Self::Mask { .. } => "mask",
            Self::Coating { roughness: None, .. } => "coating",
            Self::Coating { .. } => "rough_coating",
            Self::Phong { .. } => "phong",
            Self::Ward { .. } => "ward",
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Phong { .. } | Self::Ward { .. })
    }

    /// Child elements in slot order.
    pub fn children(&self) -> &[ElementId] {
        match self {
            Self::Blend { bsdfs, .. } => &bsdfs[..],
            Self::Mixture { bsdfs, .. } => &bsdfs[..],
            Self::TwoSided { bsdfs } => &bsdfs[..],
            Self::BumpMap { bsdf, .. } | Self::Mask { bsdf, .. } | Self::Coating { bsdf, .. } => {
                std::slice::from_ref(bsdf)
            }
            Self::Diffuse { .. }
            | Self::RoughDiffuse { .. }
            | Self::Conductor { .. }
            | Self::Dielectric { .. }
            | Self::ThinDielectric { .. }
            | Self::Plastic { .. }
            | Self::DiffuseTransmitter { .. }
            | Self::Phong { .. }
            | Self::Ward { .. } => &[],
        }
    }

    fn check_arity(&self) -> std::result::Result<(), String> {
        match self {
            Self::Mixture { weights, bsdfs } => {
                if bsdfs.len() < 2 {
                    return Err(format!("mixture needs at least 2 children, has {}", bsdfs.len()));
                }
                if weights.len() != bsdfs.len() {
                    return Err(format!("{} weights for {} children", weights.len(), bsdfs.len()));
                }
            }
            Self::TwoSided { bsdfs } if bsdfs.is_empty() || bsdfs.len() > 2 => {
                return Err(format!("two-sided needs 1 or 2 children, has {}", bsdfs.len()));
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BsdfElement {
    pub id: String,
    #[serde(flatten)]
    pub kind: BsdfKind,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BsdfGraph {
    #[serde(skip, default = "GraphId::next")]
    id: GraphId,
    elements: Vec<BsdfElement>,
}

/// A clone is a new graph: it may diverge, so it never shares compiled results.
impl Clone for BsdfGraph {
    fn clone(&self) -> Self {
        Self { id: GraphId::next(), elements: self.elements.clone() }
    }
}

impl Default for BsdfGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl BsdfGraph {
    pub fn new() -> Self {
        Self { id: GraphId::next(), elements: Vec::new() }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::AssetNotFound(path.to_path_buf()));
        }
        let graph = Self::from_json(&std::fs::read_to_string(path)?)?;
        if graph.is_empty() {
            return Err(Error::EmptyAsset(path.to_path_buf()));
        }
        Ok(graph)
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    /// Append an element. Children must be added before their parents.
    pub fn add(&mut self, id: impl Into<String>, kind: BsdfKind) -> ElementId {
        self.elements.push(BsdfElement { id: id.into(), kind });
        (self.elements.len() - 1) as ElementId
    }

    pub fn get(&self, element: ElementId) -> Option<&BsdfElement> {
        self.elements.get(element as usize)
    }

    pub(crate) fn element(&self, element: ElementId) -> Result<&BsdfElement> {
        self.get(element).ok_or_else(|| Error::MalformedBsdf {
            element: format!("#{element}"),
            reason: format!("graph has {} elements", self.elements.len()),
        })
    }

    pub fn find(&self, id: &str) -> Option<ElementId> {
        self.elements.iter().position(|e| e.id == id).map(|i| i as ElementId)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> impl Iterator<Item = (ElementId, &BsdfElement)> {
        self.elements.iter().enumerate().map(|(i, e)| (i as ElementId, e))
    }

    /// Elements no other element references.
    pub fn roots(&self) -> Vec<ElementId> {
        let mut referenced = vec![false; self.elements.len()];
        for e in &self.elements {
            for &c in e.kind.children() {
                if let Some(r) = referenced.get_mut(c as usize) {
                    *r = true;
                }
            }
        }
        (0..self.elements.len() as ElementId).filter(|&i| !referenced[i as usize]).collect()
    }

    /// Check everything reachable from `root`: references in range, child
    /// counts, no cycles, only supported kinds.
    pub fn validate(&self, root: ElementId) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Open,
            Done,
        }
        let mut marks = vec![Mark::New; self.elements.len()];
        let mut stack = vec![(root, false)];
        self.element(root)?;
        while let Some((index, leaving)) = stack.pop() {
            if leaving {
                marks[index as usize] = Mark::Done;
                continue;
            }
            match marks[index as usize] {
                Mark::Done => continue,
                Mark::Open => {
                    return Err(Error::MalformedBsdf {
                        element: self.elements[index as usize].id.clone(),
                        reason: "element is its own descendant".into(),
                    });
                }
                Mark::New => {}
            }
            let element = &self.elements[index as usize];
            if !element.kind.is_supported() {
                return Err(Error::UnsupportedBsdf { element: element.id.clone(), kind: element.kind.name().into() });
            }
            element
                .kind
                .check_arity()
                .map_err(|reason| Error::MalformedBsdf { element: element.id.clone(), reason })?;
            marks[index as usize] = Mark::Open;
            stack.push((index, true));
            for &child in element.kind.children() {
                if child as usize >= self.elements.len() {
                    return Err(Error::MalformedBsdf {
                        element: element.id.clone(),
                        reason: format!("child #{child} is outside the graph"),
                    });
                }
                match marks[child as usize] {
                    Mark::Open => {
                        return Err(Error::MalformedBsdf {
                            element: element.id.clone(),
                            reason: format!("cycle through '{}'", self.elements[child as usize].id),
                        });
                    }
                    Mark::New => stack.push((child, false)),
                    Mark::Done => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAPH: &str = r#"{ "elements": [
        { "id": "base", "type": "diffuse", "reflectance": [0.8, 0.2, 0.2] },
        { "id": "glass", "type": "dielectric", "int_ior": 1.5,
          "roughness": { "distribution": "beckmann", "alpha_u": 0.1 } },
        { "id": "mix", "type": "blend", "weight": { "type": "bitmap", "filename": "w.png" }, "bsdfs": [0, 1] },
        { "id": "paper", "type": "two_sided", "bsdfs": [2] }
    ] }"#;

    #[test]
    fn test_parse_graph() {
        let graph = BsdfGraph::from_json(GRAPH).unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.roots(), vec![3]);
        assert_eq!(graph.find("glass"), Some(1));
        assert_eq!(graph.get(1).unwrap().kind.name(), "rough_dielectric");
        match &graph.get(2).unwrap().kind {
            BsdfKind::Blend { weight: FloatOrTexture::Texture(TextureElement::Bitmap { filename }), .. } => {
                assert_eq!(filename, "w.png")
            }
            other => panic!("unexpected {other:?}"),
        }
        graph.validate(3).unwrap();
    }

    #[test]
    fn test_graph_ids_are_distinct() {
        let a = BsdfGraph::from_json(GRAPH).unwrap();
        let b = BsdfGraph::from_json(GRAPH).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(BsdfGraph::new().id(), BsdfGraph::new().id());
    }

    #[test]
    fn test_validation_names_element() {
        let mut graph = BsdfGraph::new();
        let shiny = graph.add("shiny", BsdfKind::Phong { exponent: 30.0 });
        let root = graph.add("wrap", BsdfKind::TwoSided { bsdfs: smallvec::smallvec![shiny] });
        match graph.validate(root).unwrap_err() {
            Error::UnsupportedBsdf { element, kind } => {
                assert_eq!(element, "shiny");
                assert_eq!(kind, "phong");
            }
            other => panic!("unexpected {other}"),
        }

        let mut graph = BsdfGraph::new();
        let d = graph.add("d", BsdfKind::Diffuse { reflectance: Vec3::ONE.into() });
        let mix = graph.add("mix", BsdfKind::Mixture { weights: vec![1.0], bsdfs: vec![d] });
        assert!(matches!(graph.validate(mix), Err(Error::MalformedBsdf { element, .. }) if element == "mix"));
        let dangling = graph.add("dangling", BsdfKind::Mask { opacity: Vec3::ONE.into(), bsdf: 42 });
        assert!(matches!(graph.validate(dangling), Err(Error::MalformedBsdf { .. })));
    }

    #[test]
    fn test_cycle_rejected() {
        let graph = BsdfGraph::from_json(
            r#"{ "elements": [
                { "id": "a", "type": "mask", "opacity": [0.5, 0.5, 0.5], "bsdf": 1 },
                { "id": "b", "type": "bump_map", "texture": { "type": "bitmap", "filename": "h.png" }, "bsdf": 0 }
            ] }"#,
        )
        .unwrap();
        assert!(matches!(graph.validate(0), Err(Error::MalformedBsdf { .. })));
    }

    #[test]
    fn test_shared_child_is_not_a_cycle() {
        let mut graph = BsdfGraph::new();
        let d = graph.add("d", BsdfKind::Diffuse { reflectance: Vec3::ONE.into() });
        let blend = graph.add("b", BsdfKind::Blend { weight: FloatOrTexture::Value(0.5), bsdfs: [d, d] });
        graph.validate(blend).unwrap();
    }

    #[test]
    fn test_load_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.json");
        assert!(matches!(BsdfGraph::load(&missing), Err(Error::AssetNotFound(_))));
        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, r#"{ "elements": [] }"#).unwrap();
        assert!(matches!(BsdfGraph::load(&empty), Err(Error::EmptyAsset(_))));
    }
}
