//! Material IR: arena-allocated node DAGs.

use std::fmt::Write as _;

use glam::Vec3;
use smallvec::SmallVec;

use crate::util::{Error, Handle, Result, SlotArena};

use super::texture::IrTexture;

pub type NodeHandle = Handle<IrNode>;

/// Coarse class of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    Bsdf,
    BsdfCombiner,
    Opacity,
    GeomModifier,
    Emission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Ndf {
    Beckmann,
    #[default]
    Ggx,
    Phong,
    AshikhminShirley,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IrParam<T> {
    Constant(T),
    Texture(IrTexture),
}

impl<T: Copy> IrParam<T> {
    pub fn constant(&self) -> Option<T> {
        match self {
            Self::Constant(v) => Some(*v),
            Self::Texture(_) => None,
        }
    }
}

/// Microfacet roughness; zero alpha is perfectly smooth.
#[derive(Debug, Clone, PartialEq)]
pub struct Microfacet {
    pub ndf: Ndf,
    pub alpha_u: IrParam<f32>,
    pub alpha_v: IrParam<f32>,
}

impl Microfacet {
    pub fn smooth() -> Self {
        Self { ndf: Ndf::Ggx, alpha_u: IrParam::Constant(0.0), alpha_v: IrParam::Constant(0.0) }
    }

    pub fn is_smooth(&self) -> bool {
        self.alpha_u == IrParam::Constant(0.0) && self.alpha_v == IrParam::Constant(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeomModifierKind {
    Derivative,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IrKind {
    Diffuse { reflectance: IrParam<Vec3>, roughness: Microfacet },
    Conductor { eta: Vec3, k: Vec3, roughness: Microfacet },
    Dielectric { eta: f32, thin: bool, roughness: Microfacet },
    DiffuseTransmitter { transmittance: IrParam<Vec3> },
    Coating { eta: f32, thickness_sigma_a: IrParam<Vec3>, roughness: Microfacet },
    Blend { weight: IrParam<f32> },
    Mix { weights: SmallVec<[f32; 4]> },
    Opacity { opacity: IrParam<Vec3> },
    GeomModifier { kind: GeomModifierKind, texture: IrTexture },
    Emission { radiance: Vec3 },
}

impl IrKind {
    pub fn symbol(&self) -> Symbol {
        match self {
            Self::Diffuse { .. }
            | Self::Conductor { .. }
            | Self::Dielectric { .. }
            | Self::DiffuseTransmitter { .. }
            | Self::Coating { .. } => Symbol::Bsdf,
            Self::Blend { .. } | Self::Mix { .. } => Symbol::BsdfCombiner,
            Self::Opacity { .. } => Symbol::Opacity,
            Self::GeomModifier { .. } => Symbol::GeomModifier,
            Self::Emission { .. } => Symbol::Emission,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Diffuse { .. } => "diffuse",
            Self::Conductor { .. } => "conductor",
            Self::Dielectric { .. } => "dielectric",
            Self::DiffuseTransmitter { .. } => "difftrans",
            Self::Coating { .. } => "coating",
            Self::Blend { .. } => "blend",
            Self::Mix { .. } => "mix",
            Self::Opacity { .. } => "opacity",
            Self::GeomModifier { .. } => "geom_modifier",
            Self::Emission { .. } => "emission",
        }
    }
}

/// A node with its fixed-arity children. Unlinked slots are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct IrNode {
    pub kind: IrKind,
    pub children: SmallVec<[Option<NodeHandle>; 2]>,
}

impl IrNode {
    pub fn new(kind: IrKind, arity: usize) -> Self {
        Self { kind, children: smallvec::smallvec![None; arity] }
    }

    pub fn leaf(kind: IrKind) -> Self {
        Self::new(kind, 0)
    }

    /// Reflectance 0, alpha 0.
    pub fn black_diffuse() -> Self {
        Self::leaf(IrKind::Diffuse { reflectance: IrParam::Constant(Vec3::ZERO), roughness: Microfacet::smooth() })
    }

    pub fn symbol(&self) -> Symbol {
        self.kind.symbol()
    }

    /// Back-facing counterpart of a front-facing node. Children keep their
    /// slots but are unlinked.
    pub fn backface(&self) -> Self {
        let arity = self.children.len();
        match &self.kind {
            IrKind::Blend { .. }
            | IrKind::Mix { .. }
            | IrKind::Opacity { .. }
            | IrKind::GeomModifier { .. }
            | IrKind::Emission { .. } => Self::new(self.kind.clone(), arity),
            IrKind::Dielectric { eta, thin, roughness } => Self::new(
                IrKind::Dielectric {
                    // a thin sheet has the same medium on both sides
                    eta: if *thin { *eta } else { 1.0 / *eta },
                    thin: *thin,
                    roughness: roughness.clone(),
                },
                arity,
            ),
            IrKind::DiffuseTransmitter { .. } => Self::new(self.kind.clone(), arity),
            IrKind::Diffuse { .. } | IrKind::Conductor { .. } | IrKind::Coating { .. } => Self::black_diffuse(),
        }
    }
}

/// Front and back roots of one compiled material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrontAndBack {
    pub front: NodeHandle,
    pub back: NodeHandle,
}

/// Node arena plus the roots compiled into it.
#[derive(Default)]
pub struct Ir {
    nodes: SlotArena<IrNode>,
    roots: Vec<FrontAndBack>,
}

impl std::fmt::Debug for Ir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ir").field("nodes", &self.nodes.len()).field("roots", &self.roots).finish()
    }
}

impl Ir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, node: IrNode) -> NodeHandle {
        self.nodes.insert(node)
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&IrNode> {
        self.nodes.get(handle)
    }

    pub fn node(&self, handle: NodeHandle) -> Result<&IrNode> {
        self.nodes.get(handle).ok_or_else(|| invalid(handle))
    }

    /// Point `slot` of `parent` at `child`.
    pub fn link(&mut self, parent: NodeHandle, slot: usize, child: NodeHandle) -> Result<()> {
        let node = self.nodes.get_mut(parent).ok_or_else(|| invalid(parent))?;
        let arity = node.children.len();
        let dst = node.children.get_mut(slot).ok_or_else(|| {
            Error::other(format!("slot {slot} out of range for {} node of arity {arity}", node.kind.label()))
        })?;
        *dst = Some(child);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_root(&mut self, roots: FrontAndBack) {
        self.roots.push(roots);
    }

    pub fn roots(&self) -> &[FrontAndBack] {
        &self.roots
    }

    /// Indented dump of the DAG under `root`. Nodes reached again print as
    /// a back reference.
    pub fn dump(&self, root: NodeHandle) -> String {
        let mut out = String::new();
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![(Some(root), 0usize)];
        while let Some((handle, depth)) = stack.pop() {
            let indent = "  ".repeat(depth);
            let Some(handle) = handle else {
                let _ = writeln!(out, "{indent}<unlinked>");
                continue;
            };
            let label = handle.index();
            let Some(node) = self.get(handle) else {
                let _ = writeln!(out, "{indent}<dangling #{label}>");
                continue;
            };
            if !seen.insert(handle) {
                let _ = writeln!(out, "{indent}-> #{label}");
                continue;
            }
            let _ = writeln!(out, "{indent}#{label} {} {}", node.kind.label(), describe(&node.kind));
            for &child in node.children.iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        out
    }
}

fn invalid(handle: NodeHandle) -> Error {
    Error::InvalidHandle { kind: "ir node", index: handle.index(), generation: handle.generation() }
}

fn param<T: std::fmt::Debug>(p: &IrParam<T>) -> String {
    match p {
        IrParam::Constant(v) => format!("{v:?}"),
        IrParam::Texture(t) => format!("tex({} x{})", t.image, t.scale),
    }
}

fn describe(kind: &IrKind) -> String {
    let rough = |m: &Microfacet| {
        if m.is_smooth() {
            "smooth".to_string()
        } else {
            format!("{:?} a=({}, {})", m.ndf, param(&m.alpha_u), param(&m.alpha_v))
        }
    };
    match kind {
        IrKind::Diffuse { reflectance, roughness } => format!("rho={} {}", param(reflectance), rough(roughness)),
        IrKind::Conductor { eta, k, roughness } => format!("eta={eta:?} k={k:?} {}", rough(roughness)),
        IrKind::Dielectric { eta, thin, roughness } => format!("eta={eta} thin={thin} {}", rough(roughness)),
        IrKind::DiffuseTransmitter { transmittance } => format!("t={}", param(transmittance)),
        IrKind::Coating { eta, thickness_sigma_a, roughness } => {
            format!("eta={eta} sigma_a={} {}", param(thickness_sigma_a), rough(roughness))
        }
        IrKind::Blend { weight } => format!("w={}", param(weight)),
        IrKind::Mix { weights } => format!("w={weights:?}"),
        IrKind::Opacity { opacity } => format!("opacity={}", param(opacity)),
        IrKind::GeomModifier { kind, texture } => format!("{kind:?} tex({} x{})", texture.image, texture.scale),
        IrKind::Emission { radiance } => format!("radiance={radiance:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dielectric(eta: f32, thin: bool) -> IrNode {
        IrNode::leaf(IrKind::Dielectric { eta, thin, roughness: Microfacet::smooth() })
    }

    #[test]
    fn test_backface_dielectric() {
        match dielectric(1.5, false).backface().kind {
            IrKind::Dielectric { eta, thin: false, .. } => assert!((eta - 1.0 / 1.5).abs() < 1e-6),
            other => panic!("unexpected {other:?}"),
        }
        match dielectric(1.5, true).backface().kind {
            IrKind::Dielectric { eta, thin: true, .. } => assert_eq!(eta, 1.5),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_backface_of_opaque_bsdfs_is_black() {
        let red = IrNode::leaf(IrKind::Diffuse {
            reflectance: IrParam::Constant(Vec3::new(1.0, 0.0, 0.0)),
            roughness: Microfacet { ndf: Ndf::Beckmann, alpha_u: IrParam::Constant(0.3), alpha_v: IrParam::Constant(0.3) },
        });
        let metal = IrNode::leaf(IrKind::Conductor { eta: Vec3::ONE, k: Vec3::ONE, roughness: Microfacet::smooth() });
        let coat = IrNode::new(
            IrKind::Coating { eta: 1.5, thickness_sigma_a: IrParam::Constant(Vec3::ZERO), roughness: Microfacet::smooth() },
            1,
        );
        for node in [red, metal, coat] {
            let back = node.backface();
            assert_eq!(back, IrNode::black_diffuse());
            assert!(back.children.is_empty());
        }
    }

    #[test]
    fn test_backface_copies_structure() {
        let mask = IrNode::new(IrKind::Opacity { opacity: IrParam::Constant(Vec3::splat(0.5)) }, 1);
        let back = mask.backface();
        assert_eq!(back.kind, mask.kind);
        assert_eq!(back.children.len(), 1);
        let glow = IrNode::leaf(IrKind::Emission { radiance: Vec3::splat(4.0) });
        assert_eq!(glow.backface(), glow);
        assert_eq!(glow.symbol(), Symbol::Emission);
    }

    #[test]
    fn test_link_and_dump() {
        let mut ir = Ir::new();
        let leaf = ir.alloc(IrNode::black_diffuse());
        let blend = ir.alloc(IrNode::new(IrKind::Blend { weight: IrParam::Constant(0.5) }, 2));
        ir.link(blend, 0, leaf).unwrap();
        ir.link(blend, 1, leaf).unwrap();
        assert!(ir.link(blend, 2, leaf).is_err());
        let text = ir.dump(blend);
        assert!(text.starts_with("#1 blend"));
        assert_eq!(text.matches("diffuse").count(), 1);
        assert!(text.contains("-> #0"));
    }
}
