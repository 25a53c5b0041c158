//! BSDF graph to IR compiler.
//!
//! Traversal is breadth-first over entries carrying the element, where its
//! front and back nodes link in, and which sides it compiles for. Two-sided
//! elements and pass-through coatings never become nodes: their children take
//! over the parent's links. Nodes are hash-consed per element and side, so a
//! shared element maps to one node per side and recompiling is free.

use std::collections::{HashMap, VecDeque};

use glam::Vec3;

use crate::util::{Error, Result};

use super::bsdf::{BsdfElement, BsdfGraph, BsdfKind, Distribution, ElementId, FloatOrTexture, GraphId, Roughness, SpectrumOrTexture};
use super::ir::{FrontAndBack, GeomModifierKind, Ir, IrKind, IrNode, IrParam, Microfacet, Ndf, NodeHandle};
use super::texture::{ImageSemantic, TextureResolver, TextureStage};

/// Relative index of refraction treated as no interface at all.
pub fn is_transparent_eta(eta: f32) -> bool {
    eta > 0.99999 && eta < 1.000001
}

/// Which faces an entry compiles for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Sides {
    /// Front translated, back derived by the back-face rule.
    Derived,
    /// One-child two-sided subtree: the back reuses the front nodes.
    Shared,
    FrontOnly,
    /// Back child of a two-sided element, translated on its own.
    BackOnly,
}

impl Sides {
    fn has_front(self) -> bool {
        !matches!(self, Self::BackOnly)
    }

    fn has_back(self) -> bool {
        !matches!(self, Self::FrontOnly)
    }

    /// Sides child `index` of a two-sided element with `count` children
    /// compiles for, if any.
    fn two_sided_child(self, index: usize, count: usize) -> Option<Self> {
        match (self, count) {
            (Self::Derived | Self::Shared, 1) => Some(Self::Shared),
            (Self::Derived | Self::Shared, _) => Some(if index == 0 { Self::FrontOnly } else { Self::BackOnly }),
            (Self::FrontOnly, _) => (index == 0).then_some(Self::FrontOnly),
            (Self::BackOnly, 1) => Some(Self::BackOnly),
            (Self::BackOnly, _) => (index == 1).then_some(Self::BackOnly),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BackKind {
    Derived,
    Own,
}

#[derive(Debug, Clone, Copy)]
enum Link {
    Root,
    Slot(NodeHandle, usize),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    element: ElementId,
    front: Option<Link>,
    back: Option<Link>,
    sides: Sides,
}

/// A translated element: the node plus, for plastics, the implicit diffuse
/// node it coats.
struct Translated {
    node: IrNode,
    coated: Option<IrNode>,
}

impl Translated {
    fn node(node: IrNode) -> Self {
        Self { node, coated: None }
    }
}

fn ndf(distribution: Distribution) -> Ndf {
    match distribution {
        Distribution::Beckmann => Ndf::Beckmann,
        Distribution::Ggx => Ndf::Ggx,
        Distribution::Phong => Ndf::Phong,
        Distribution::AshikhminShirley => Ndf::AshikhminShirley,
    }
}

/// Compiles BSDF graphs into one shared [`Ir`].
#[derive(Debug, Default)]
pub struct MaterialCompiler {
    ir: Ir,
    textures: TextureStage,
    front: HashMap<(GraphId, ElementId), NodeHandle>,
    back: HashMap<(GraphId, ElementId, BackKind), NodeHandle>,
    results: HashMap<(GraphId, ElementId), FrontAndBack>,
}

impl MaterialCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ir(&self) -> &Ir {
        &self.ir
    }

    pub fn into_ir(self) -> Ir {
        self.ir
    }

    pub fn textures(&self) -> &TextureStage {
        &self.textures
    }

    /// Compile every root of `graph`.
    pub fn compile_all(&mut self, graph: &BsdfGraph, textures: &dyn TextureResolver) -> Result<Vec<(ElementId, FrontAndBack)>> {
        graph.roots().into_iter().map(|root| Ok((root, self.compile(graph, root, textures)?))).collect()
    }

    /// Compile the material rooted at `root` into front and back DAGs.
    ///
    /// The reachable subgraph is validated before any node is allocated, so
    /// an unsupported or malformed element leaves the IR untouched.
    #[tracing::instrument(skip_all, fields(graph = graph.id().get(), root))]
    pub fn compile(&mut self, graph: &BsdfGraph, root: ElementId, textures: &dyn TextureResolver) -> Result<FrontAndBack> {
        let gid = graph.id();
        if let Some(&roots) = self.results.get(&(gid, root)) {
            return Ok(roots);
        }
        graph.validate(root)?;
        let before = self.ir.len();

        let mut front_root = None;
        let mut back_root = None;
        let mut queue = VecDeque::new();
        queue.push_back(Entry { element: root, front: Some(Link::Root), back: Some(Link::Root), sides: Sides::Derived });

        while let Some(entry) = queue.pop_front() {
            let element = graph.element(entry.element)?;
            match &element.kind {
                BsdfKind::TwoSided { bsdfs } => {
                    for (i, &child) in bsdfs.iter().enumerate() {
                        if let Some(sides) = entry.sides.two_sided_child(i, bsdfs.len()) {
                            queue.push_back(Entry {
                                element: child,
                                front: entry.front.filter(|_| sides.has_front()),
                                back: entry.back.filter(|_| sides.has_back()),
                                sides,
                            });
                        }
                    }
                    continue;
                }
                BsdfKind::Coating { int_ior, ext_ior, bsdf, .. } if is_transparent_eta(int_ior / ext_ior) => {
                    tracing::warn!(element = %element.id, "coating with unit index of refraction passes through");
                    queue.push_back(Entry { element: *bsdf, ..entry });
                    continue;
                }
                _ => {}
            }

            let key = (gid, entry.element);
            let mut fresh_front = None;
            let front = if entry.sides.has_front() {
                match self.front.get(&key) {
                    Some(&handle) => Some(handle),
                    None => {
                        let handle = self.alloc_translated(element, textures)?;
                        self.front.insert(key, handle);
                        fresh_front = Some(handle);
                        Some(handle)
                    }
                }
            } else {
                None
            };
            if let (Some(handle), Some(link)) = (front, entry.front) {
                self.attach(link, handle, &mut front_root)?;
            }

            let mut fresh_back = None;
            let back = match entry.sides {
                _ if entry.back.is_none() => None,
                Sides::FrontOnly => None,
                Sides::Shared => front,
                Sides::Derived => {
                    let back_key = (gid, entry.element, BackKind::Derived);
                    match self.back.get(&back_key) {
                        Some(&handle) => Some(handle),
                        None => {
                            let front = front.ok_or_else(|| Error::other("derived back face without a front node"))?;
                            let node = self.ir.node(front)?.backface();
                            let handle = self.ir.alloc(node);
                            self.back.insert(back_key, handle);
                            fresh_back = Some(handle);
                            Some(handle)
                        }
                    }
                }
                Sides::BackOnly => {
                    let back_key = (gid, entry.element, BackKind::Own);
                    match self.back.get(&back_key) {
                        Some(&handle) => Some(handle),
                        None => {
                            let handle = self.alloc_translated(element, textures)?;
                            self.back.insert(back_key, handle);
                            fresh_back = Some(handle);
                            Some(handle)
                        }
                    }
                }
            };
            if let (Some(handle), Some(link)) = (back, entry.back) {
                self.attach(link, handle, &mut back_root)?;
            }

            let back_arity = match fresh_back {
                Some(handle) => self.ir.node(handle)?.children.len(),
                None => 0,
            };
            for (i, &child) in element.kind.children().iter().enumerate() {
                let front = fresh_front.map(|h| Link::Slot(h, i));
                // black back faces are leaves, so their children are never linked
                let back = fresh_back.filter(|_| i < back_arity).map(|h| Link::Slot(h, i));
                if front.is_some() || back.is_some() {
                    queue.push_back(Entry { element: child, front, back, sides: entry.sides });
                }
            }
        }

        let missing = |side: &str| Error::MalformedBsdf {
            element: graph.get(root).map(|e| e.id.clone()).unwrap_or_default(),
            reason: format!("material has no {side} root"),
        };
        let roots = FrontAndBack {
            front: front_root.ok_or_else(|| missing("front"))?,
            back: back_root.ok_or_else(|| missing("back"))?,
        };
        self.ir.add_root(roots);
        self.results.insert((gid, root), roots);
        tracing::debug!(nodes = self.ir.len() - before, "material compiled");
        Ok(roots)
    }

    fn attach(&mut self, link: Link, node: NodeHandle, root: &mut Option<NodeHandle>) -> Result<()> {
        match link {
            Link::Root => {
                *root = Some(node);
                Ok(())
            }
            Link::Slot(parent, slot) => self.ir.link(parent, slot, node),
        }
    }

    fn alloc_translated(&mut self, element: &BsdfElement, textures: &dyn TextureResolver) -> Result<NodeHandle> {
        let Translated { node, coated } = self.translate(element, textures)?;
        let handle = self.ir.alloc(node);
        if let Some(coated) = coated {
            let coated = self.ir.alloc(coated);
            self.ir.link(handle, 0, coated)?;
        }
        Ok(handle)
    }

    fn float(&mut self, param: &FloatOrTexture, semantic: ImageSemantic, textures: &dyn TextureResolver) -> IrParam<f32> {
        match param {
            FloatOrTexture::Value(v) => IrParam::Constant(*v),
            FloatOrTexture::Texture(t) => IrParam::Texture(self.textures.resolve(t, semantic, textures)),
        }
    }

    fn spectrum(&mut self, param: &SpectrumOrTexture, semantic: ImageSemantic, textures: &dyn TextureResolver) -> IrParam<Vec3> {
        match param {
            SpectrumOrTexture::Value(v) => IrParam::Constant(*v),
            SpectrumOrTexture::Texture(t) => IrParam::Texture(self.textures.resolve(t, semantic, textures)),
        }
    }

    fn roughness(&mut self, roughness: Option<&Roughness>, textures: &dyn TextureResolver) -> Microfacet {
        let Some(r) = roughness else {
            return Microfacet::smooth();
        };
        let alpha_u = self.float(&r.alpha_u, ImageSemantic::Identity, textures);
        let alpha_v = match (&r.alpha_v, r.distribution) {
            (Some(v), Distribution::AshikhminShirley) => self.float(v, ImageSemantic::Identity, textures),
            _ => alpha_u.clone(),
        };
        Microfacet { ndf: ndf(r.distribution), alpha_u, alpha_v }
    }

    fn translate(&mut self, element: &BsdfElement, textures: &dyn TextureResolver) -> Result<Translated> {
        let id = &element.id;
        let node = match &element.kind {
            BsdfKind::Diffuse { reflectance } => IrNode::leaf(IrKind::Diffuse {
                reflectance: self.spectrum(reflectance, ImageSemantic::Identity, textures),
                roughness: Microfacet::smooth(),
            }),
            BsdfKind::RoughDiffuse { reflectance, alpha } => {
                let alpha = self.float(alpha, ImageSemantic::Identity, textures);
                IrNode::leaf(IrKind::Diffuse {
                    reflectance: self.spectrum(reflectance, ImageSemantic::Identity, textures),
                    roughness: Microfacet { ndf: Ndf::default(), alpha_u: alpha.clone(), alpha_v: alpha },
                })
            }
            BsdfKind::Conductor { eta, k, ext_eta, roughness } => IrNode::leaf(IrKind::Conductor {
                eta: *eta / *ext_eta,
                k: *k / *ext_eta,
                roughness: self.roughness(roughness.as_ref(), textures),
            }),
            BsdfKind::Dielectric { int_ior, ext_ior, roughness } => {
                self.dielectric(id, int_ior / ext_ior, false, roughness.as_ref(), textures)
            }
            BsdfKind::ThinDielectric { int_ior, ext_ior } => self.dielectric(id, int_ior / ext_ior, true, None, textures),
            BsdfKind::Plastic { int_ior, ext_ior, diffuse_reflectance, roughness } => {
                let roughness = self.roughness(roughness.as_ref(), textures);
                let diffuse = IrNode::leaf(IrKind::Diffuse {
                    reflectance: self.spectrum(diffuse_reflectance, ImageSemantic::Identity, textures),
                    roughness: roughness.clone(),
                });
                let eta = int_ior / ext_ior;
                if is_transparent_eta(eta) {
                    tracing::warn!(element = %id, "plastic with unit index of refraction is plain diffuse");
                    return Ok(Translated::node(diffuse));
                }
                let coat = IrKind::Coating { eta, thickness_sigma_a: IrParam::Constant(Vec3::ZERO), roughness };
                return Ok(Translated { node: IrNode::new(coat, 1), coated: Some(diffuse) });
            }
            BsdfKind::DiffuseTransmitter { transmittance } => IrNode::leaf(IrKind::DiffuseTransmitter {
                transmittance: self.spectrum(transmittance, ImageSemantic::Identity, textures),
            }),
            BsdfKind::Blend { weight, bsdfs } => IrNode::new(
                IrKind::Blend { weight: self.float(weight, ImageSemantic::BlendWeight, textures) },
                bsdfs.len(),
            ),
            BsdfKind::Mixture { weights, bsdfs } => {
                IrNode::new(IrKind::Mix { weights: weights.iter().copied().collect() }, bsdfs.len())
            }
            BsdfKind::BumpMap { texture, was_normal, .. } => {
                let semantic = if *was_normal { ImageSemantic::NormalMap } else { ImageSemantic::BumpMap };
                IrNode::new(
                    IrKind::GeomModifier {
                        kind: GeomModifierKind::Derivative,
                        texture: self.textures.resolve(texture, semantic, textures),
                    },
                    1,
                )
            }
            BsdfKind::Mask { opacity, .. } => {
                IrNode::new(IrKind::Opacity { opacity: self.spectrum(opacity, ImageSemantic::BlendWeight, textures) }, 1)
            }
            BsdfKind::Coating { int_ior, ext_ior, thickness, sigma_a, roughness, .. } => {
                let sigma_a = match self.spectrum(sigma_a, ImageSemantic::Identity, textures) {
                    IrParam::Constant(v) => IrParam::Constant(v * *thickness),
                    IrParam::Texture(mut t) => {
                        t.scale *= thickness;
                        IrParam::Texture(t)
                    }
                };
                IrNode::new(
                    IrKind::Coating {
                        eta: int_ior / ext_ior,
                        thickness_sigma_a: sigma_a,
                        roughness: self.roughness(roughness.as_ref(), textures),
                    },
                    1,
                )
            }
            BsdfKind::TwoSided { .. } => {
                return Err(Error::MalformedBsdf { element: id.clone(), reason: "two-sided element reached translation".into() })
            }
            BsdfKind::Phong { .. } | BsdfKind::Ward { .. } => {
                return Err(Error::UnsupportedBsdf { element: id.clone(), kind: element.kind.name().into() })
            }
        };
        Ok(Translated::node(node))
    }

    fn dielectric(
        &mut self,
        id: &str,
        eta: f32,
        thin: bool,
        roughness: Option<&Roughness>,
        textures: &dyn TextureResolver,
    ) -> IrNode {
        if is_transparent_eta(eta) {
            tracing::warn!(element = %id, "dielectric with unit index of refraction is fully transparent");
            return IrNode::leaf(IrKind::Opacity { opacity: IrParam::Constant(Vec3::ZERO) });
        }
        IrNode::leaf(IrKind::Dielectric { eta, thin, roughness: self.roughness(roughness, textures) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blit::Image;
    use crate::material::bsdf::TextureElement;
    use crate::material::ir::Symbol;
    use smallvec::smallvec;
    use std::sync::Arc;

    struct NoTextures;

    impl TextureResolver for NoTextures {
        fn find_image(&self, _key: &str) -> Option<Arc<Image>> {
            None
        }

        fn insert_image(&self, _key: &str, _image: Arc<Image>) {}
    }

    fn diffuse(graph: &mut BsdfGraph, id: &str, rgb: [f32; 3]) -> ElementId {
        graph.add(id, BsdfKind::Diffuse { reflectance: Vec3::from(rgb).into() })
    }

    fn kind(compiler: &MaterialCompiler, handle: NodeHandle) -> &IrKind {
        &compiler.ir().node(handle).unwrap().kind
    }

    fn child(compiler: &MaterialCompiler, handle: NodeHandle, slot: usize) -> NodeHandle {
        compiler.ir().node(handle).unwrap().children[slot].unwrap()
    }

    #[test]
    fn test_one_sided_diffuse_is_black_from_behind() {
        let mut graph = BsdfGraph::new();
        let root = diffuse(&mut graph, "red", [1.0, 0.0, 0.0]);
        let mut compiler = MaterialCompiler::new();
        let roots = compiler.compile(&graph, root, &NoTextures).unwrap();
        assert!(matches!(kind(&compiler, roots.front), IrKind::Diffuse { reflectance: IrParam::Constant(c), .. } if c.x == 1.0));
        assert_eq!(compiler.ir().node(roots.back).unwrap(), &IrNode::black_diffuse());
    }

    #[test]
    fn test_dielectric_back_faces() {
        let mut graph = BsdfGraph::new();
        let glass = graph.add("glass", BsdfKind::Dielectric { int_ior: 1.5, ext_ior: 1.0, roughness: None });
        let sheet = graph.add("sheet", BsdfKind::ThinDielectric { int_ior: 1.5, ext_ior: 1.0 });
        let mut compiler = MaterialCompiler::new();
        let glass = compiler.compile(&graph, glass, &NoTextures).unwrap();
        let sheet = compiler.compile(&graph, sheet, &NoTextures).unwrap();
        match kind(&compiler, glass.back) {
            IrKind::Dielectric { eta, thin: false, .. } => assert!((eta - 1.0 / 1.5).abs() < 1e-6),
            other => panic!("unexpected {other:?}"),
        }
        match kind(&compiler, sheet.back) {
            IrKind::Dielectric { eta, thin: true, .. } => assert_eq!(*eta, 1.5),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_two_sided_single_child_is_shared() {
        let mut graph = BsdfGraph::new();
        let d = diffuse(&mut graph, "d", [0.5; 3]);
        let mask = graph.add("mask", BsdfKind::Mask { opacity: Vec3::splat(0.5).into(), bsdf: d });
        let root = graph.add("two", BsdfKind::TwoSided { bsdfs: smallvec![mask] });
        let mut compiler = MaterialCompiler::new();
        let roots = compiler.compile(&graph, root, &NoTextures).unwrap();
        assert_eq!(roots.front, roots.back);
        assert_eq!(compiler.ir().len(), 2);
        assert_eq!(compiler.ir().node(roots.front).unwrap().symbol(), Symbol::Opacity);
    }

    #[test]
    fn test_two_sided_distinct_children_compile_independently() {
        let mut graph = BsdfGraph::new();
        let front = diffuse(&mut graph, "front", [1.0, 0.0, 0.0]);
        let back = diffuse(&mut graph, "back", [0.0, 0.0, 1.0]);
        let root = graph.add("two", BsdfKind::TwoSided { bsdfs: smallvec![front, back] });
        let mut compiler = MaterialCompiler::new();
        let roots = compiler.compile(&graph, root, &NoTextures).unwrap();
        assert!(matches!(kind(&compiler, roots.front), IrKind::Diffuse { reflectance: IrParam::Constant(c), .. } if c.x == 1.0));
        assert!(matches!(kind(&compiler, roots.back), IrKind::Diffuse { reflectance: IrParam::Constant(c), .. } if c.z == 1.0));
        assert_eq!(compiler.ir().len(), 2);
    }

    #[test]
    fn test_shared_child_hash_consed() {
        let mut graph = BsdfGraph::new();
        let d = diffuse(&mut graph, "d", [0.5; 3]);
        let blend = graph.add("blend", BsdfKind::Blend { weight: FloatOrTexture::Value(0.25), bsdfs: [d, d] });
        let mut compiler = MaterialCompiler::new();
        let roots = compiler.compile(&graph, blend, &NoTextures).unwrap();
        assert_eq!(child(&compiler, roots.front, 0), child(&compiler, roots.front, 1));
        assert_eq!(child(&compiler, roots.back, 0), child(&compiler, roots.back, 1));
        assert_ne!(child(&compiler, roots.front, 0), child(&compiler, roots.back, 0));
        // blend and diffuse, each once per side
        assert_eq!(compiler.ir().len(), 4);
    }

    #[test]
    fn test_compile_twice_is_idempotent() {
        let mut graph = BsdfGraph::new();
        let d = diffuse(&mut graph, "d", [0.5; 3]);
        let glass = graph.add("glass", BsdfKind::Dielectric { int_ior: 1.33, ext_ior: 1.0, roughness: None });
        let mix = graph.add("mix", BsdfKind::Mixture { weights: vec![0.3, 0.7], bsdfs: vec![d, glass] });
        let mut compiler = MaterialCompiler::new();
        let first = compiler.compile(&graph, mix, &NoTextures).unwrap();
        let count = compiler.ir().len();
        let second = compiler.compile(&graph, mix, &NoTextures).unwrap();
        assert_eq!(first, second);
        assert_eq!(compiler.ir().len(), count);
        assert_eq!(compiler.ir().roots().len(), 1);

        // a second root reusing the mixture shares its nodes
        let outer = graph.add("outer", BsdfKind::Mask { opacity: Vec3::ONE.into(), bsdf: mix });
        let outer = compiler.compile(&graph, outer, &NoTextures).unwrap();
        assert_eq!(child(&compiler, outer.front, 0), first.front);
        assert_eq!(compiler.ir().len(), count + 2);
    }

    #[test]
    fn test_cloned_graph_compiles_its_own_elements() {
        let mut a = BsdfGraph::new();
        diffuse(&mut a, "base", [0.5; 3]);
        let mut b = a.clone();
        assert_ne!(a.id(), b.id());
        let red = diffuse(&mut a, "red", [1.0, 0.0, 0.0]);
        let glass = b.add("glass", BsdfKind::Dielectric { int_ior: 1.5, ext_ior: 1.0, roughness: None });
        assert_eq!(red, glass);

        let mut compiler = MaterialCompiler::new();
        let red = compiler.compile(&a, red, &NoTextures).unwrap();
        let glass = compiler.compile(&b, glass, &NoTextures).unwrap();
        assert_ne!(red, glass);
        assert!(matches!(compiler.ir().node(glass.front).unwrap().kind, IrKind::Dielectric { .. }));
        assert!(matches!(compiler.ir().node(red.front).unwrap().kind, IrKind::Diffuse { .. }));
    }

    #[test]
    fn test_unsupported_aborts_without_allocation() {
        let mut graph = BsdfGraph::new();
        let d = diffuse(&mut graph, "d", [0.5; 3]);
        let ward = graph.add("brushed", BsdfKind::Ward { alpha_u: 0.1, alpha_v: 0.2 });
        let blend = graph.add("blend", BsdfKind::Blend { weight: FloatOrTexture::Value(0.5), bsdfs: [d, ward] });
        let mut compiler = MaterialCompiler::new();
        match compiler.compile(&graph, blend, &NoTextures).unwrap_err() {
            Error::UnsupportedBsdf { element, kind } => {
                assert_eq!(element, "brushed");
                assert_eq!(kind, "ward");
            }
            other => panic!("unexpected {other}"),
        }
        assert!(compiler.ir().is_empty());
    }

    #[test]
    fn test_plastic_coats_diffuse() {
        let mut graph = BsdfGraph::new();
        let plastic = graph.add(
            "plastic",
            BsdfKind::Plastic {
                int_ior: 1.5,
                ext_ior: 1.0,
                diffuse_reflectance: Vec3::splat(0.6).into(),
                roughness: Some(Roughness::isotropic(Distribution::Beckmann, 0.2)),
            },
        );
        let clear = graph.add(
            "clear",
            BsdfKind::Plastic { int_ior: 1.0, ext_ior: 1.0, diffuse_reflectance: Vec3::splat(0.6).into(), roughness: None },
        );
        let mut compiler = MaterialCompiler::new();
        let roots = compiler.compile(&graph, plastic, &NoTextures).unwrap();
        match kind(&compiler, roots.front) {
            IrKind::Coating { eta, roughness, .. } => {
                assert_eq!(*eta, 1.5);
                assert_eq!(roughness.ndf, Ndf::Beckmann);
            }
            other => panic!("unexpected {other:?}"),
        }
        let coated = child(&compiler, roots.front, 0);
        assert!(matches!(kind(&compiler, coated), IrKind::Diffuse { roughness, .. } if !roughness.is_smooth()));
        assert_eq!(compiler.ir().node(roots.back).unwrap(), &IrNode::black_diffuse());

        let clear = compiler.compile(&graph, clear, &NoTextures).unwrap();
        assert!(matches!(kind(&compiler, clear.front), IrKind::Diffuse { .. }));
    }

    #[test]
    fn test_transparent_interfaces() {
        let mut graph = BsdfGraph::new();
        let air = graph.add("air", BsdfKind::Dielectric { int_ior: 1.0, ext_ior: 1.0, roughness: None });
        let d = diffuse(&mut graph, "d", [0.5; 3]);
        let coat = graph.add(
            "coat",
            BsdfKind::Coating {
                int_ior: 1.0000001,
                ext_ior: 1.0,
                thickness: 1.0,
                sigma_a: Vec3::ZERO.into(),
                roughness: None,
                bsdf: d,
            },
        );
        let mut compiler = MaterialCompiler::new();
        let air = compiler.compile(&graph, air, &NoTextures).unwrap();
        assert!(matches!(kind(&compiler, air.front), IrKind::Opacity { opacity: IrParam::Constant(o) } if *o == Vec3::ZERO));
        assert_eq!(compiler.ir().node(air.front).unwrap().children.len(), 0);
        assert!(matches!(kind(&compiler, air.back), IrKind::Opacity { .. }));

        let coat = compiler.compile(&graph, coat, &NoTextures).unwrap();
        assert!(matches!(kind(&compiler, coat.front), IrKind::Diffuse { .. }));
    }

    #[test]
    fn test_coating_thickness_and_back_side_cutoff() {
        let mut graph = BsdfGraph::new();
        let d = diffuse(&mut graph, "d", [0.5; 3]);
        let coat = graph.add(
            "coat",
            BsdfKind::Coating {
                int_ior: 1.5,
                ext_ior: 1.0,
                thickness: 2.0,
                sigma_a: Vec3::splat(0.25).into(),
                roughness: None,
                bsdf: d,
            },
        );
        let mut compiler = MaterialCompiler::new();
        let roots = compiler.compile(&graph, coat, &NoTextures).unwrap();
        assert!(matches!(
            kind(&compiler, roots.front),
            IrKind::Coating { thickness_sigma_a: IrParam::Constant(s), .. } if *s == Vec3::splat(0.5)
        ));
        // coating is opaque from behind, so nothing below it is compiled for the back
        assert!(compiler.ir().node(roots.back).unwrap().children.is_empty());
        assert_eq!(compiler.ir().len(), 3);
    }

    #[test]
    fn test_roughness_reads_alpha_v_only_for_ashikhmin_shirley() {
        let rough = |distribution| Roughness {
            distribution,
            alpha_u: FloatOrTexture::Value(0.1),
            alpha_v: Some(FloatOrTexture::Value(0.4)),
        };
        let mut graph = BsdfGraph::new();
        let ggx = graph.add(
            "ggx",
            BsdfKind::Conductor { eta: Vec3::splat(2.0), k: Vec3::ONE, ext_eta: 2.0, roughness: Some(rough(Distribution::Ggx)) },
        );
        let ash = graph.add(
            "ash",
            BsdfKind::Conductor {
                eta: Vec3::ONE,
                k: Vec3::ONE,
                ext_eta: 1.0,
                roughness: Some(rough(Distribution::AshikhminShirley)),
            },
        );
        let mut compiler = MaterialCompiler::new();
        let ggx = compiler.compile(&graph, ggx, &NoTextures).unwrap();
        let ash = compiler.compile(&graph, ash, &NoTextures).unwrap();
        match kind(&compiler, ggx.front) {
            IrKind::Conductor { eta, k, roughness } => {
                assert_eq!(*eta, Vec3::ONE);
                assert_eq!(*k, Vec3::splat(0.5));
                assert_eq!(roughness.alpha_v, IrParam::Constant(0.1));
            }
            other => panic!("unexpected {other:?}"),
        }
        match kind(&compiler, ash.front) {
            IrKind::Conductor { roughness, .. } => {
                assert_eq!(roughness.ndf, Ndf::AshikhminShirley);
                assert_eq!(roughness.alpha_v, IrParam::Constant(0.4));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_textures_use_error_texture() {
        let mut graph = BsdfGraph::new();
        let d = diffuse(&mut graph, "d", [0.5; 3]);
        let bump = graph.add(
            "bump",
            BsdfKind::BumpMap { texture: TextureElement::Bitmap { filename: "h.png".into() }, was_normal: false, bsdf: d },
        );
        let mut compiler = MaterialCompiler::new();
        let roots = compiler.compile(&graph, bump, &NoTextures).unwrap();
        match kind(&compiler, roots.front) {
            IrKind::GeomModifier { texture, .. } => assert!(texture.is_error()),
            other => panic!("unexpected {other:?}"),
        }
        // geometry modifiers are copied to the back with their subtree
        assert_eq!(compiler.ir().node(roots.back).unwrap().symbol(), Symbol::GeomModifier);
        assert_eq!(compiler.ir().node(child(&compiler, roots.back, 0)).unwrap(), &IrNode::black_diffuse());
    }
}
