//! Material IR compiler.
//!
//! Turns a BSDF scene graph into two rooted IR DAGs per material, one for
//! front faces and one for back faces.
//!
//! ## Key Concepts
//!
//! - **BSDF graph**: elements in an arena, children referenced by index
//! - **IR**: arena of typed nodes shared between all compiled materials
//! - **Back-face rule**: how a one-sided node looks from behind
//!
//! ## Example
//!
//! ```ignore
//! use nabla::material::{BsdfGraph, MaterialCompiler};
//!
//! let graph = BsdfGraph::load("materials.json".as_ref())?;
//! let mut compiler = MaterialCompiler::new();
//! for (root, roots) in compiler.compile_all(&graph, &cache)? {
//!     println!("{}", compiler.ir().dump(roots.front));
//! }
//! ```

pub mod bsdf;
pub mod compiler;
pub mod ir;
pub mod texture;

pub use bsdf::{BsdfElement, BsdfGraph, BsdfKind, Distribution, ElementId, FloatOrTexture, GraphId, SpectrumOrTexture, TextureElement};
pub use compiler::{is_transparent_eta, MaterialCompiler};
pub use ir::{FrontAndBack, Ir, IrKind, IrNode, IrParam, Microfacet, Ndf, NodeHandle, Symbol};
pub use texture::{IrTexture, TextureResolver, DEFAULT_SAMPLER_KEY, ERROR_TEXTURE_KEY};
