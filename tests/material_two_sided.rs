//! Material graphs loaded from disk through the asset manager and compiled
//! into front and back IR roots.

use nabla::asset::AssetManager;
use nabla::blit::{Image, TexelFormat};
use nabla::material::{IrKind, IrNode, IrParam, MaterialCompiler, Symbol};
use nabla::util::{Error, Extent3};

const GRAPH: &str = r#"{ "elements": [
    { "id": "leaf", "type": "diffuse", "reflectance": { "type": "bitmap", "filename": "leaf.png" } },
    { "id": "cutout", "type": "mask", "opacity": [0.5, 0.5, 0.5], "bsdf": 0 },
    { "id": "paper", "type": "two_sided", "bsdfs": [1] },
    { "id": "bark", "type": "diffuse", "reflectance": { "type": "scale", "scale": 0.5,
        "texture": { "type": "bitmap", "filename": "bark.png" } } },
    { "id": "glass", "type": "dielectric", "int_ior": 1.5 }
] }"#;

fn write_scene(dir: &std::path::Path) {
    std::fs::write(dir.join("scene.json"), GRAPH).unwrap();
    let texels = [[0.2, 0.6, 0.1, 1.0]; 4];
    Image::from_linear(Extent3::d2(2, 2), TexelFormat::Rgba8Srgb, &texels)
        .unwrap()
        .save(&dir.join("leaf.png"))
        .unwrap();
}

#[test]
fn test_two_sided_leaf_and_one_sided_bark() {
    let dir = tempfile::tempdir().unwrap();
    write_scene(dir.path());
    let assets = AssetManager::new().with_root(dir.path());
    let graph = assets.load(std::path::Path::new("scene.json")).unwrap().bsdf().unwrap();
    // bark.png is missing
    assert_eq!(assets.preload_textures(&graph).unwrap(), 1);

    let mut compiler = MaterialCompiler::new();
    let roots = compiler.compile_all(&graph, assets.cache().as_ref()).unwrap();
    let ids: Vec<&str> = roots.iter().map(|(e, _)| graph.get(*e).unwrap().id.as_str()).collect();
    assert_eq!(ids, vec!["paper", "bark", "glass"]);
    let ir = compiler.ir();

    // a single-child two-sided material shows the same DAG on both faces
    let paper = roots[0].1;
    assert_eq!(paper.front, paper.back);
    let mask = ir.node(paper.front).unwrap();
    assert_eq!(mask.symbol(), Symbol::Opacity);
    let leaf = ir.node(mask.children[0].unwrap()).unwrap();
    match &leaf.kind {
        IrKind::Diffuse { reflectance: IrParam::Texture(t), .. } => {
            assert_eq!(t.image, "leaf.png");
            assert!(!t.is_error());
        }
        other => panic!("unexpected {other:?}"),
    }

    // one-sided diffuse: error texture in front, black from behind
    let bark = roots[1].1;
    match &ir.node(bark.front).unwrap().kind {
        IrKind::Diffuse { reflectance: IrParam::Texture(t), .. } => assert!(t.is_error()),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(ir.node(bark.back).unwrap(), &IrNode::black_diffuse());

    // glass is seen from inside on the back
    let glass = roots[2].1;
    assert_ne!(glass.front, glass.back);
    match &ir.node(glass.back).unwrap().kind {
        IrKind::Dielectric { eta, .. } => assert!((eta - 1.0 / 1.5).abs() < 1e-6),
        other => panic!("unexpected {other:?}"),
    }

    let dump = ir.dump(paper.front);
    assert!(dump.contains("opacity") && dump.contains("diffuse"), "{dump}");
}

#[test]
fn test_unknown_child_index_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, r#"{ "elements": [ { "id": "two", "type": "two_sided", "bsdfs": [4] } ] }"#).unwrap();
    let graph = AssetManager::new().load(&path).unwrap().bsdf().unwrap();
    let mut compiler = MaterialCompiler::new();
    let err = compiler.compile(&graph, 0, &nabla::asset::AssetCache::new()).unwrap_err();
    assert!(matches!(err, Error::MalformedBsdf { .. }), "{err}");
    assert!(compiler.ir().is_empty());
}
