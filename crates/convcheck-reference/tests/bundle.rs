use std::path::Path;

use anyhow::Result;
use convcheck_core::{DType, Shape, Tensor};
use convcheck_onnx::{save_model, GraphBuilder};
use convcheck_reference::Bundle;

fn write_signature(dir: &Path, key: &str) -> Result<()> {
    let bias = Tensor::from_vec(Shape::from_slice(&[3]), vec![1.0f32, 2.0, 3.0])?;
    let mut b = GraphBuilder::new(key);
    b.input("x", DType::F32, &[1, 3])
        .initializer("bias", &bias)
        .node("Add", &["x", "bias"], &["y"], vec![])
        .output("y", DType::F32, &[1, 3]);
    save_model(&b.finish("bundle-test"), &dir.join(format!("{key}.onnx")))
}

#[test]
fn serving_default_is_preferred() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for key in ["aaa", "default", "serving_default"] {
        write_signature(dir.path(), key)?;
    }
    let bundle = Bundle::open(dir.path())?;
    assert_eq!(bundle.default_signature_key(), Some("serving_default"));
    Ok(())
}

#[test]
fn default_then_first_key() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for key in ["zeta", "default", "alpha"] {
        write_signature(dir.path(), key)?;
    }
    assert_eq!(Bundle::open(dir.path())?.default_signature_key(), Some("default"));

    std::fs::remove_file(dir.path().join("default.onnx"))?;
    assert_eq!(Bundle::open(dir.path())?.default_signature_key(), Some("alpha"));
    Ok(())
}

#[test]
fn empty_bundle_has_no_signature() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("README.md"), "not a graph")?;
    let bundle = Bundle::open(dir.path())?;
    assert_eq!(bundle.default_signature_key(), None);
    assert!(bundle.signature("serving_default").is_err());
    Ok(())
}

#[test]
fn signature_is_callable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_signature(dir.path(), "serving_default")?;
    let bundle = Bundle::open(dir.path())?;
    let signature = bundle.signature("serving_default")?;
    assert_eq!(signature.bundle_root(), dir.path());

    let x = candle_core::Tensor::new(&[[10.0f32, 20.0, 30.0]], signature.graph().device())?;
    let outputs = signature.call([("x".to_string(), x)].into_iter().collect())?;
    assert_eq!(outputs["y"].to_vec2::<f32>()?, vec![vec![11.0, 22.0, 33.0]]);
    Ok(())
}
