use anyhow::Result;
use convcheck_core::{DType, ElementType, IOName, InputSpec, Shape, Tensor};
use convcheck_onnx::{
    attr_ints, decode_model, encode_model, graph, input_signature, load_model,
    output_signature, save_model, tensor_from_proto, tensor_to_proto, GraphBuilder,
};

fn two_output_model() -> Result<convcheck_onnx::proto::ModelProto> {
    let weight = Tensor::from_vec(Shape::from_slice(&[4, 4]), vec![0.5f32; 16])?;
    let mut b = GraphBuilder::new("linear");
    b.input("x", DType::F32, &[2, 4])
        .input("weight", DType::F32, &[4, 4])
        .initializer("weight", &weight)
        .node("MatMul", &["x", "weight"], &["y"], vec![])
        .node("Transpose", &["y"], &["yt"], vec![attr_ints("perm", &[1, 0])])
        .output("y", DType::F32, &[2, 4])
        .output("yt", DType::F32, &[4, 2]);
    Ok(b.finish("signature-test"))
}

#[test]
fn initializer_backed_inputs_are_bound() -> Result<()> {
    let model = two_output_model()?;
    let inputs = input_signature(graph(&model)?);
    assert_eq!(inputs.len(), 2);
    assert!(!inputs[0].bound);
    assert!(inputs[1].bound);
    assert_eq!(inputs[0].elem, ElementType::Known(DType::F32));

    let resolved = InputSpec::resolve(&inputs)?;
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved.0[0].shape, Shape::from_slice(&[2, 4]));
    Ok(())
}

#[test]
fn output_signature_lists_graph_outputs() -> Result<()> {
    let model = two_output_model()?;
    let names: Vec<IOName> = output_signature(graph(&model)?)
        .into_iter()
        .map(|o| o.name)
        .collect();
    assert_eq!(names, vec![IOName::from("y"), IOName::from("yt")]);
    Ok(())
}

#[test]
fn model_survives_a_file_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("linear.onnx");
    let model = two_output_model()?;
    save_model(&model, &path)?;
    assert_eq!(load_model(&path)?, model);
    assert_eq!(decode_model(&encode_model(&model))?, model);
    Ok(())
}

#[test]
fn typed_tensor_fields_decode() -> Result<()> {
    let mut proto = tensor_to_proto("k", &Tensor::from_vec(Shape::from_slice(&[2]), vec![0f64; 2])?);
    proto.raw_data.clear();
    proto.double_data = vec![1.0, 2.5];
    let tensor = tensor_from_proto(&proto)?;
    assert_eq!(tensor.to_vec::<f64>()?, vec![1.0, 2.5]);
    Ok(())
}

#[test]
fn unknown_element_types_are_reported_not_guessed() -> Result<()> {
    let mut model = two_output_model()?;
    let g = model.graph.as_mut().unwrap();
    if let Some(convcheck_onnx::proto::type_proto::Value::TensorType(t)) =
        g.input[0].r#type.as_mut().and_then(|t| t.value.as_mut())
    {
        t.elem_type = 8; // string
    }
    let inputs = input_signature(graph(&model)?);
    assert_eq!(inputs[0].elem, ElementType::Other(8));
    assert!(InputSpec::resolve(&inputs).is_err());
    Ok(())
}
