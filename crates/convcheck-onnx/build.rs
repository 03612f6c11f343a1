fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=src/onnx.proto");

    // protox parses the schema in-process, so no protoc install is needed.
    let descriptors = protox::compile(["src/onnx.proto"], ["src"])?;
    prost_build::Config::new().compile_fds(descriptors)?;
    Ok(())
}
