//! Message types for the subset of `onnx.proto` the harness reads and writes,
//! generated from `src/onnx.proto`.

include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
