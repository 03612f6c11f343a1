//! Reading, inspecting and building graphs in the ONNX interchange format.

pub mod graph;
pub mod proto;

pub use graph::*;
