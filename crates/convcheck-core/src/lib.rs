pub mod artifact;
pub mod backend;
pub mod case;
pub mod error;
pub mod spec;
pub mod tensor;

pub use artifact::*;
pub use backend::*;
pub use case::*;
pub use error::*;
pub use spec::*;
pub use tensor::*;
