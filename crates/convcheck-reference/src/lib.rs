//! Reference-framework side of the conversion checks.
//!
//! Everything here executes on candle's CPU device and is the ground truth
//! the converted models are compared against.

pub mod bundle;
pub mod convert;
pub mod interp;
pub mod sdpa;

pub use bundle::{Bundle, Signature, PREFERRED_SIGNATURES};
pub use convert::{from_candle, natural_dtype, to_candle};
pub use interp::{declared_dtype, ReferenceGraph};
pub use sdpa::{build_model, scaled_dot_product_attention, SdpaConfig, SdpaModel, SDPA_OP};
