pub mod config;
pub mod error;
pub mod ids;
pub mod op;
pub mod tensor;

pub use error::NumericError;
pub use ids::{NodeId, WorkerId};
pub use op::OpKind;
pub use tensor::{Shape, Tensor};
