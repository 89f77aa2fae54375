pub mod geo;
pub mod id_generator;
pub mod money;

pub use id_generator::{IdGenerator, IdType};
