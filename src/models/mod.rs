// src/models/mod.rs
pub mod driver;
pub mod fare;
pub mod ids;
pub mod negotiation;
pub mod review;
pub mod ride;
pub mod user;

pub use driver::*;
pub use fare::*;
pub use ids::*;
pub use negotiation::*;
pub use review::*;
pub use ride::*;
pub use user::*;
