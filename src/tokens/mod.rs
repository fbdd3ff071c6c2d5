pub mod registry;

pub use registry::{TokenPage, TokenRegistry};
