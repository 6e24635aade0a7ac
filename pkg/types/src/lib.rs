pub mod config;
pub mod fleet;
pub mod lease;
pub mod node;
pub mod session;
pub mod validate;
