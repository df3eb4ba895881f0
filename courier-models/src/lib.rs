pub mod core;
pub mod errors;
