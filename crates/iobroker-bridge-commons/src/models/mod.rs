pub mod config_model;

pub use config_model::*;
