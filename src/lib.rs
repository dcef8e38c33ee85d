pub mod cli;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod embed;
pub mod error;
pub mod manifest;
pub mod packer;
pub mod prepare;
pub mod scan;
pub mod shard;
pub mod table;
pub mod utils;

pub use config::Opts;
pub use error::{PrepError, Result};
