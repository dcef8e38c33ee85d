mod archive;
mod embed;
mod manifest;
mod pack;

pub use archive::*;
pub use embed::*;
pub use manifest::*;
pub use pack::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
