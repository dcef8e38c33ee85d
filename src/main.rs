use avaprep::cli::SubCommandExtend;
use avaprep::config::{Opts, SubCommand};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();

    match &opts.subcmd {
        SubCommand::Pack(config) => config.run(&opts).await,
        SubCommand::Manifest(config) => config.run(&opts).await,
        SubCommand::Zip(config) => config.run(&opts).await,
        SubCommand::Embed(config) => config.run(&opts).await,
    }
}
