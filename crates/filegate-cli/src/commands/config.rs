//! Config command - print the effective configuration.

use anyhow::Result;
use clap::Args as ClapArgs;

use filegate_core::Config;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Show the signing secret instead of redacting it
    #[arg(long)]
    pub show_secrets: bool,
}

pub fn execute(config: &Config, args: &Args) -> Result<()> {
    let mut shown = config.clone();
    if !args.show_secrets {
        shown.session.jwt_secret = "<redacted>".to_string();
    }
    print!("{}", toml::to_string_pretty(&shown)?);
    Ok(())
}
