//! Vpath command - convert between real and virtual path names.

use anyhow::Result;
use clap::{Args as ClapArgs, Subcommand};

use filegate_core::vpath;

#[derive(ClapArgs, Clone)]
pub struct Args {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Clone)]
pub enum Action {
    /// Encode a relative directory into its virtual name
    Encode { path: String },
    /// Decode a client path whose first component may be a virtual name
    Decode { path: String },
}

pub fn execute(args: &Args) -> Result<()> {
    match &args.action {
        Action::Encode { path } => println!("{}", vpath::encode(path)),
        Action::Decode { path } => println!("{}", vpath::decode_path(path)),
    }
    Ok(())
}
