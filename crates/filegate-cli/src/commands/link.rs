//! Link command - mint a download link for a path.

use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::instrument;

use crate::App;
use crate::output::print_json;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// File or directory below the root
    pub path: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[instrument(level = "info", name = "cmd::link", skip_all, fields(path = %args.path))]
pub async fn execute(app: &App, args: &Args) -> Result<()> {
    let (token, _) = app.service.issuer().issue(&app.operator)?;
    let ticket = app
        .service
        .create_download_link(&app.fs, &args.path, &token)
        .await?;
    if args.json {
        print_json(&ticket)?;
    } else {
        println!("{}", ticket.url);
        eprintln!(
            "Link {} expires in {}",
            ticket.id,
            humanize(app.service.links().ttl())
        );
    }
    Ok(())
}

fn humanize(ttl: std::time::Duration) -> String {
    let secs = ttl.as_secs();
    match (secs / 3600, secs % 3600 / 60) {
        (0, m) => format!("{m}m"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h{m}m"),
    }
}
