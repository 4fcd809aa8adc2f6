//! Unarchive command - extract an archive and stream its progress.

use anyhow::{Result, bail};
use clap::Args as ClapArgs;
use filegate_core::ProgressEvent;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::ensure_index;
use crate::App;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Archive below the root
    pub path: String,

    /// Emit server-sent-event frames instead of plain lines
    #[arg(long)]
    pub sse: bool,
}

#[instrument(level = "info", name = "cmd::unarchive", skip_all, fields(path = %args.path))]
pub async fn execute(app: &mut App, args: &Args) -> Result<()> {
    ensure_index(app).await?;
    let cancel = CancellationToken::new();
    let mut progress = app.service.unarchive(&app.fs, &args.path, &cancel).await?;

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let mut failure = None;
    while let Some(event) = progress.next().await {
        if args.sse {
            print!("{}", event.to_sse());
        } else {
            println!("{}", event.text());
        }
        if let ProgressEvent::Error(message) = event {
            failure = Some(message);
        }
    }
    if let Some(message) = failure {
        bail!("{message}");
    }
    Ok(())
}
