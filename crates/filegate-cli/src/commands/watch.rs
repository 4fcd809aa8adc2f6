//! Watch command - mirror filesystem changes into the index and report them.

use anyhow::Result;
use clap::Args as ClapArgs;
use tokio::sync::broadcast::error::RecvError;
use tracing::{instrument, warn};

use crate::App;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,
}

#[instrument(level = "info", name = "cmd::watch", skip_all)]
pub async fn execute(app: &mut App, args: &Args) -> Result<()> {
    let mut events = app.service.index_events();
    let documents = app.service.init_index().await?;
    // init_index already started one when the config asks for watching
    let _watcher = if app.service.config().index.watch {
        None
    } else {
        Some(app.service.index().watch()?)
    };
    eprintln!(
        "Watching {} ({documents} paths). Press Ctrl-C to stop.",
        app.service.index().root().display()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) if args.json => println!("{}", serde_json::to_string(&event)?),
                Ok(event) => println!("{event:?} (now {} paths)", app.service.index().len()),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "dropped index events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}
