//! Index command - rebuild the path index from disk.
//!
//! ```bash
//! filegate --root /srv/files index
//! filegate --root /srv/files index --json
//! ```

use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::instrument;

use crate::App;
use crate::output::print_json;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[instrument(level = "info", name = "cmd::index", skip_all)]
pub async fn execute(app: &App, args: &Args) -> Result<()> {
    let started = std::time::Instant::now();
    let documents = app.service.reset_index(&app.fs).await?;
    let elapsed = started.elapsed();
    if args.json {
        print_json(&serde_json::json!({
            "root": app.service.index().root(),
            "documents": documents,
            "elapsed_ms": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }))?;
    } else {
        println!(
            "Indexed {documents} paths under {} in {:.2?}",
            app.service.index().root().display(),
            elapsed
        );
    }
    Ok(())
}
