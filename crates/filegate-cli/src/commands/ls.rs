//! Ls command - list a directory through the virtual filesystem.

use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::instrument;

use filegate_common::format_bytes;

use crate::App;
use crate::output::{create_table, format_entry_type, print_json};

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Directory below the root (default: root)
    #[arg(default_value = "/")]
    pub path: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[instrument(level = "info", name = "cmd::ls", skip_all, fields(path = %args.path))]
pub async fn execute(app: &App, args: &Args) -> Result<()> {
    let mut entries = app.service.list(&app.fs, &args.path).await?;
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

    if args.json {
        return print_json(&serde_json::json!({ "path": args.path, "entries": entries }));
    }
    let mut table = create_table(vec!["Name", "Type", "Size", "Modified"]);
    for entry in &entries {
        let modified = entry
            .modified
            .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let size = if entry.is_dir { String::new() } else { format_bytes(entry.size) };
        table.add_row(vec![
            entry.name.clone(),
            format_entry_type(entry.is_dir).to_string(),
            size,
            modified,
        ]);
    }
    println!("{table}");
    Ok(())
}
