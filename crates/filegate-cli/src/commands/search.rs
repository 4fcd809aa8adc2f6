//! Search command - query the path index by name.

use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::instrument;

use super::ensure_index;
use crate::App;
use crate::output::{create_table, format_entry_type, print_json};

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Substring to look for in file names
    pub pattern: String,

    /// Directory to search below (default: root)
    #[arg(long, default_value = "")]
    pub dir: String,

    /// 1-based result page
    #[arg(long, default_value_t = 1)]
    pub page: usize,

    /// Results per page
    #[arg(long, default_value_t = filegate_core::index::DEFAULT_PAGE_SIZE)]
    pub size: usize,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[instrument(level = "info", name = "cmd::search", skip_all, fields(pattern = %args.pattern))]
pub async fn execute(app: &mut App, args: &Args) -> Result<()> {
    ensure_index(app).await?;
    let page = app
        .service
        .search(&app.fs, &args.dir, &args.pattern, args.page, args.size)
        .await?;

    if args.json {
        return print_json(&page);
    }
    if page.hits.is_empty() {
        eprintln!("No matches.");
        return Ok(());
    }
    let mut table = create_table(vec!["Path", "Type"]);
    for hit in &page.hits {
        table.add_row(vec![hit.path.as_str(), format_entry_type(hit.is_dir)]);
    }
    println!("{table}");
    println!("{} of {} matches", page.hits.len(), page.total);
    Ok(())
}
