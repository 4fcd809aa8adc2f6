//! Table helpers shared by commands.

use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};

pub fn create_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(header);
    table
}

pub fn format_entry_type(is_dir: bool) -> &'static str {
    if is_dir { "dir" } else { "file" }
}

pub fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
