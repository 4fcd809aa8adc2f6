pub mod config;
pub mod index;
pub mod link;
pub mod ls;
pub mod search;
pub mod unarchive;
pub mod vpath;
pub mod watch;

use anyhow::Result;
use tracing::debug;

use crate::App;

/// Loads the persisted index, rebuilding it when nothing was restored.
pub async fn ensure_index(app: &mut App) -> Result<usize> {
    match app.service.restore_index() {
        Ok(count) if count > 0 => {
            debug!(documents = count, "using persisted index");
            Ok(count)
        }
        Ok(_) => Ok(app.service.init_index().await?),
        Err(e) => {
            debug!(error = %e, "persisted index unreadable, rebuilding");
            Ok(app.service.init_index().await?)
        }
    }
}
