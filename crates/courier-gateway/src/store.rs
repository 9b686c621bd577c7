use std::sync::Arc;

use anyhow::{Result, anyhow};

use courier_db::Database;

/// Run a blocking rusqlite call off the async runtime.
pub async fn run_blocking<F, T>(db: &Arc<Database>, f: F) -> Result<T>
where
    F: FnOnce(&Database) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| anyhow!("spawn_blocking join error: {}", e))?
}
