use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::database::Database;

/// Returns the default path of the rolodex database
///
/// # Platform-specific paths
///
/// - **macOS**: `~/Library/Application Support/rolodex/rolodex.sqlite3`
/// - **Linux**: `~/.local/share/rolodex/rolodex.sqlite3`
/// - **Windows**: `%LOCALAPPDATA%\rolodex\rolodex.sqlite3`
pub fn get_db_path() -> anyhow::Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine local data directory"))?;

    Ok(data_dir.join("rolodex").join("rolodex.sqlite3"))
}

/// Opens (or creates) the database and runs migrations.
///
/// Existing files are kept; import jobs and row logs are an audit trail.
pub fn initialize_database(path: Option<&Path>) -> anyhow::Result<(Arc<Database>, PathBuf)> {
    let db_path = match path {
        Some(path) => path.to_path_buf(),
        None => get_db_path()?,
    };

    let db = Database::new(&db_path)?;
    Ok((Arc::new(db), db_path))
}
