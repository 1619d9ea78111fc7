use crate::core::broker::DbBroker;
use crate::core::error::VigilError;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, VigilError> {
    db_connect_with_timeout(db_path, 5)
}

pub fn db_connect_with_timeout(db_path: &str, busy_secs: u64) -> Result<Connection, VigilError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(busy_secs))
        .map_err(VigilError::RusqliteError)?;
    // WAL gives atomic commits: a crash mid-write can never leave a torn record.
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(VigilError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(VigilError::RusqliteError)?;
    Ok(conn)
}

pub fn vigil_db_path(root: &Path) -> PathBuf {
    root.join(schemas::VIGIL_DB_NAME)
}

pub fn initialize_db(root: &Path) -> Result<(), VigilError> {
    let db_path = vigil_db_path(root);
    if let Some(parent_dir) = db_path.parent() {
        fs::create_dir_all(parent_dir).map_err(VigilError::IoError)?;
    }

    let broker = DbBroker::new(root);
    broker.with_write(&db_path, "vigil", "db.init", |conn| {
        for schema in schemas::ALL_SCHEMAS {
            conn.execute(schema, [])?;
        }
        conn.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES('schema_version', ?1)",
            [schemas::SCHEMA_VERSION.to_string()],
        )?;
        Ok(())
    })
}
