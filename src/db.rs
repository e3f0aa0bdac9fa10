use std::io;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use rusqlite::ffi::ErrorCode;
use rusqlite::{Connection, Error as SqliteError, OpenFlags, OptionalExtension};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub struct DatabaseBootstrap {
    pub context: DatabaseContext,
    pub seeded: bool,
    pub recovered: bool,
}

/// Opens (or creates) the shop store under `data_dir`. When the file does not
/// exist yet and a seed database is available, the seed is copied in first.
pub fn bootstrap<P: AsRef<Path>>(
    data_dir: P,
    database_file: &str,
    seed: Option<&Path>,
) -> AppResult<DatabaseBootstrap> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);
    let seeded = copy_seed_if_missing(&db_path, seed)?;

    match establish_context(&db_path) {
        Ok(context) => {
            info!(
                target: "database_bootstrap",
                path = %db_path.display(),
                seeded,
                "shop store ready"
            );
            Ok(DatabaseBootstrap {
                context,
                seeded,
                recovered: false,
            })
        }
        Err(AppError::Database(err)) if should_attempt_recovery(&err, &db_path) => {
            warn!(
                target: "database_bootstrap",
                path = %db_path.display(),
                error = %err,
                "shop store failed to open, recreating it empty"
            );
            remove_store_files(&db_path)?;
            let context = establish_context(&db_path)?;
            Ok(DatabaseBootstrap {
                context,
                seeded: false,
                recovered: true,
            })
        }
        Err(err) => Err(err),
    }
}

/// Private in-memory store, used by tests and as a last-resort fallback.
pub fn open_in_memory() -> AppResult<DatabaseContext> {
    let connection = Connection::open_in_memory()?;
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    run_migrations(&connection)?;
    Ok(DatabaseContext {
        connection,
        path: PathBuf::from(":memory:"),
    })
}

fn copy_seed_if_missing(db_path: &Path, seed: Option<&Path>) -> AppResult<bool> {
    let Some(seed) = seed else {
        return Ok(false);
    };
    if db_path.exists() {
        return Ok(false);
    }
    if !seed.is_file() {
        warn!(
            target: "database_bootstrap",
            seed = %seed.display(),
            "seed database not found; starting empty"
        );
        return Ok(false);
    }
    std::fs::copy(seed, db_path)?;
    info!(
        target: "database_bootstrap",
        seed = %seed.display(),
        path = %db_path.display(),
        "copied seed database"
    );
    Ok(true)
}

fn establish_context(db_path: &Path) -> AppResult<DatabaseContext> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    run_migrations(&connection)?;
    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS coffee_shops (
            id TEXT PRIMARY KEY,
            external_id TEXT UNIQUE,
            name TEXT NOT NULL,
            address TEXT NOT NULL DEFAULT '',
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            rating REAL,
            review_count INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )?;

    // Seeds shipped before these columns existed still open cleanly.
    ensure_column(connection, "coffee_shops", "price_level INTEGER")?;
    ensure_column(
        connection,
        "coffee_shops",
        "place_type TEXT NOT NULL DEFAULT 'coffee_shop' CHECK (place_type IN ('coffee_shop','bakery'))",
    )?;
    ensure_column(connection, "coffee_shops", "phone_number TEXT")?;
    ensure_column(connection, "coffee_shops", "website TEXT")?;
    ensure_column(
        connection,
        "coffee_shops",
        "photo_references TEXT NOT NULL DEFAULT '[]'",
    )?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_coffee_shops_lat_lng ON coffee_shops(latitude, longitude)",
        [],
    )?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn should_attempt_recovery(err: &SqliteError, db_path: &Path) -> bool {
    if !db_path.exists() {
        return false;
    }
    match err {
        SqliteError::SqliteFailure(code, message) => {
            matches!(code.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
                || message
                    .as_deref()
                    .map(|msg| msg.contains("database disk image is malformed"))
                    .unwrap_or(false)
        }
        _ => false,
    }
}

fn remove_store_files(db_path: &Path) -> AppResult<()> {
    remove_if_exists(db_path)?;
    remove_if_exists(&sibling_path(db_path, "-wal"))?;
    remove_if_exists(&sibling_path(db_path, "-shm"))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> AppResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::Io(err)),
    }
}

fn sibling_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// RFC 3339 with microseconds so successive writes in a test still order.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn read_meta(connection: &Connection, key: &str) -> AppResult<Option<String>> {
    let value = connection
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn write_meta(connection: &Connection, key: &str, value: &str) -> AppResult<()> {
    connection.execute(
        "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table_names(connection: &Connection) -> Vec<String> {
        let mut stmt = connection
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .map(Result::unwrap)
            .collect()
    }

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let bootstrap = bootstrap(dir.path(), "test.db", None).unwrap();
        let ctx = bootstrap.context;

        let tables = table_names(&ctx.connection);
        assert!(tables.contains(&"coffee_shops".to_string()));
        assert!(tables.contains(&"store_meta".to_string()));
        assert!(column_exists(&ctx.connection, "coffee_shops", "photo_references").unwrap());
        assert!(ctx.path.ends_with("test.db"));
        assert!(!bootstrap.recovered);
        assert!(!bootstrap.seeded);
    }

    #[test]
    fn migrations_are_idempotent_on_reopen() {
        let dir = tempdir().unwrap();
        drop(bootstrap(dir.path(), "again.db", None).unwrap());
        let reopened = bootstrap(dir.path(), "again.db", None).unwrap();
        assert!(!reopened.recovered);
    }

    #[test]
    fn copies_seed_only_when_store_is_missing() {
        let dir = tempdir().unwrap();
        let seed_dir = tempdir().unwrap();
        {
            let seed = bootstrap(seed_dir.path(), "seed.db", None).unwrap();
            write_meta(&seed.context.connection, "origin", "seed").unwrap();
        }
        let seed_path = seed_dir.path().join("seed.db");

        let first = bootstrap(dir.path(), "shops.db", Some(&seed_path)).unwrap();
        assert!(first.seeded);
        assert_eq!(
            read_meta(&first.context.connection, "origin").unwrap().as_deref(),
            Some("seed")
        );
        write_meta(&first.context.connection, "origin", "local").unwrap();
        drop(first);

        let second = bootstrap(dir.path(), "shops.db", Some(&seed_path)).unwrap();
        assert!(!second.seeded);
        assert_eq!(
            read_meta(&second.context.connection, "origin").unwrap().as_deref(),
            Some("local")
        );
    }

    #[test]
    fn missing_seed_starts_empty() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.db");
        let store = bootstrap(dir.path(), "shops.db", Some(&missing)).unwrap();
        assert!(!store.seeded);
    }

    #[test]
    fn recovers_from_corrupt_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("broken.db"), vec![0x42_u8; 8192]).unwrap();

        let recovered = bootstrap(dir.path(), "broken.db", None).unwrap();
        assert!(recovered.recovered);
        assert!(table_names(&recovered.context.connection).contains(&"coffee_shops".to_string()));
    }

    #[test]
    fn meta_values_upsert() {
        let ctx = open_in_memory().unwrap();
        assert_eq!(read_meta(&ctx.connection, "last_sync").unwrap(), None);
        write_meta(&ctx.connection, "last_sync", "a").unwrap();
        write_meta(&ctx.connection, "last_sync", "b").unwrap();
        assert_eq!(
            read_meta(&ctx.connection, "last_sync").unwrap().as_deref(),
            Some("b")
        );
    }
}
