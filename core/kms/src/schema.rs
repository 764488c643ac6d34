//! Relational schema of the key store.

use rusqlite::Connection;

use tokenkms_common::Result;

/// Current schema version, recorded in `meta`.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    serial TEXT NOT NULL UNIQUE,
    pin TEXT NOT NULL DEFAULT '',
    admin_pin TEXT NOT NULL DEFAULT '',
    update_counter INTEGER NOT NULL DEFAULT 0,
    k1 INTEGER NOT NULL,
    k2 INTEGER NOT NULL,
    initialized INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS key_groups (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    max_keys INTEGER NOT NULL,
    algorithm INTEGER NOT NULL,
    cryptoperiod INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS user_groups (
    user_id INTEGER NOT NULL,
    group_id INTEGER NOT NULL,
    PRIMARY KEY (user_id, group_id)
);

CREATE TABLE IF NOT EXISTS keys (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    owner_group INTEGER,
    status INTEGER NOT NULL,
    algorithm INTEGER NOT NULL,
    length INTEGER NOT NULL,
    generated_at INTEGER NOT NULL DEFAULT 0,
    activated_at INTEGER NOT NULL DEFAULT 0,
    expires_at INTEGER NOT NULL DEFAULT 0,
    deactivated_at INTEGER NOT NULL DEFAULT 0,
    compromised_at INTEGER NOT NULL DEFAULT 0,
    destroyed_at INTEGER NOT NULL DEFAULT 0,
    suspended_at INTEGER NOT NULL DEFAULT 0,
    cryptoperiod INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_keys_owner ON keys(owner_group);
CREATE INDEX IF NOT EXISTS idx_user_groups_group ON user_groups(group_id);

CREATE TABLE IF NOT EXISTS recovery (
    user_id INTEGER PRIMARY KEY,
    serial TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS device_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    update_counter INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS meta (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

/// Create missing tables and seed the bookkeeping rows.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    conn.execute(
        "INSERT OR IGNORE INTO device_state (id, update_counter) VALUES (1, 0)",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta (name, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

/// Tables holding replicated state, wiped by a reset.
pub(crate) const REPLICATED_TABLES: [&str; 4] = ["user_groups", "keys", "key_groups", "users"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        let counter: i64 = conn
            .query_row("SELECT update_counter FROM device_state", [], |r| r.get(0))
            .unwrap();
        assert_eq!(counter, 0);
    }
}
