use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::{Executor, Row, SqlitePool};
use std::collections::HashMap;

use crate::time::now_ms;
use tracing::{error, info};

static ADD_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^ALTER\s+TABLE\s+(\w+)\s+ADD\s+COLUMN\s+(\w+)")
        .expect("add column pattern to compile")
});

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.chars().count() > 160 {
        format!("{}…", trimmed.chars().take(160).collect::<String>())
    } else {
        trimmed.to_string()
    }
}

static MIGRATIONS: &[(&str, &str)] = &[
    (
        "202610010900_domain_tables.sql",
        include_str!("../migrations/202610010900_domain_tables.sql"),
    ),
    (
        "202610010910_sync_ledger.sql",
        include_str!("../migrations/202610010910_sync_ledger.sql"),
    ),
    (
        "202610021400_sync_deferred.sql",
        include_str!("../migrations/202610021400_sync_deferred.sql"),
    ),
];

fn clean(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn checksum(cleaned: &str) -> String {
    format!("{:x}", Sha256::digest(cleaned.as_bytes()))
}

/// Version the sync payload format expects the local schema to be at.
pub fn latest_version() -> &'static str {
    MIGRATIONS.last().map(|(name, _)| *name).unwrap_or("")
}

pub fn known_versions() -> impl Iterator<Item = &'static str> {
    MIGRATIONS.iter().map(|(name, _)| *name)
}

async fn ensure_bookkeeping(pool: &SqlitePool) -> anyhow::Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version   TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum TEXT NOT NULL\
         )",
    )
    .await?;
    Ok(())
}

async fn applied(pool: &SqlitePool) -> anyhow::Result<HashMap<String, String>> {
    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let mut applied: HashMap<String, String> = HashMap::new();
    for r in rows {
        if let (Ok(v), Ok(c)) = (
            r.try_get::<String, _>("version"),
            r.try_get::<String, _>("checksum"),
        ) {
            applied.insert(v, c);
        }
    }
    Ok(applied)
}

/// Most recent applied migration, if any.
pub async fn current_version(pool: &SqlitePool) -> anyhow::Result<Option<String>> {
    ensure_bookkeeping(pool).await?;
    let version: Option<String> =
        sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;
    Ok(version)
}

pub async fn pending_versions(pool: &SqlitePool) -> anyhow::Result<Vec<&'static str>> {
    ensure_bookkeeping(pool).await?;
    let applied = applied(pool).await?;
    Ok(known_versions()
        .filter(|name| !applied.contains_key(*name))
        .collect())
}

/// Apply every embedded migration not yet recorded. Returns the versions
/// applied by this call; an empty list means the schema was already current.
pub async fn apply_migrations(pool: &SqlitePool) -> anyhow::Result<Vec<&'static str>> {
    ensure_bookkeeping(pool).await?;
    let applied = applied(pool).await?;
    let mut newly_applied = Vec::new();

    for (filename, raw_sql) in MIGRATIONS {
        let cleaned = clean(raw_sql);
        let checksum = checksum(&cleaned);

        if let Some(stored) = applied.get(*filename) {
            if stored != &checksum {
                anyhow::bail!("migration {} edited after application", filename);
            }
            continue;
        }

        let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;
        for stmt in cleaned.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            let upper = s.to_ascii_uppercase();
            if upper == "BEGIN" || upper == "COMMIT" {
                continue;
            }
            if let Some(caps) = ADD_COLUMN.captures(s) {
                let (table, col) = (&caps[1], &caps[2]);
                let exists: Option<i64> = sqlx::query_scalar(
                    "SELECT 1 FROM pragma_table_info(?) WHERE name = ?",
                )
                .bind(table)
                .bind(col)
                .fetch_optional(&mut *tx)
                .await?;
                if exists.is_some() {
                    info!(target: "hearthkeep", event = "migration_stmt_skip", file = %filename, sql = %preview(s));
                    continue;
                }
            }
            info!(target: "hearthkeep", event = "migration_stmt", file = %filename, sql = %preview(s));
            if let Err(e) = sqlx::query(s).execute(&mut *tx).await {
                error!(target: "hearthkeep", event = "migration_stmt_error", file = %filename, sql = %preview(s), error = %e);
                return Err(e.into());
            }
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?, ?, ?)",
        )
        .bind(*filename)
        .bind(now_ms())
        .bind(&checksum)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(target: "hearthkeep", event = "migration_file_applied", file = %filename);
        newly_applied.push(*filename);
    }

    Ok(newly_applied)
}
