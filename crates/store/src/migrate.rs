//! Checksum-verified schema migrations.
//!
//! `*.sql` files in the migrations directory are applied in lexicographic
//! order. Each applied file is recorded in `schema_migrations` with a
//! SHA-256 checksum: a file whose recorded checksum matches is skipped, a
//! file whose recorded checksum differs refuses to run (edit history must
//! be append-only).

use std::path::Path;

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("checksum mismatch for {filename}: recorded {recorded}, on disk {actual}")]
    ChecksumMismatch {
        filename: String,
        recorded: String,
        actual: String,
    },

    #[error("reading {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// What happened to each file.
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Reconcile {
    Apply,
    Skip,
    Refuse,
}

/// Decide what to do with one file given the recorded checksum (if any).
pub(crate) fn reconcile(recorded: Option<&str>, actual: &str) -> Reconcile {
    match recorded {
        None => Reconcile::Apply,
        Some(recorded) if recorded == actual => Reconcile::Skip,
        Some(_) => Reconcile::Refuse,
    }
}

pub fn checksum(contents: &[u8]) -> String {
    hex::encode(Sha256::digest(contents))
}

/// Apply all pending migrations under `dir`.
pub async fn run(pool: &PgPool, dir: &Path) -> Result<MigrationReport, MigrateError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
           filename   text PRIMARY KEY,
           checksum   text NOT NULL,
           applied_at timestamptz NOT NULL DEFAULT now()
         )",
    )
    .execute(pool)
    .await?;

    let mut files: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| MigrateError::Io(dir.display().to_string(), e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().map(|ext| ext == "sql").unwrap_or(false)
        })
        .collect();
    files.sort();

    let mut report = MigrationReport::default();

    for path in files {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let contents =
            std::fs::read(&path).map_err(|e| MigrateError::Io(filename.clone(), e))?;
        if contents.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        let actual = checksum(&contents);

        let recorded: Option<String> =
            sqlx::query_scalar("SELECT checksum FROM schema_migrations WHERE filename = $1")
                .bind(&filename)
                .fetch_optional(pool)
                .await?;

        match reconcile(recorded.as_deref(), &actual) {
            Reconcile::Skip => {
                report.skipped.push(filename);
            }
            Reconcile::Refuse => {
                return Err(MigrateError::ChecksumMismatch {
                    filename,
                    recorded: recorded.unwrap_or_default(),
                    actual,
                });
            }
            Reconcile::Apply => {
                let sql = String::from_utf8_lossy(&contents).into_owned();
                let mut tx = pool.begin().await?;
                sqlx::raw_sql(&sql).execute(&mut *tx).await?;
                sqlx::query("INSERT INTO schema_migrations (filename, checksum) VALUES ($1, $2)")
                    .bind(&filename)
                    .bind(&actual)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                info!(filename = %filename, "migration applied");
                report.applied.push(filename);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_hex() {
        let a = checksum(b"CREATE TABLE t (id int);");
        let b = checksum(b"CREATE TABLE t (id int);");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn unrecorded_files_apply() {
        assert_eq!(reconcile(None, "abc"), Reconcile::Apply);
    }

    #[test]
    fn matching_checksums_skip() {
        assert_eq!(reconcile(Some("abc"), "abc"), Reconcile::Skip);
    }

    #[test]
    fn differing_checksums_refuse() {
        assert_eq!(reconcile(Some("abc"), "def"), Reconcile::Refuse);
    }
}
