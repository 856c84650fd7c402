use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, Result};
use sqlx::{Executor, PgPool};
use tracing::info;

/// Apply every `.sql` file in `migrations_dir`, ordered by numeric prefix.
///
/// Statements are written to be re-runnable, so the runner keeps no ledger.
pub async fn run_migrations(pool: &PgPool, migrations_dir: &Path) -> Result<()> {
    let entries = migration_files(migrations_dir)?;

    for path in entries {
        execute_migration_file(pool, &path).await?;
        info!("Applied migration: {}", path.display());
    }

    Ok(())
}

/// Ordered list of migration files
pub fn migration_files(migrations_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(migrations_dir)
        .context(format!("Failed to read migrations directory: {:?}", migrations_dir))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == "sql").unwrap_or(false))
        .collect::<Vec<_>>();

    fn order_value(path: &Path) -> usize {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(|name| name.split('_').next())
            .and_then(|prefix| prefix.parse::<usize>().ok())
            .unwrap_or(usize::MAX)
    }

    entries.sort_by(|a, b| order_value(a).cmp(&order_value(b)).then_with(|| a.cmp(b)));
    Ok(entries)
}

async fn execute_migration_file(pool: &PgPool, path: &Path) -> Result<()> {
    let sql = fs::read_to_string(path)?;

    pool.execute(&*sql)
        .await
        .context(format!("Migration {:?} failed", path.file_name()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_are_ordered_by_numeric_prefix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["10_late.sql", "2_second.sql", "1_first.sql", "notes.txt"] {
            fs::write(dir.path().join(name), "SELECT 1;")?;
        }

        let names: Vec<_> = migration_files(dir.path())?
            .into_iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect();
        assert_eq!(names, vec!["1_first.sql", "2_second.sql", "10_late.sql"]);
        Ok(())
    }

    #[test]
    fn bundled_migrations_are_found() -> Result<()> {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("src/db/migrations/sql");
        let files = migration_files(&dir)?;
        assert!(files.len() >= 6);
        assert!(files[0].ends_with("001_enums.sql"));
        Ok(())
    }
}
