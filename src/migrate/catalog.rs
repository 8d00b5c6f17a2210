//! Migration file discovery.
//!
//! Migration files are named `<digits>_<description>.sql`. The leading digit
//! run is the file's ordinal key. Files are ordered by file name, compared as
//! strings: this matches numeric order only when every key has the same
//! zero-padded width (`001`, `002`, ..., `010`). Catalogs whose string order
//! disagrees with numeric order are accepted but logged as a warning.

use crate::error::{DbError, DbResult};
use regex::Regex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Matches migration file names and captures the ordinal key.
static SQL_FILE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)_.*\.sql$").expect("valid migration file pattern")
});

/// Embed files from the crate's `sql/` directory as `(file name, contents)` pairs.
macro_rules! embed_sql {
    ($($name:literal),+ $(,)?) => {
        &[$(($name, include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/", $name)))),+]
    };
}

/// The migrations compiled into the binary.
static EMBEDDED: &[(&str, &str)] = embed_sql![
    "001_schema_migrations.sql",
    "002_auth_users.sql",
    "003_forum_communities.sql",
    "004_forum_posts.sql",
    "005_forum_comments.sql",
];

/// One migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    ordinal: i64,
    file_name: Cow<'static, str>,
    sql: Cow<'static, str>,
}

impl MigrationFile {
    pub fn ordinal(&self) -> i64 {
        self.ordinal
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Parse the ordinal key of a migration file name.
///
/// Returns `Ok(None)` for names that are not migration files.
pub fn parse_ordinal(file_name: &str) -> DbResult<Option<i64>> {
    let Some(caps) = SQL_FILE_PATTERN.captures(file_name) else {
        return Ok(None);
    };
    caps[1]
        .parse::<i64>()
        .map(Some)
        .map_err(|_| DbError::malformed_name(file_name))
}

/// Ordered, immutable set of migration files.
#[derive(Debug, Clone)]
pub struct MigrationCatalog {
    files: Vec<MigrationFile>,
}

impl MigrationCatalog {
    /// The catalog compiled into the binary.
    pub fn embedded() -> DbResult<Self> {
        Self::from_sources(
            EMBEDDED
                .iter()
                .map(|(name, sql)| (Cow::Borrowed(*name), Cow::Borrowed(*sql))),
        )
    }

    /// Build a catalog from `(file name, contents)` pairs. Names that do not
    /// look like migration files are skipped.
    pub fn from_sources<I, N, S>(sources: I) -> DbResult<Self>
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<Cow<'static, str>>,
        S: Into<Cow<'static, str>>,
    {
        let mut files = Vec::new();
        for (name, sql) in sources {
            let file_name = name.into();
            match parse_ordinal(&file_name)? {
                Some(ordinal) => files.push(MigrationFile {
                    ordinal,
                    file_name,
                    sql: sql.into(),
                }),
                None => debug!(file = %file_name, "Ignoring non-migration file"),
            }
        }

        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));

        let mut seen: HashMap<i64, &str> = HashMap::with_capacity(files.len());
        for file in &files {
            if let Some(first) = seen.insert(file.ordinal, file.file_name()) {
                return Err(DbError::DuplicateMigrationOrdinal {
                    ordinal: file.ordinal,
                    first: first.to_string(),
                    second: file.file_name().to_string(),
                });
            }
        }

        if let Some(pair) = files.windows(2).find(|w| w[0].ordinal > w[1].ordinal) {
            warn!(
                before = %pair[0].file_name,
                after = %pair[1].file_name,
                "Migration file names do not sort by ordinal; zero-pad the ordinal keys"
            );
        }

        Ok(Self { files })
    }

    /// Load every migration file in `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> DbResult<Self> {
        let mut sources = Vec::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if SQL_FILE_PATTERN.is_match(&name) {
                let sql = std::fs::read_to_string(entry.path())?;
                sources.push((name, sql));
            }
        }
        Self::from_sources(sources)
    }

    pub fn files(&self) -> &[MigrationFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Split into the ledger bootstrap file and the remaining candidates.
    pub fn split_bootstrap(&self) -> DbResult<(&MigrationFile, &[MigrationFile])> {
        self.files.split_first().ok_or(DbError::NoMigrationsFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_ordinal() {
        assert_eq!(parse_ordinal("001_init.sql").unwrap(), Some(1));
        assert_eq!(parse_ordinal("42_answer.sql").unwrap(), Some(42));
        assert_eq!(parse_ordinal("README.md").unwrap(), None);
        assert_eq!(parse_ordinal("init.sql").unwrap(), None);
        assert_eq!(parse_ordinal("001-init.sql").unwrap(), None);
    }

    #[test]
    fn test_parse_ordinal_overflow_is_malformed() {
        let err = parse_ordinal("99999999999999999999_huge.sql").unwrap_err();
        assert!(matches!(err, DbError::MalformedMigrationName { .. }));
        assert!(err.is_startup_fatal());
    }

    #[test]
    fn test_embedded_catalog() {
        let catalog = MigrationCatalog::embedded().unwrap();
        let (bootstrap, rest) = catalog.split_bootstrap().unwrap();
        assert_eq!(bootstrap.file_name(), "001_schema_migrations.sql");
        assert!(bootstrap.sql().contains("IF NOT EXISTS"));
        let ordinals: Vec<i64> = rest.iter().map(MigrationFile::ordinal).collect();
        assert_eq!(ordinals, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_sorted_by_file_name_and_filtered() {
        let catalog = MigrationCatalog::from_sources([
            ("003_c.sql", "SELECT 3"),
            ("notes.txt", "ignored"),
            ("001_a.sql", "SELECT 1"),
            ("002_b.sql", "SELECT 2"),
        ])
        .unwrap();
        let names: Vec<&str> = catalog
            .files()
            .iter()
            .map(MigrationFile::file_name)
            .collect();
        assert_eq!(names, vec!["001_a.sql", "002_b.sql", "003_c.sql"]);
    }

    #[test]
    fn test_order_is_lexicographic_not_numeric() {
        let sources = [("2_b.sql", "SELECT 2"), ("10_c.sql", "SELECT 10")];
        let catalog = MigrationCatalog::from_sources(sources).unwrap();
        let ordinals: Vec<i64> = catalog.files().iter().map(MigrationFile::ordinal).collect();
        assert_eq!(ordinals, vec![10, 2]);
    }

    #[test]
    fn test_duplicate_ordinal_rejected() {
        let sources = [("001_a.sql", ""), ("1_b.sql", "")];
        let err = MigrationCatalog::from_sources(sources).unwrap_err();
        assert!(matches!(
            err,
            DbError::DuplicateMigrationOrdinal { ordinal: 1, .. }
        ));
    }

    #[test]
    fn test_empty_catalog_has_no_bootstrap() {
        let catalog = MigrationCatalog::from_sources(Vec::<(String, String)>::new()).unwrap();
        assert!(catalog.is_empty());
        assert!(matches!(
            catalog.split_bootstrap(),
            Err(DbError::NoMigrationsFound)
        ));
    }

    #[test]
    fn test_from_dir() {
        let dir = TempDir::new().unwrap();
        let widgets = "CREATE TABLE widgets ();";
        fs::write(dir.path().join("002_widgets.sql"), widgets).unwrap();
        fs::write(dir.path().join("001_ledger.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("README.md"), "docs").unwrap();
        fs::create_dir(dir.path().join("003_not_a_file.sql")).unwrap();

        let catalog = MigrationCatalog::from_dir(dir.path()).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.files()[1].sql(), widgets);
    }
}
