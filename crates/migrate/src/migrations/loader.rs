//! Migration Loader - Discovers migration scripts
//!
//! Scripts follow the `V<version>__<description>.sql` naming convention.
//! Discovery is best-effort: a script with a bad name or unreadable content
//! is left out with a warning, and a missing directory yields no migrations.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::definitions::Migration;
use crate::error::{DiscoveryWarning, MigrateError, MigrateResult};

static FILENAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^V(\d+)__([^.]+)\.sql$").expect("migration filename pattern"));

static STATEMENT_TERMINATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r";\s*\r?\n").expect("statement terminator pattern"));

/// Migrations found in a script source, sorted by version
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub migrations: Vec<Migration>,
    /// Scripts left out of `migrations`, and why
    pub warnings: Vec<DiscoveryWarning>,
}

impl Discovery {
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn into_migrations(self) -> Vec<Migration> {
        self.migrations
    }
}

/// Loads migration units from a directory or from named in-memory scripts
#[derive(Debug, Clone, Default)]
pub struct MigrationLoader;

impl MigrationLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load every `*.sql` file in `dir`
    pub fn load_dir(&self, dir: &Path) -> Discovery {
        if !dir.is_dir() {
            warn!("Migrations directory '{}' not found", dir.display());
            return Discovery::default();
        }

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to load migrations from '{}': {}", dir.display(), e);
                return Discovery::default();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.path()),
                Err(e) => {
                    warn!("Failed to read directory entry in '{}': {}", dir.display(), e);
                    None
                }
            })
            .filter(|path| path.is_file())
            .filter(|path| path.extension().map_or(false, |ext| ext == "sql"))
            .collect();
        paths.sort();

        let mut migrations = Vec::new();
        let mut warnings = Vec::new();

        for path in paths {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => {
                    let warning = DiscoveryWarning::InvalidName {
                        name: path.to_string_lossy().into_owned(),
                    };
                    warn!("{}", warning);
                    warnings.push(warning);
                    continue;
                }
            };

            let parsed = parse_script_name(&name).and_then(|(version, description)| {
                let content = fs::read(&path).map_err(|e| DiscoveryWarning::Unreadable {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
                build_migration(&name, version, description, content)
            });

            collect(parsed, &mut migrations, &mut warnings);
        }

        finish(migrations, warnings)
    }

    /// Load already-enumerated scripts given as `(file name, content)` pairs
    pub fn load_sources<I, N, B>(&self, sources: I) -> Discovery
    where
        I: IntoIterator<Item = (N, B)>,
        N: AsRef<str>,
        B: Into<Vec<u8>>,
    {
        let mut migrations = Vec::new();
        let mut warnings = Vec::new();

        for (name, content) in sources {
            let name = name.as_ref();
            let parsed = parse_script_name(name)
                .and_then(|(version, description)| {
                    build_migration(name, version, description, content.into())
                });
            collect(parsed, &mut migrations, &mut warnings);
        }

        finish(migrations, warnings)
    }
}

fn collect(
    parsed: Result<Migration, DiscoveryWarning>,
    migrations: &mut Vec<Migration>,
    warnings: &mut Vec<DiscoveryWarning>,
) {
    match parsed {
        Ok(migration) => migrations.push(migration),
        Err(warning) => {
            match &warning {
                DiscoveryWarning::Unreadable { .. } => error!("{}", warning),
                _ => warn!("{}", warning),
            }
            warnings.push(warning);
        }
    }
}

fn finish(mut migrations: Vec<Migration>, warnings: Vec<DiscoveryWarning>) -> Discovery {
    // Stable: scripts sharing a version keep their enumeration order
    migrations.sort_by_key(Migration::version);

    for pair in migrations.windows(2) {
        if pair[0].version() == pair[1].version() {
            warn!(
                "Duplicate migration version {}: {} and {}",
                pair[0].version(),
                pair[0].script_name(),
                pair[1].script_name()
            );
        }
    }

    info!("Loaded {} migration file(s)", migrations.len());
    Discovery { migrations, warnings }
}

/// Parse `V<version>__<description>.sql` into version and description
pub fn parse_script_name(name: &str) -> Result<(i32, String), DiscoveryWarning> {
    let captures = FILENAME_PATTERN
        .captures(name)
        .ok_or_else(|| DiscoveryWarning::InvalidName { name: name.to_string() })?;

    let digits = &captures[1];
    let version = digits
        .parse::<i32>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| DiscoveryWarning::InvalidVersion {
            name: name.to_string(),
            version: digits.to_string(),
        })?;

    Ok((version, captures[2].replace('_', " ")))
}

fn build_migration(
    name: &str,
    version: i32,
    description: String,
    content: Vec<u8>,
) -> Result<Migration, DiscoveryWarning> {
    let checksum = checksum(&content);
    let sql = String::from_utf8(content).map_err(|e| DiscoveryWarning::Unreadable {
        name: name.to_string(),
        reason: e.to_string(),
    })?;

    debug!("Loaded migration V{} ({}), checksum={}", version, name, checksum);
    Ok(Migration::new(version, description, name, checksum, sql))
}

/// Lowercase hex SHA-256 of `content`
pub fn checksum(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Split a script body into individual statements
///
/// Statements end with `;` followed by a line break. Blank and comment-only
/// pieces are dropped, and a trailing `;` on the last statement is removed.
pub fn split_statements(sql: &str) -> Vec<String> {
    STATEMENT_TERMINATOR
        .split(sql)
        .map(|raw| raw.trim())
        .map(|stmt| stmt.strip_suffix(';').unwrap_or(stmt).trim_end())
        .filter(|stmt| !is_blank_or_comment(stmt))
        .map(str::to_string)
        .collect()
}

fn is_blank_or_comment(stmt: &str) -> bool {
    stmt.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with("--")
    })
}

/// Create the next migration file in `dir` and return its path
///
/// The new version is one above the highest valid version already present.
pub fn create_migration(dir: &Path, description: &str) -> MigrateResult<PathBuf> {
    let slug = description.trim().replace(char::is_whitespace, "_");
    if slug.is_empty() || slug.contains('.') || slug.contains('/') || slug.contains('\\') {
        return Err(MigrateError::Configuration(format!(
            "Invalid migration description '{}'",
            description
        )));
    }

    fs::create_dir_all(dir)?;

    let mut latest = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Ok((version, _)) = parse_script_name(name) {
                latest = latest.max(version);
            }
        }
    }

    let version = latest.checked_add(1).ok_or_else(|| {
        MigrateError::Configuration("Migration version space exhausted".to_string())
    })?;
    let path = dir.join(format!("V{}__{}.sql", version, slug));

    let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    write!(
        file,
        "-- Migration: {}\n-- Created: {}\n\n",
        description.trim(),
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )?;

    Ok(path)
}
