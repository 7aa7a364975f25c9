//! Storage locators.
//!
//! A locator names the backing store, in the familiar SQLAlchemy-like form:
//!
//! - `sqlite:///relative/path.db`
//! - `sqlite:////absolute/path.db`
//! - `sqlite:///:memory:` (or plain `sqlite://`)
//!
//! The literal `{SCHEMA_VERSION}` anywhere in the locator is replaced by the
//! head schema version number, so one locator can keep stores of different
//! schema generations apart.

use crate::error::{Error, Result};
use crate::storage::migrations::HEAD_SCHEMA_VERSION;
use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// A parsed storage locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUrl {
    /// A database file on disk.
    File(PathBuf),
    /// A private in-memory database.
    ///
    /// Backed by a uniquely named shared-cache URI so that several
    /// connections of this process (e.g. the heartbeat recorder) reach the
    /// same database. It lives as long as one connection stays open.
    Memory(String),
}

impl StorageUrl {
    /// Parse a locator string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] for a malformed locator or a scheme
    /// without an available driver.
    pub fn parse(locator: &str) -> Result<Self> {
        let locator = locator
            .trim()
            .replace("{SCHEMA_VERSION}", &HEAD_SCHEMA_VERSION.to_string());

        let Some((scheme, rest)) = locator.split_once("://") else {
            return Err(Error::Connection(format!(
                "malformed storage locator '{locator}': expected <scheme>://<location>"
            )));
        };

        // Dialect+driver forms such as "sqlite+pysqlite" select the dialect.
        let dialect = scheme.split('+').next().unwrap_or_default();
        if dialect.is_empty() {
            return Err(Error::Connection(format!(
                "malformed storage locator '{locator}': missing scheme"
            )));
        }
        if !dialect.eq_ignore_ascii_case("sqlite") {
            return Err(Error::Connection(format!(
                "no driver available for '{dialect}' storage; only sqlite is supported"
            )));
        }

        let path = match rest {
            "" => "",
            _ => rest.strip_prefix('/').ok_or_else(|| {
                Error::Connection(format!(
                    "malformed storage locator '{locator}': host names are not supported for sqlite"
                ))
            })?,
        };

        if path.is_empty() || path == ":memory:" {
            Ok(Self::memory())
        } else {
            Ok(Self::File(PathBuf::from(path)))
        }
    }

    /// A fresh, uniquely named in-memory store.
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(format!("trialstore-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Locator for a database file.
    #[must_use]
    pub fn file(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }

    /// Whether this locator points at an in-memory store.
    #[must_use]
    pub const fn is_memory(&self) -> bool {
        matches!(self, Self::Memory(_))
    }

    /// Open a new connection to the store.
    ///
    /// Every connection gets the same per-connection pragmas: foreign keys
    /// on, the given busy timeout, and NORMAL sync.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the database cannot be opened.
    pub fn connect(&self, busy_timeout: Duration) -> Result<Connection> {
        let conn = match self {
            Self::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        Error::Connection(format!(
                            "failed to create database directory {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
                Connection::open(path)
            }
            Self::Memory(name) => Connection::open_with_flags(
                format!("file:{name}?mode=memory&cache=shared"),
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
        }
        .map_err(|e| Error::Connection(format!("failed to open {self}: {e}")))?;

        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }
}

impl FromStr for StorageUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for StorageUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "sqlite:///{}", path.display()),
            Self::Memory(_) => f.write_str("sqlite:///:memory:"),
        }
    }
}
