//! Throwaway SQLite databases for tests

use rust_equities::DatabaseManagerSqlx;
use tempfile::TempDir;

/// A database file that lives as long as this value
pub struct TestDatabase {
    pub manager: DatabaseManagerSqlx,
    pub path: String,
    _dir: TempDir,
}

impl std::ops::Deref for TestDatabase {
    type Target = DatabaseManagerSqlx;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}

/// Initialize a completely fresh test database in its own temp directory
pub async fn init_fresh_test_database() -> TestDatabase {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("test.db").to_string_lossy().to_string();
    let manager = DatabaseManagerSqlx::new(&path)
        .await
        .expect("Failed to create test database");

    TestDatabase {
        manager,
        path,
        _dir: dir,
    }
}
