//! 数据库迁移模块
//!
//! 管理 SQLite 数据库的版本迁移，确保数据库结构与应用版本保持一致。
//!
//! ## 迁移策略
//! - 每个迁移在独立事务中执行
//! - 迁移记录存储在 schema_migrations 表中

use rusqlite::Connection;

use crate::storage::{StorageError, StorageResult};

/// 当前数据库 schema 版本
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// 初始化 schema SQL (V1)
const INIT_SCHEMA: &str = include_str!("schema.sql");

/// 迁移记录
#[derive(Debug, Clone)]
pub struct Migration {
    /// 迁移版本号
    pub version: i32,
    /// 迁移名称/描述
    pub name: String,
    /// 迁移 SQL 语句
    pub sql: String,
}

impl Migration {
    /// 创建新的迁移
    pub fn new(version: i32, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// 获取所有迁移定义
///
/// 返回按版本号排序的迁移列表
pub fn get_migrations() -> Vec<Migration> {
    vec![
        // V1: 初始表结构
        Migration::new(1, "初始表结构", INIT_SCHEMA),
        // V2: 添加索引优化
        Migration::new(
            2,
            "添加索引优化",
            r#"
            -- 到期查询：按 next_review_at 升序、card_id 升序稳定排序
            CREATE INDEX IF NOT EXISTS idx_rs_user_due
                ON review_state(user_id, next_review_at, card_id);

            -- 队列按状态 + FIFO 顺序扫描
            CREATE INDEX IF NOT EXISTS idx_aq_status_seq
                ON action_queue(status, seq);

            -- 按幂等键定位队列行
            CREATE INDEX IF NOT EXISTS idx_aq_action_id
                ON action_queue(action_id);
            "#,
        ),
    ]
}

/// 确保迁移表存在
fn ensure_migrations_table(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| StorageError::Migration(format!("创建迁移表失败: {}", e)))?;

    Ok(())
}

/// 获取当前数据库版本
///
/// 返回最高已应用版本号，没有迁移记录时返回 0
pub fn get_current_version(conn: &Connection) -> i32 {
    if ensure_migrations_table(conn).is_err() {
        return 0;
    }

    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// 获取已应用的迁移版本列表
fn get_applied_versions(conn: &Connection) -> StorageResult<Vec<i32>> {
    ensure_migrations_table(conn)?;

    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(versions)
}

/// 记录迁移已应用
fn record_migration(conn: &Connection, migration: &Migration) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            migration.version,
            migration.name,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64
        ],
    )?;

    Ok(())
}

/// 运行数据库迁移
///
/// 检查当前数据库版本并执行必要的迁移脚本。
/// 每个迁移在独立事务中执行，失败时自动回滚该迁移。
///
/// # Returns
/// * `Result<i32, StorageError>` - 成功返回最终版本号
pub fn run_migrations(conn: &Connection) -> Result<i32, StorageError> {
    ensure_migrations_table(conn)?;

    let applied_versions = get_applied_versions(conn)?;
    let migrations = get_migrations();
    let mut final_version = get_current_version(conn);

    log::info!(
        "当前数据库版本: {}, 目标版本: {}",
        final_version,
        CURRENT_SCHEMA_VERSION
    );

    for migration in migrations {
        // 跳过已应用的迁移
        if applied_versions.contains(&migration.version) {
            continue;
        }

        log::info!("运行迁移 v{}: {}", migration.version, migration.name);

        match execute_migration_in_transaction(conn, &migration) {
            Ok(()) => {
                final_version = migration.version;
                log::info!("迁移 v{} 完成", migration.version);
            }
            Err(e) => {
                log::error!("迁移 v{} 失败: {}", migration.version, e);
                return Err(e);
            }
        }
    }

    Ok(final_version)
}

/// 在事务中执行单个迁移
fn execute_migration_in_transaction(conn: &Connection, migration: &Migration) -> StorageResult<()> {
    conn.execute("BEGIN IMMEDIATE", [])?;

    match conn.execute_batch(&migration.sql) {
        Ok(()) => {
            if let Err(e) = record_migration(conn, migration) {
                conn.execute("ROLLBACK", []).ok();
                return Err(e);
            }

            conn.execute("COMMIT", [])?;
            Ok(())
        }
        Err(e) => {
            conn.execute("ROLLBACK", []).ok();
            Err(StorageError::Migration(format!(
                "迁移 v{} 执行失败: {}",
                migration.version, e
            )))
        }
    }
}

/// 获取迁移历史
pub fn get_migration_history(conn: &Connection) -> StorageResult<Vec<MigrationRecord>> {
    ensure_migrations_table(conn)?;

    let mut stmt =
        conn.prepare("SELECT version, name, applied_at FROM schema_migrations ORDER BY version")?;

    let records = stmt
        .query_map([], |row| {
            Ok(MigrationRecord {
                version: row.get(0)?,
                name: row.get(1)?,
                applied_at: row.get(2)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(records)
}

/// 迁移记录
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub version: i32,
    pub name: String,
    pub applied_at: i64,
}

/// 数据库健康检查
pub fn health_check(conn: &Connection) -> StorageResult<DatabaseHealth> {
    let version = get_current_version(conn);

    let tables = ["review_state", "action_queue", "sync_metadata"];

    let mut missing_tables = Vec::new();
    for table in &tables {
        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
                [table],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !exists {
            missing_tables.push(table.to_string());
        }
    }

    // 各表记录数
    let mut table_counts = std::collections::HashMap::new();
    for table in &tables {
        if !missing_tables.contains(&table.to_string()) {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })
                .unwrap_or(0);
            table_counts.insert(table.to_string(), count);
        }
    }

    Ok(DatabaseHealth {
        schema_version: version,
        is_healthy: missing_tables.is_empty() && version == CURRENT_SCHEMA_VERSION,
        missing_tables,
        needs_migration: version < CURRENT_SCHEMA_VERSION,
        table_counts,
    })
}

/// 数据库健康状态
#[derive(Debug)]
pub struct DatabaseHealth {
    pub schema_version: i32,
    pub is_healthy: bool,
    pub missing_tables: Vec<String>,
    pub needs_migration: bool,
    pub table_counts: std::collections::HashMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_test_db() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migration_struct() {
        let migration = Migration::new(1, "测试迁移", "SELECT 1");
        assert_eq!(migration.version, 1);
        assert_eq!(migration.name, "测试迁移");
        assert_eq!(migration.sql, "SELECT 1");
    }

    #[test]
    fn test_get_migrations() {
        let migrations = get_migrations();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, 1);
        assert_eq!(migrations[1].version, 2);
    }

    #[test]
    fn test_initial_migration() {
        let conn = setup_test_db();

        let version = run_migrations(&conn).expect("Migration should succeed");

        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        assert_eq!(get_current_version(&conn), CURRENT_SCHEMA_VERSION);

        let health = health_check(&conn).unwrap();
        assert!(health.is_healthy);
        assert!(health.missing_tables.is_empty());
    }

    #[test]
    fn test_idempotent_migration() {
        let conn = setup_test_db();

        // 多次运行迁移应该是幂等的
        run_migrations(&conn).expect("First migration should succeed");
        run_migrations(&conn).expect("Second migration should succeed");

        let version = get_current_version(&conn);
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migration_history() {
        let conn = setup_test_db();
        run_migrations(&conn).unwrap();

        let history = get_migration_history(&conn).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[0].name, "初始表结构");
        assert!(history[0].applied_at > 0);
    }

    #[test]
    fn test_health_check() {
        let conn = setup_test_db();
        run_migrations(&conn).unwrap();

        let health = health_check(&conn).unwrap();
        assert!(health.is_healthy);
        assert_eq!(health.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(!health.needs_migration);
        assert_eq!(health.table_counts.len(), 3);
    }
}
