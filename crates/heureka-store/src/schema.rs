use rusqlite::Connection;

use crate::StoreError;

pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS services (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ccrn TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER,
            updated_by INTEGER
        );

        CREATE TABLE IF NOT EXISTS components (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ccrn TEXT NOT NULL UNIQUE,
            component_type TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER,
            updated_by INTEGER
        );

        CREATE TABLE IF NOT EXISTS component_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            component_id INTEGER NOT NULL REFERENCES components(id),
            version TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER,
            updated_by INTEGER,
            UNIQUE (component_id, version)
        );

        CREATE TABLE IF NOT EXISTS component_instances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ccrn TEXT NOT NULL,
            service_id INTEGER NOT NULL REFERENCES services(id),
            component_version_id INTEGER NOT NULL REFERENCES component_versions(id),
            created_at INTEGER NOT NULL,
            deleted_at INTEGER,
            updated_by INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_component_instances_pair
            ON component_instances(service_id, component_version_id);

        CREATE TABLE IF NOT EXISTS issues (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            primary_name TEXT NOT NULL UNIQUE,
            issue_type TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS component_version_issues (
            component_version_id INTEGER NOT NULL REFERENCES component_versions(id),
            issue_id INTEGER NOT NULL REFERENCES issues(id),
            PRIMARY KEY (component_version_id, issue_id)
        );

        CREATE TABLE IF NOT EXISTS issue_matches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            issue_id INTEGER NOT NULL REFERENCES issues(id),
            component_instance_id INTEGER NOT NULL REFERENCES component_instances(id),
            status TEXT NOT NULL DEFAULT 'new',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            deleted_at INTEGER,
            updated_by INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_issue_matches_issue
            ON issue_matches(issue_id);
        CREATE INDEX IF NOT EXISTS idx_issue_matches_instance
            ON issue_matches(component_instance_id);

        CREATE TABLE IF NOT EXISTS scanner_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            tag TEXT NOT NULL,
            start_run INTEGER NOT NULL,
            end_run INTEGER,
            is_completed INTEGER NOT NULL DEFAULT 0,
            failed_message TEXT,
            deleted_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_scanner_runs_tag
            ON scanner_runs(tag, run_id);

        CREATE TABLE IF NOT EXISTS scanner_run_instances (
            run_id INTEGER NOT NULL REFERENCES scanner_runs(run_id),
            component_instance_id INTEGER NOT NULL REFERENCES component_instances(id),
            PRIMARY KEY (run_id, component_instance_id)
        );

        CREATE TABLE IF NOT EXISTS scanner_run_issues (
            run_id INTEGER NOT NULL REFERENCES scanner_runs(run_id),
            issue_id INTEGER NOT NULL REFERENCES issues(id),
            PRIMARY KEY (run_id, issue_id)
        );

        CREATE TABLE IF NOT EXISTS patches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service_id INTEGER NOT NULL REFERENCES services(id),
            service_name TEXT NOT NULL,
            component_version_id INTEGER NOT NULL REFERENCES component_versions(id),
            component_version_name TEXT NOT NULL,
            detected_in_run_id INTEGER NOT NULL REFERENCES scanner_runs(run_id),
            created_at INTEGER NOT NULL,
            UNIQUE (service_id, component_version_id, detected_in_run_id)
        );

        CREATE TABLE IF NOT EXISTS reconcile_checkpoints (
            operation TEXT NOT NULL,
            tag TEXT NOT NULL,
            latest_run_id INTEGER NOT NULL,
            second_latest_run_id INTEGER NOT NULL,
            processed_at INTEGER NOT NULL,
            PRIMARY KEY (operation, tag)
        );
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_repeatable() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        run_migrations(&conn).expect("first migration");
        run_migrations(&conn).expect("second migration");

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'patches'",
                [],
                |row| row.get(0),
            )
            .expect("count patches table");
        assert_eq!(count, 1);
    }
}
