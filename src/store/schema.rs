//! SQL schema for the Host's embedded SQLite database. The kernel is the
//! source of truth for overlay state (§4.7); this database is the source of
//! truth for everything else (§6.4).

use rusqlite::Connection;

use crate::error::Result;

pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS tasks (
            id                          INTEGER PRIMARY KEY,
            batch_id                    INTEGER,
            kind                        TEXT NOT NULL,
            name                        TEXT,
            owner_id                    TEXT NOT NULL,
            created_by_tier             TEXT NOT NULL,
            approval_state              TEXT,
            approver_id                 TEXT,
            approved_at                 TEXT,
            rejection_reason            TEXT,
            command                     TEXT NOT NULL,
            args_json                   TEXT NOT NULL DEFAULT '',
            env_json                    TEXT NOT NULL DEFAULT '',
            resources_json              TEXT NOT NULL DEFAULT '',
            environment_name            TEXT,
            image_ref                   TEXT,
            mounts_json                 TEXT NOT NULL DEFAULT '',
            privileged                  INTEGER NOT NULL DEFAULT 0,
            vps_backend                 TEXT,
            ssh_port                    INTEGER,
            vm_base_image               TEXT,
            vm_disk_size_bytes          INTEGER,
            vm_ip                       TEXT,
            requested_node              TEXT,
            status                      TEXT NOT NULL,
            assigned_node               TEXT,
            assignment_suspicion_count  INTEGER NOT NULL DEFAULT 0,
            required_gpus_json          TEXT NOT NULL DEFAULT '',
            reserved_ip                 TEXT,
            exit_code                   INTEGER,
            error_message               TEXT,
            stdout_path                 TEXT,
            stderr_path                 TEXT,
            submitted_at                TEXT NOT NULL,
            started_at                  TEXT,
            completed_at                TEXT,
            labels_json                 TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_assigned_node ON tasks(assigned_node);
        CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_id);

        CREATE TABLE IF NOT EXISTS nodes (
            hostname         TEXT PRIMARY KEY,
            address          TEXT NOT NULL,
            capacity_json    TEXT NOT NULL,
            last_heartbeat   TEXT NOT NULL,
            liveness         TEXT NOT NULL,
            vm_capable       INTEGER NOT NULL DEFAULT 0,
            runner_version   TEXT NOT NULL DEFAULT '',
            overlay_json     TEXT,
            labels_json      TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS ip_reservation_audit (
            token_id     TEXT PRIMARY KEY,
            ip           TEXT NOT NULL,
            runner_id    INTEGER NOT NULL,
            issued_at    TEXT NOT NULL,
            released_at  TEXT,
            expired_at   TEXT
        );
        "#,
    )?;
    Ok(())
}
