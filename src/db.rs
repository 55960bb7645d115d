use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("coachd.sqlite3");
    let conn = Connection::open(db_path)?;
    // Another process may share the workspace file; wait out its write lock
    // instead of surfacing SQLITE_BUSY to callers.
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS groups(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            school TEXT,
            grade TEXT,
            owner_id TEXT NOT NULL,
            institution_id TEXT,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_groups_owner ON groups(owner_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS memberships(
            group_id TEXT NOT NULL,
            member_id TEXT NOT NULL,
            active INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY(group_id, member_id),
            FOREIGN KEY(group_id) REFERENCES groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_memberships_member ON memberships(member_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            group_id TEXT,
            date TEXT NOT NULL,
            time_label TEXT,
            subject TEXT NOT NULL,
            completed INTEGER NOT NULL DEFAULT 0,
            notes TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;
    // The one-session-per-group-per-day invariant lives here, not in
    // application code. Sessions without a group are exempt.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_group_date
         ON sessions(group_id, date) WHERE group_id IS NOT NULL",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_owner_date ON sessions(owner_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            session_id TEXT NOT NULL,
            member_id TEXT NOT NULL,
            present INTEGER NOT NULL,
            notes TEXT,
            date TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY(session_id, member_id),
            FOREIGN KEY(session_id) REFERENCES sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_member ON attendance_records(member_id)",
        [],
    )?;

    // session_id and group_id are nullable on purpose: score history outlives
    // both its session and its group (see DESIGN.md).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS score_records(
            id TEXT PRIMARY KEY,
            session_id TEXT,
            group_id TEXT,
            member_id TEXT NOT NULL,
            category_id TEXT NOT NULL,
            score REAL NOT NULL,
            notes TEXT,
            recorded_at INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_records_member_category
         ON score_records(member_id, category_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_records_group ON score_records(group_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_records_category ON score_records(category_id)",
        [],
    )?;

    Ok(conn)
}
