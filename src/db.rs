use crate::score_config;
use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;
use tracing::{debug, info};

pub const DB_FILE_NAME: &str = "scorebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    init_schema(&conn)?;

    // The global default config is created here, once per workspace open,
    // so lookups never have to write.
    let global = score_config::ensure_global_default(&conn)?;
    debug!(
        target: "scorebook::db",
        num_exercises = global.num_exercises,
        formula = %global.formula,
        "global score config ready"
    );
    info!(target: "scorebook::db", db_path = %db_path.display(), "workspace database opened");
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            max_students INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            level TEXT NOT NULL,
            class_id TEXT,
            gender TEXT,
            age INTEGER,
            date_of_birth TEXT,
            contact_number TEXT,
            address TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS score_configs(
            id TEXT PRIMARY KEY,
            year INTEGER,
            semester TEXT,
            category TEXT,
            num_exercises INTEGER NOT NULL DEFAULT 5,
            formula TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    // One row per scope; years start at 1 so 0 is free to stand in for NULL.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_score_configs_scope ON score_configs(
            COALESCE(year, 0),
            COALESCE(semester, ''),
            COALESCE(category, '')
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scores(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            semester TEXT NOT NULL,
            category TEXT NOT NULL,
            exercise_scores TEXT NOT NULL DEFAULT '[]',
            mid_term REAL,
            finals REAL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, year, semester, category)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_scope ON scores(year, semester, category)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_student ON scores(student_id)",
        [],
    )?;

    Ok(())
}
