use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("gradesum.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            subject_type TEXT NOT NULL DEFAULT 'main',
            max_collected_score REAL NOT NULL DEFAULT 100,
            max_exam_score REAL NOT NULL DEFAULT 100,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            classroom_id TEXT,
            classroom_name TEXT,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_subject_sort ON students(subject_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            title TEXT NOT NULL,
            max_score REAL NOT NULL,
            classroom_id TEXT,
            category TEXT,
            updated_at TEXT,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_subject ON assignments(subject_id)",
        [],
    )?;

    // One record per (assignment, student); an assignment row already carries
    // its title and classroom scope, so this matches the record uniqueness of
    // (student, title, classroom scope).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_records(
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            grade REAL NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(assignment_id, student_id),
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_student ON grade_records(student_id)",
        [],
    )?;

    Ok(conn)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Look up an assignment by its natural key. `classroom_id IS ?` so a NULL
/// scope matches the unscoped row rather than nothing.
pub fn find_assignment_id(
    conn: &Connection,
    subject_id: &str,
    title: &str,
    classroom_id: Option<&str>,
) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM assignments
         WHERE subject_id = ? AND title = ? AND classroom_id IS ?",
        (subject_id, title, classroom_id),
        |r| r.get(0),
    )
    .optional()
}

pub fn subject_exists(conn: &Connection, subject_id: &str) -> rusqlite::Result<bool> {
    let row: Option<i64> = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(row.is_some())
}
