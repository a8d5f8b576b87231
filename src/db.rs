use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("evald.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    // section2 is TEXT on purpose: it holds both "N" and "N.M" shapes.
    // A store that types this column as INTEGER rejects decimal keys with
    // a datatype error; that case is classified by the service layer.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS question_rows(
            id TEXT PRIMARY KEY,
            round_id INTEGER NOT NULL,
            section1 INTEGER NOT NULL,
            section2 TEXT NOT NULL,
            kind TEXT NOT NULL,
            text TEXT NOT NULL,
            min_score REAL,
            max_score REAL,
            start_date TEXT,
            end_date TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_question_rows_round ON question_rows(round_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_question_rows_round_section ON question_rows(round_id, section1)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS section_heads(
            round_id INTEGER NOT NULL,
            section1 INTEGER NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT,
            start_date TEXT,
            end_date TEXT,
            min_score REAL,
            max_score REAL,
            PRIMARY KEY(round_id, section1)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS aggregate_rows(
            round_id INTEGER NOT NULL,
            question_row_id TEXT NOT NULL,
            entity_dim TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            entity_name TEXT NOT NULL,
            parent_entity_id TEXT,
            total_score REAL NOT NULL,
            respondent_count INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_aggregate_rows_round ON aggregate_rows(round_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_aggregate_rows_round_dim ON aggregate_rows(round_id, entity_dim)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS answer_rows(
            id TEXT PRIMARY KEY,
            round_id INTEGER NOT NULL,
            question_row_id TEXT NOT NULL,
            respondent_id TEXT NOT NULL,
            score REAL,
            answer_text TEXT,
            FOREIGN KEY(question_row_id) REFERENCES question_rows(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_answer_rows_round ON answer_rows(round_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_answer_rows_question ON answer_rows(question_row_id)",
        [],
    )?;

    Ok(conn)
}
