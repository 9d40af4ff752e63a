//! SQLite schema and row-level operations.
//!
//! Functions here take a plain `&Connection` and never open their own
//! transaction; [`crate::SynthesisStore`] wraps them in one.

use rusqlite::{Connection, OptionalExtension, params};
use synthex_core::{Condition, Paper, Precursor, SynthesisExtraction};

use crate::{StoreCounts, StoreError, StoredPaper, StoredSynthesis};

pub const SCHEMA_VERSION: &str = "1";

/// Initialize the database with the required schema.
/// Sets WAL mode and turns on foreign key enforcement for this connection.
pub fn init_database(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS papers (
            id INTEGER PRIMARY KEY,
            stable_identifier TEXT NOT NULL UNIQUE CHECK (length(stable_identifier) > 0),
            title TEXT,
            authors TEXT NOT NULL DEFAULT '[]',
            abstract TEXT,
            ingested_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS syntheses (
            id INTEGER PRIMARY KEY,
            paper_id INTEGER NOT NULL REFERENCES papers(id) ON DELETE CASCADE,
            target_material TEXT NOT NULL CHECK (length(target_material) > 0),
            method_type TEXT NOT NULL CHECK (length(method_type) > 0),
            notes TEXT,
            visual_evidence TEXT
        );

        CREATE TABLE IF NOT EXISTS precursors (
            id INTEGER PRIMARY KEY,
            synthesis_id INTEGER NOT NULL REFERENCES syntheses(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            role TEXT,
            amount TEXT
        );

        CREATE TABLE IF NOT EXISTS conditions (
            id INTEGER PRIMARY KEY,
            synthesis_id INTEGER NOT NULL REFERENCES syntheses(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            parameter_name TEXT NOT NULL,
            value TEXT NOT NULL,
            unit TEXT
        );

        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_syntheses_paper ON syntheses(paper_id);
        CREATE INDEX IF NOT EXISTS idx_precursors_synthesis ON precursors(synthesis_id);
        CREATE INDEX IF NOT EXISTS idx_conditions_synthesis ON conditions(synthesis_id);
        "#,
    )?;

    set_metadata(conn, "schema_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Insert the paper unless its identifier is already known.
/// Returns the row id and whether a row was created.
pub fn insert_paper_if_absent(conn: &Connection, paper: &Paper) -> Result<(i64, bool), StoreError> {
    let authors = serde_json::to_string(&paper.authors)?;
    let inserted = conn
        .prepare_cached(
            "INSERT INTO papers (stable_identifier, title, authors, abstract) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(stable_identifier) DO NOTHING",
        )?
        .execute(params![
            paper.stable_identifier,
            paper.title,
            authors,
            paper.abstract_text
        ])?;

    let id = conn
        .prepare_cached("SELECT id FROM papers WHERE stable_identifier = ?1")?
        .query_row(params![paper.stable_identifier], |row| row.get(0))?;
    Ok((id, inserted > 0))
}

const PAPER_COLUMNS: &str = "id, stable_identifier, title, authors, abstract, ingested_at";

type PaperRow = (i64, String, Option<String>, String, Option<String>, String);

fn paper_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaperRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn stored_paper(row: PaperRow) -> Result<StoredPaper, StoreError> {
    let (id, stable_identifier, title, authors, abstract_text, ingested_at) = row;
    Ok(StoredPaper {
        id: crate::PaperId(id),
        paper: Paper {
            stable_identifier,
            title,
            authors: serde_json::from_str(&authors)?,
            abstract_text,
        },
        ingested_at,
    })
}

pub fn find_paper(conn: &Connection, stable_identifier: &str) -> Result<Option<StoredPaper>, StoreError> {
    let row = conn
        .prepare_cached(&format!(
            "SELECT {} FROM papers WHERE stable_identifier = ?1",
            PAPER_COLUMNS
        ))?
        .query_row(params![stable_identifier], paper_row)
        .optional()?;
    row.map(stored_paper).transpose()
}

/// Every paper in ingestion order.
pub fn list_papers(conn: &Connection) -> Result<Vec<StoredPaper>, StoreError> {
    let rows = conn
        .prepare_cached(&format!("SELECT {} FROM papers ORDER BY id", PAPER_COLUMNS))?
        .query_map([], paper_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(stored_paper).collect()
}

/// Insert one synthesis with its precursors and conditions, in order.
pub fn insert_synthesis(
    conn: &Connection,
    paper_id: i64,
    extraction: &SynthesisExtraction,
) -> Result<i64, StoreError> {
    conn.prepare_cached(
        "INSERT INTO syntheses (paper_id, target_material, method_type, notes, visual_evidence) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?
    .execute(params![
        paper_id,
        extraction.target_material,
        extraction.method_type,
        extraction.notes,
        extraction.visual_evidence
    ])?;
    let synthesis_id = conn.last_insert_rowid();

    {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO precursors (synthesis_id, position, name, role, amount) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (position, p) in extraction.precursors.iter().enumerate() {
            stmt.execute(params![synthesis_id, position as i64, p.name, p.role, p.amount])?;
        }
    }

    {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO conditions (synthesis_id, position, parameter_name, value, unit) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (position, c) in extraction.conditions.iter().enumerate() {
            stmt.execute(params![
                synthesis_id,
                position as i64,
                c.parameter_name,
                c.value,
                c.unit
            ])?;
        }
    }

    Ok(synthesis_id)
}

/// Delete every synthesis of a paper; child rows go with them.
pub fn delete_syntheses(conn: &Connection, paper_id: i64) -> Result<usize, StoreError> {
    Ok(conn.execute("DELETE FROM syntheses WHERE paper_id = ?1", params![paper_id])?)
}

pub fn synthesis_count(conn: &Connection, paper_id: i64) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM syntheses WHERE paper_id = ?1",
        params![paper_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Syntheses of a paper in insertion order, with children in position order.
pub fn load_syntheses(conn: &Connection, paper_id: i64) -> Result<Vec<StoredSynthesis>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, target_material, method_type, notes, visual_evidence \
         FROM syntheses WHERE paper_id = ?1 ORDER BY id",
    )?;
    let heads = stmt
        .query_map(params![paper_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut precursor_stmt = conn.prepare_cached(
        "SELECT name, role, amount FROM precursors WHERE synthesis_id = ?1 ORDER BY position",
    )?;
    let mut condition_stmt = conn.prepare_cached(
        "SELECT parameter_name, value, unit FROM conditions WHERE synthesis_id = ?1 ORDER BY position",
    )?;

    let mut out = Vec::with_capacity(heads.len());
    for (id, target_material, method_type, notes, visual_evidence) in heads {
        let precursors = precursor_stmt
            .query_map(params![id], |row| {
                Ok(Precursor {
                    name: row.get(0)?,
                    role: row.get(1)?,
                    amount: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let conditions = condition_stmt
            .query_map(params![id], |row| {
                Ok(Condition {
                    parameter_name: row.get(0)?,
                    value: row.get(1)?,
                    unit: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        out.push(StoredSynthesis {
            id: crate::SynthesisId(id),
            extraction: SynthesisExtraction {
                target_material,
                method_type,
                precursors,
                conditions,
                notes,
                visual_evidence,
            },
        });
    }
    Ok(out)
}

/// Get a metadata value by key.
pub fn get_metadata(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    let mut stmt = conn.prepare_cached("SELECT value FROM metadata WHERE key = ?1")?;
    Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
}

/// Set a metadata value (upsert).
pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Row counts for every content table.
pub fn get_counts(conn: &Connection) -> Result<StoreCounts, StoreError> {
    let count = |table: &str| -> Result<usize, StoreError> {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(n as usize)
    };
    Ok(StoreCounts {
        papers: count("papers")?,
        syntheses: count("syntheses")?,
        precursors: count("precursors")?,
        conditions: count("conditions")?,
    })
}
