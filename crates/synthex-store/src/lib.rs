//! SQLite persistence for extracted synthesis protocols.
//!
//! One [`SynthesisStore`] owns one connection. Every write that touches more
//! than one row runs in a single transaction, so a synthesis is either stored
//! with all of its precursors and conditions or not at all. Papers are
//! deduplicated by `stable_identifier` through a UNIQUE constraint rather than
//! a check-then-insert.

mod db;

use std::path::{Path, PathBuf};

use rusqlite::{Connection, ErrorCode};
use synthex_core::{Paper, SynthesisExtraction};
use thiserror::Error;

pub use db::SCHEMA_VERSION;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(rusqlite::Error),
    /// A constraint rejected the write (unknown paper, empty key, ...).
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
                StoreError::Integrity(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => StoreError::Database(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaperId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SynthesisId(pub i64);

/// A paper row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPaper {
    pub id: PaperId,
    pub paper: Paper,
    /// UTC timestamp of the first successful extraction.
    pub ingested_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSynthesis {
    pub id: SynthesisId,
    pub extraction: SynthesisExtraction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub papers: usize,
    pub syntheses: usize,
    pub precursors: usize,
    pub conditions: usize,
}

/// Result of [`SynthesisStore::persist`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Persisted {
    pub paper_id: PaperId,
    pub synthesis_id: SynthesisId,
    /// False if the paper row already existed.
    pub new_paper: bool,
}

pub struct SynthesisStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SynthesisStore {
    /// Open (or create) the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        db::init_database(&conn)?;
        tracing::info!(path = %path.display(), "opened synthesis store");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        db::init_database(&conn)?;
        Ok(Self { conn, path: None })
    }

    /// On-disk location, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert the paper if unseen; otherwise return the existing id and
    /// leave the stored row untouched.
    pub fn upsert_paper(&self, paper: &Paper) -> Result<PaperId, StoreError> {
        let (id, inserted) = db::insert_paper_if_absent(&self.conn, paper)?;
        if inserted {
            tracing::debug!(paper = %paper.stable_identifier, id, "paper inserted");
        }
        Ok(PaperId(id))
    }

    /// Store one synthesis for an existing paper, atomically.
    pub fn insert_synthesis(
        &self,
        paper_id: PaperId,
        extraction: &SynthesisExtraction,
    ) -> Result<SynthesisId, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let id = db::insert_synthesis(&tx, paper_id.0, extraction)?;
        tx.commit()?;
        tracing::debug!(
            paper_id = paper_id.0,
            synthesis_id = id,
            precursors = extraction.precursors.len(),
            conditions = extraction.conditions.len(),
            "synthesis stored"
        );
        Ok(SynthesisId(id))
    }

    /// Upsert the paper and insert the synthesis in one transaction.
    pub fn persist(
        &self,
        paper: &Paper,
        extraction: &SynthesisExtraction,
    ) -> Result<Persisted, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let (paper_id, new_paper) = db::insert_paper_if_absent(&tx, paper)?;
        let synthesis_id = db::insert_synthesis(&tx, paper_id, extraction)?;
        tx.commit()?;

        tracing::info!(
            paper = %paper.stable_identifier,
            target = %extraction.target_material,
            new_paper,
            "synthesis persisted"
        );
        Ok(Persisted {
            paper_id: PaperId(paper_id),
            synthesis_id: SynthesisId(synthesis_id),
            new_paper,
        })
    }

    /// Replace every synthesis of a paper with `extraction`, atomically.
    pub fn replace_syntheses(
        &self,
        paper_id: PaperId,
        extraction: &SynthesisExtraction,
    ) -> Result<SynthesisId, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let removed = db::delete_syntheses(&tx, paper_id.0)?;
        let id = db::insert_synthesis(&tx, paper_id.0, extraction)?;
        tx.commit()?;
        tracing::info!(paper_id = paper_id.0, removed, "syntheses replaced");
        Ok(SynthesisId(id))
    }

    pub fn find_paper(&self, stable_identifier: &str) -> Result<Option<StoredPaper>, StoreError> {
        db::find_paper(&self.conn, stable_identifier)
    }

    /// Every stored paper, oldest first.
    pub fn papers(&self) -> Result<Vec<StoredPaper>, StoreError> {
        db::list_papers(&self.conn)
    }

    pub fn synthesis_count_for(&self, paper_id: PaperId) -> Result<usize, StoreError> {
        db::synthesis_count(&self.conn, paper_id.0)
    }

    pub fn load_syntheses(&self, paper_id: PaperId) -> Result<Vec<StoredSynthesis>, StoreError> {
        db::load_syntheses(&self.conn, paper_id.0)
    }

    pub fn counts(&self) -> Result<StoreCounts, StoreError> {
        db::get_counts(&self.conn)
    }
}
