use crate::codec::{FlatRow, RowKind, SectionHead, SectionKind};
use crate::rollup::{AggregateRow, EntityDim};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// The store rejected a value because of its column type, e.g. a
    /// decimal-shaped `section2` against an INTEGER column.
    TypeMismatch,
    /// A referential constraint blocked the write (dependent rows exist).
    ForeignKeyConflict,
    Other,
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        let kind = match &e {
            rusqlite::Error::SqliteFailure(f, _) => {
                if f.code == rusqlite::ErrorCode::TypeMismatch {
                    StoreErrorKind::TypeMismatch
                } else if f.code == rusqlite::ErrorCode::ConstraintViolation
                    && f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
                {
                    StoreErrorKind::ForeignKeyConflict
                } else {
                    StoreErrorKind::Other
                }
            }
            _ => StoreErrorKind::Other,
        };
        StoreError {
            kind,
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSummary {
    pub round_id: i64,
    pub section_count: i64,
    pub question_count: i64,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateFilter {
    pub entity_dim: Option<EntityDim>,
    pub entity_id: Option<String>,
}

/// Per-respondent raw answer. This crate never folds answers into
/// aggregates (that is the external recompute job); it only ingests them
/// and counts/deletes them when a round's structure is replaced.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRow {
    #[serde(default)]
    pub id: String,
    pub question_row_id: String,
    pub respondent_id: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub answer_text: Option<String>,
}

/// Generic row interface over the relational store. The service layer
/// only ever filters by round id (plus entity coordinates for
/// aggregates); replace-all is deliberately split into delete and insert
/// so the non-atomic seam between the two stays visible to callers.
pub trait RoundStore {
    fn list_rounds(&self) -> Result<Vec<RoundSummary>, StoreError>;
    fn round_exists(&self, round_id: i64) -> Result<bool, StoreError>;
    fn fetch_rows(&self, round_id: i64) -> Result<Vec<FlatRow>, StoreError>;
    fn fetch_section_heads(&self, round_id: i64) -> Result<Vec<SectionHead>, StoreError>;
    fn insert_round(&self, rows: &[FlatRow], heads: &[SectionHead]) -> Result<(), StoreError>;
    fn delete_round_rows(&self, round_id: i64) -> Result<(), StoreError>;
    fn answer_count(&self, round_id: i64) -> Result<i64, StoreError>;
    fn delete_answers(&self, round_id: i64) -> Result<(), StoreError>;
    fn insert_answers(&self, round_id: i64, answers: &[AnswerRow]) -> Result<(), StoreError>;
    fn replace_aggregates(
        &self,
        round_id: i64,
        rows: &[AggregateRow],
    ) -> Result<(), StoreError>;
    fn delete_aggregates(&self, round_id: i64) -> Result<(), StoreError>;
    fn fetch_aggregates(
        &self,
        round_id: i64,
        filter: &AggregateFilter,
    ) -> Result<Vec<AggregateRow>, StoreError>;
    fn parent_of_entity(
        &self,
        round_id: i64,
        dim: EntityDim,
        entity_id: &str,
    ) -> Result<Option<String>, StoreError>;
    fn fetch_peer_aggregates(
        &self,
        round_id: i64,
        dim: EntityDim,
        parent: Option<&str>,
    ) -> Result<Vec<AggregateRow>, StoreError>;
}

pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        SqliteStore { conn }
    }

    fn first_scalar<T: rusqlite::types::FromSql>(
        &self,
        round_id: i64,
        column: &str,
    ) -> Result<Option<T>, StoreError> {
        // Heads before rows, first-non-null in positional order within
        // each, matching decode's rule.
        let sql = format!(
            "SELECT {col} FROM section_heads
             WHERE round_id = ? AND {col} IS NOT NULL
             ORDER BY section1 LIMIT 1",
            col = column
        );
        if let Some(v) = self
            .conn
            .query_row(&sql, [round_id], |r| r.get::<_, T>(0))
            .optional()?
        {
            return Ok(Some(v));
        }
        let sql = format!(
            "SELECT {col} FROM question_rows
             WHERE round_id = ? AND {col} IS NOT NULL
             ORDER BY section1, section2 LIMIT 1",
            col = column
        );
        let v = self
            .conn
            .query_row(&sql, [round_id], |r| r.get::<_, T>(0))
            .optional()?;
        Ok(v)
    }

    fn query_aggregates(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Vec<AggregateRow>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), |r| {
                let dim_s: String = r.get(1)?;
                let entity_dim = EntityDim::from_str(&dim_s).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        format!("unknown entity dimension {:?}", dim_s).into(),
                    )
                })?;
                Ok(AggregateRow {
                    question_row_id: r.get(0)?,
                    entity_dim,
                    entity_id: r.get(2)?,
                    entity_name: r.get(3)?,
                    parent_entity_id: r.get(4)?,
                    total_score: r.get(5)?,
                    respondent_count: r.get(6)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
        Ok(rows)
    }
}

const AGGREGATE_COLUMNS: &str = "question_row_id, entity_dim, entity_id, entity_name, \
                                 parent_entity_id, total_score, respondent_count";

impl RoundStore for SqliteStore<'_> {
    fn list_rounds(&self) -> Result<Vec<RoundSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT round_id FROM question_rows
             UNION
             SELECT round_id FROM section_heads
             ORDER BY round_id",
        )?;
        let ids: Vec<i64> = stmt
            .query_map([], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

        let mut out = Vec::with_capacity(ids.len());
        for round_id in ids {
            let section_count: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM section_heads WHERE round_id = ?",
                [round_id],
                |r| r.get(0),
            )?;
            let question_count: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM question_rows WHERE round_id = ? AND kind != 'head'",
                [round_id],
                |r| r.get(0),
            )?;
            out.push(RoundSummary {
                round_id,
                section_count,
                question_count,
                start_date: self.first_scalar(round_id, "start_date")?,
                end_date: self.first_scalar(round_id, "end_date")?,
                min_score: self.first_scalar(round_id, "min_score")?,
                max_score: self.first_scalar(round_id, "max_score")?,
            });
        }
        Ok(out)
    }

    fn round_exists(&self, round_id: i64) -> Result<bool, StoreError> {
        let hit: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM question_rows WHERE round_id = ?
                 UNION
                 SELECT 1 FROM section_heads WHERE round_id = ?
                 LIMIT 1",
                [round_id, round_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    fn fetch_rows(&self, round_id: i64) -> Result<Vec<FlatRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, round_id, section1, section2, kind, text,
                    min_score, max_score, start_date, end_date
             FROM question_rows
             WHERE round_id = ?
             ORDER BY section1, section2",
        )?;
        let rows = stmt
            .query_map([round_id], |r| {
                let kind_s: String = r.get(4)?;
                let kind = RowKind::from_str(&kind_s).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        4,
                        rusqlite::types::Type::Text,
                        format!("unknown row kind {:?}", kind_s).into(),
                    )
                })?;
                Ok(FlatRow {
                    id: r.get(0)?,
                    round_id: r.get(1)?,
                    section1: r.get(2)?,
                    section2: r.get(3)?,
                    kind,
                    text: r.get(5)?,
                    min_score: r.get(6)?,
                    max_score: r.get(7)?,
                    start_date: r.get(8)?,
                    end_date: r.get(9)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
        Ok(rows)
    }

    fn fetch_section_heads(&self, round_id: i64) -> Result<Vec<SectionHead>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT round_id, section1, kind, title, body,
                    start_date, end_date, min_score, max_score
             FROM section_heads
             WHERE round_id = ?
             ORDER BY section1",
        )?;
        let heads = stmt
            .query_map([round_id], |r| {
                let kind_s: String = r.get(2)?;
                let kind = SectionKind::from_str(&kind_s).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        format!("unknown section kind {:?}", kind_s).into(),
                    )
                })?;
                Ok(SectionHead {
                    round_id: r.get(0)?,
                    section1: r.get(1)?,
                    kind,
                    title: r.get(3)?,
                    body: r.get(4)?,
                    start_date: r.get(5)?,
                    end_date: r.get(6)?,
                    min_score: r.get(7)?,
                    max_score: r.get(8)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
        Ok(heads)
    }

    fn insert_round(&self, rows: &[FlatRow], heads: &[SectionHead]) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        for h in heads {
            tx.execute(
                "INSERT INTO section_heads(round_id, section1, kind, title, body,
                                           start_date, end_date, min_score, max_score)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    h.round_id,
                    h.section1,
                    h.kind.as_str(),
                    &h.title,
                    &h.body,
                    &h.start_date,
                    &h.end_date,
                    h.min_score,
                    h.max_score,
                ),
            )?;
        }
        for row in rows {
            tx.execute(
                "INSERT INTO question_rows(id, round_id, section1, section2, kind, text,
                                           min_score, max_score, start_date, end_date)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &row.id,
                    row.round_id,
                    row.section1,
                    &row.section2,
                    row.kind.as_str(),
                    &row.text,
                    row.min_score,
                    row.max_score,
                    &row.start_date,
                    &row.end_date,
                ),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_round_rows(&self, round_id: i64) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM question_rows WHERE round_id = ?", [round_id])?;
        tx.execute("DELETE FROM section_heads WHERE round_id = ?", [round_id])?;
        tx.commit()?;
        Ok(())
    }

    fn answer_count(&self, round_id: i64) -> Result<i64, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM answer_rows WHERE round_id = ?",
            [round_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    fn delete_answers(&self, round_id: i64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM answer_rows WHERE round_id = ?", [round_id])?;
        Ok(())
    }

    fn insert_answers(&self, round_id: i64, answers: &[AnswerRow]) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        for a in answers {
            let id = if a.id.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                a.id.clone()
            };
            tx.execute(
                "INSERT INTO answer_rows(id, round_id, question_row_id, respondent_id,
                                         score, answer_text)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (
                    &id,
                    round_id,
                    &a.question_row_id,
                    &a.respondent_id,
                    a.score,
                    &a.answer_text,
                ),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn replace_aggregates(&self, round_id: i64, rows: &[AggregateRow]) -> Result<(), StoreError> {
        // Wholesale replacement: this is the only way aggregate rows ever
        // change, mirroring the recompute job's contract.
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM aggregate_rows WHERE round_id = ?", [round_id])?;
        for a in rows {
            tx.execute(
                "INSERT INTO aggregate_rows(round_id, question_row_id, entity_dim, entity_id,
                                            entity_name, parent_entity_id, total_score,
                                            respondent_count)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    round_id,
                    &a.question_row_id,
                    a.entity_dim.as_str(),
                    &a.entity_id,
                    &a.entity_name,
                    &a.parent_entity_id,
                    a.total_score,
                    a.respondent_count,
                ),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_aggregates(&self, round_id: i64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM aggregate_rows WHERE round_id = ?", [round_id])?;
        Ok(())
    }

    fn fetch_aggregates(
        &self,
        round_id: i64,
        filter: &AggregateFilter,
    ) -> Result<Vec<AggregateRow>, StoreError> {
        let mut sql = format!(
            "SELECT {} FROM aggregate_rows WHERE round_id = ?",
            AGGREGATE_COLUMNS
        );
        let mut params: Vec<Value> = vec![Value::Integer(round_id)];
        if let Some(dim) = filter.entity_dim {
            sql.push_str(" AND entity_dim = ?");
            params.push(Value::Text(dim.as_str().to_string()));
        }
        if let Some(id) = &filter.entity_id {
            sql.push_str(" AND entity_id = ?");
            params.push(Value::Text(id.clone()));
        }
        sql.push_str(" ORDER BY rowid");
        self.query_aggregates(&sql, params)
    }

    fn parent_of_entity(
        &self,
        round_id: i64,
        dim: EntityDim,
        entity_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let parent: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT parent_entity_id FROM aggregate_rows
                 WHERE round_id = ? AND entity_dim = ? AND entity_id = ?
                 LIMIT 1",
                (round_id, dim.as_str(), entity_id),
                |r| r.get(0),
            )
            .optional()?;
        Ok(parent.flatten())
    }

    fn fetch_peer_aggregates(
        &self,
        round_id: i64,
        dim: EntityDim,
        parent: Option<&str>,
    ) -> Result<Vec<AggregateRow>, StoreError> {
        let mut sql = format!(
            "SELECT {} FROM aggregate_rows WHERE round_id = ? AND entity_dim = ?",
            AGGREGATE_COLUMNS
        );
        let mut params: Vec<Value> = vec![
            Value::Integer(round_id),
            Value::Text(dim.as_str().to_string()),
        ];
        if let Some(p) = parent {
            sql.push_str(" AND parent_entity_id = ?");
            params.push(Value::Text(p.to_string()));
        }
        sql.push_str(" ORDER BY rowid");
        self.query_aggregates(&sql, params)
    }
}
