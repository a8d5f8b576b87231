use crate::codec::{self, DecodeDiagnostic, RoundTree};
use crate::rollup::{self, EntityDim, EntityStanding, Statistics};
use crate::store::{AggregateFilter, RoundStore, StoreError, StoreErrorKind};
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;

/// Composite round identifier: year concatenated with a term digit,
/// e.g. year 2567 term 1 -> 25671.
pub fn around_id(year: i64, term: i64) -> i64 {
    year * 10 + term
}

#[derive(Debug)]
pub enum RoundError {
    DuplicateRound { round_id: i64 },
    RoundNotFound { round_id: i64 },
    /// Dependent respondent answers exist and the caller did not confirm
    /// clearing them before the structural replace.
    StructuralConflict { round_id: i64, answer_count: i64 },
    /// The store rejected a decimal-shaped `section2` because its column
    /// is typed as integer.
    SchemaTypeMismatch { message: String },
    /// The delete phase of a replace succeeded but the insert phase
    /// failed; the round is now inconsistent and needs a retried save.
    ReplaceIncomplete { round_id: i64, message: String },
    InvalidDate { value: String },
    Store(StoreError),
}

impl RoundError {
    pub fn code(&self) -> &'static str {
        match self {
            RoundError::DuplicateRound { .. } => "duplicate_round",
            RoundError::RoundNotFound { .. } => "not_found",
            RoundError::StructuralConflict { .. } => "structural_conflict",
            RoundError::SchemaTypeMismatch { .. } => "schema_type_mismatch",
            RoundError::ReplaceIncomplete { .. } => "replace_incomplete",
            RoundError::InvalidDate { .. } => "bad_date",
            RoundError::Store(_) => "store_error",
        }
    }
}

impl fmt::Display for RoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundError::DuplicateRound { round_id } => {
                write!(f, "round {} already exists", round_id)
            }
            RoundError::RoundNotFound { round_id } => write!(f, "round {} not found", round_id),
            RoundError::StructuralConflict {
                round_id,
                answer_count,
            } => write!(
                f,
                "round {} has {} dependent answer rows; clear answers first or pass clearAnswers",
                round_id, answer_count
            ),
            RoundError::SchemaTypeMismatch { message } => write!(
                f,
                "store rejected a positional key by column type ({}); section2 must be stored as text",
                message
            ),
            RoundError::ReplaceIncomplete { round_id, message } => write!(
                f,
                "round {} was cleared but reinserting rows failed ({}); the round is inconsistent until saved again",
                round_id, message
            ),
            RoundError::InvalidDate { value } => {
                write!(f, "unparsable round date {:?}, expected YYYY-MM-DD", value)
            }
            RoundError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RoundError {}

impl From<StoreError> for RoundError {
    fn from(e: StoreError) -> Self {
        match e.kind {
            StoreErrorKind::TypeMismatch => RoundError::SchemaTypeMismatch { message: e.message },
            _ => RoundError::Store(e),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedTree {
    pub tree: RoundTree,
    pub diagnostics: Vec<DecodeDiagnostic>,
}

#[derive(Debug, Clone, Default)]
pub struct StatsFilter {
    pub entity_dim: Option<EntityDim>,
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundStatistics {
    #[serde(flatten)]
    pub statistics: Statistics,
    /// Ranking across all entities sharing the selected entity's parent
    /// grouping, with the selected entity flagged. Present only when the
    /// filter names a single entity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_ranking: Option<Vec<EntityStanding>>,
}

fn validate_date(value: &Option<String>) -> Result<(), RoundError> {
    if let Some(v) = value {
        NaiveDate::parse_from_str(v, "%Y-%m-%d").map_err(|_| RoundError::InvalidDate {
            value: v.clone(),
        })?;
    }
    Ok(())
}

/// Thin orchestrator over the row store: every operation fetches a
/// snapshot, runs the pure codec/rollup transforms, and writes back in
/// bulk. No retries here; store failures surface as typed outcomes.
pub struct RoundService<'a> {
    store: &'a dyn RoundStore,
}

impl<'a> RoundService<'a> {
    pub fn new(store: &'a dyn RoundStore) -> Self {
        RoundService { store }
    }

    pub fn load_tree(&self, round_id: i64) -> Result<LoadedTree, RoundError> {
        let rows = self.store.fetch_rows(round_id)?;
        let heads = self.store.fetch_section_heads(round_id)?;
        if rows.is_empty() && heads.is_empty() {
            return Err(RoundError::RoundNotFound { round_id });
        }
        let (tree, diagnostics) = codec::decode(round_id, &rows, &heads);
        Ok(LoadedTree { tree, diagnostics })
    }

    /// Author a new round. Rejects before any write when the id is taken.
    pub fn create(&self, tree: &RoundTree) -> Result<(), RoundError> {
        validate_date(&tree.start_date)?;
        validate_date(&tree.end_date)?;
        if self.store.round_exists(tree.round_id)? {
            return Err(RoundError::DuplicateRound {
                round_id: tree.round_id,
            });
        }
        let encoded = codec::encode(tree);
        self.store.insert_round(&encoded.rows, &encoded.heads)?;
        log::debug!(
            "round {}: created with {} rows, {} sections",
            tree.round_id,
            encoded.rows.len(),
            encoded.heads.len()
        );
        Ok(())
    }

    /// Structural edit: delete-all-then-reinsert. Never a row-by-row
    /// patch. The two phases are not atomic; a failure between them is
    /// surfaced as `ReplaceIncomplete`, never swallowed.
    pub fn replace(&self, tree: &RoundTree, clear_answers: bool) -> Result<(), RoundError> {
        validate_date(&tree.start_date)?;
        validate_date(&tree.end_date)?;
        let round_id = tree.round_id;
        if !self.store.round_exists(round_id)? {
            return Err(RoundError::RoundNotFound { round_id });
        }

        let answers = self.store.answer_count(round_id)?;
        if answers > 0 {
            if !clear_answers {
                return Err(RoundError::StructuralConflict {
                    round_id,
                    answer_count: answers,
                });
            }
            // Irreversible, caller-confirmed.
            self.store.delete_answers(round_id)?;
            log::warn!(
                "round {}: cleared {} dependent answer rows before replace",
                round_id,
                answers
            );
        }

        let encoded = codec::encode(tree);
        if let Err(e) = self.store.delete_round_rows(round_id) {
            if e.kind == StoreErrorKind::ForeignKeyConflict {
                // Answers appeared between the count and the delete.
                let n = self.store.answer_count(round_id).unwrap_or(0);
                return Err(RoundError::StructuralConflict {
                    round_id,
                    answer_count: n,
                });
            }
            return Err(e.into());
        }
        if let Err(e) = self.store.insert_round(&encoded.rows, &encoded.heads) {
            if e.kind == StoreErrorKind::TypeMismatch {
                return Err(RoundError::SchemaTypeMismatch { message: e.message });
            }
            return Err(RoundError::ReplaceIncomplete {
                round_id,
                message: e.message,
            });
        }
        Ok(())
    }

    pub fn delete(&self, round_id: i64, clear_answers: bool) -> Result<(), RoundError> {
        if !self.store.round_exists(round_id)? {
            return Err(RoundError::RoundNotFound { round_id });
        }
        let answers = self.store.answer_count(round_id)?;
        if answers > 0 {
            if !clear_answers {
                return Err(RoundError::StructuralConflict {
                    round_id,
                    answer_count: answers,
                });
            }
            self.store.delete_answers(round_id)?;
        }
        self.store.delete_aggregates(round_id)?;
        self.store.delete_round_rows(round_id)?;
        Ok(())
    }

    pub fn load_statistics(
        &self,
        round_id: i64,
        filter: &StatsFilter,
    ) -> Result<RoundStatistics, RoundError> {
        let loaded = self.load_tree(round_id)?;
        let agg_filter = AggregateFilter {
            entity_dim: filter.entity_dim,
            entity_id: filter.entity_id.clone(),
        };
        let aggregates = self.store.fetch_aggregates(round_id, &agg_filter)?;
        let statistics = rollup::compute_statistics(&loaded.tree, &aggregates);

        let peer_ranking = match (filter.entity_dim, filter.entity_id.as_deref()) {
            (Some(dim), Some(entity_id)) => {
                let parent = self.store.parent_of_entity(round_id, dim, entity_id)?;
                let peers =
                    self.store
                        .fetch_peer_aggregates(round_id, dim, parent.as_deref())?;
                Some(rollup::entity_ranking(&loaded.tree, &peers, Some(entity_id)))
            }
            _ => None,
        };

        Ok(RoundStatistics {
            statistics,
            peer_ranking,
        })
    }
}
