use crate::codec::{LeafKind, RoundTree, SectionKind};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityDim {
    Faculty,
    Major,
    Teacher,
}

impl EntityDim {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityDim::Faculty => "faculty",
            EntityDim::Major => "major",
            EntityDim::Teacher => "teacher",
        }
    }

    pub fn from_str(s: &str) -> Option<EntityDim> {
        match s {
            "faculty" => Some(EntityDim::Faculty),
            "major" => Some(EntityDim::Major),
            "teacher" => Some(EntityDim::Teacher),
            _ => None,
        }
    }
}

/// Precomputed partial aggregate for one question and one organizational
/// entity, written by the external recompute job. Each row may represent
/// a different respondent count, which is why every derived statistic is
/// a weighted average over `(total_score, respondent_count)` pairs and
/// never a mean of per-row averages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRow {
    pub question_row_id: String,
    pub entity_dim: EntityDim,
    pub entity_id: String,
    pub entity_name: String,
    #[serde(default)]
    pub parent_entity_id: Option<String>,
    pub total_score: f64,
    pub respondent_count: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Acc {
    sum: f64,
    count: i64,
}

impl Acc {
    fn add(&mut self, total: f64, count: i64) {
        self.sum += total;
        self.count += count;
    }

    fn average(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionStat {
    pub question_id: String,
    pub text: String,
    pub topic_ordinal: i64,
    pub average: f64,
    pub respondent_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainStat {
    pub topic_ordinal: i64,
    pub name: String,
    pub average: f64,
    pub respondent_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityStanding {
    pub entity_id: String,
    pub entity_name: String,
    pub average: f64,
    pub respondent_count: i64,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub questions: Vec<QuestionStat>,
    pub domains: Vec<DomainStat>,
    pub ranking: Vec<EntityStanding>,
    pub strengths: Vec<QuestionStat>,
    pub weaknesses: Vec<QuestionStat>,
    pub overall_average: f64,
    pub total_respondents: i64,
}

struct ScaleLeafRef<'a> {
    id: &'a str,
    text: &'a str,
    topic_ordinal: i64,
}

/// Scale leaves of the tree in display order. Head and Text rows never
/// contribute numerically, and neither do aggregate rows for ids the
/// tree does not know (stale recompute output is tolerated by skipping).
fn scale_leaves(tree: &RoundTree) -> Vec<ScaleLeafRef<'_>> {
    let mut out = Vec::new();
    for section in &tree.sections {
        for topic in &section.topics {
            for item in &topic.items {
                if item.kind == LeafKind::Scale {
                    out.push(ScaleLeafRef {
                        id: item.id.as_str(),
                        text: item.text.as_str(),
                        topic_ordinal: topic.topic_ordinal,
                    });
                }
            }
        }
    }
    out
}

fn sort_descending_stable(stats: &mut [QuestionStat]) {
    stats.sort_by(|a, b| {
        b.average
            .partial_cmp(&a.average)
            .unwrap_or(Ordering::Equal)
    });
}

/// One linear pass over the aggregate rows, guarded by the set of valid
/// Scale leaf ids, accumulating `(sum, count)` per question, per entity
/// and per domain plus one global pair.
pub fn compute_statistics(tree: &RoundTree, aggregates: &[AggregateRow]) -> Statistics {
    let leaves = scale_leaves(tree);
    let domain_of: HashMap<&str, i64> =
        leaves.iter().map(|l| (l.id, l.topic_ordinal)).collect();

    let mut by_question: HashMap<&str, Acc> = HashMap::new();
    let mut by_domain: HashMap<i64, Acc> = HashMap::new();
    let mut global = Acc::default();

    let mut entity_order: Vec<(String, String)> = Vec::new();
    let mut entity_index: HashMap<String, usize> = HashMap::new();
    let mut entity_accs: Vec<Acc> = Vec::new();

    for agg in aggregates {
        let Some(&domain) = domain_of.get(agg.question_row_id.as_str()) else {
            continue;
        };
        by_question
            .entry(agg.question_row_id.as_str())
            .or_default()
            .add(agg.total_score, agg.respondent_count);
        by_domain
            .entry(domain)
            .or_default()
            .add(agg.total_score, agg.respondent_count);
        global.add(agg.total_score, agg.respondent_count);

        let idx = *entity_index.entry(agg.entity_id.clone()).or_insert_with(|| {
            entity_order.push((agg.entity_id.clone(), agg.entity_name.clone()));
            entity_accs.push(Acc::default());
            entity_accs.len() - 1
        });
        entity_accs[idx].add(agg.total_score, agg.respondent_count);
    }

    let questions: Vec<QuestionStat> = leaves
        .iter()
        .map(|l| {
            let acc = by_question.get(l.id).copied().unwrap_or_default();
            QuestionStat {
                question_id: l.id.to_string(),
                text: l.text.to_string(),
                topic_ordinal: l.topic_ordinal,
                average: acc.average(),
                respondent_count: acc.count,
            }
        })
        .collect();

    let domains = domain_stats(tree, &by_domain);

    let mut ranking: Vec<EntityStanding> = entity_order
        .iter()
        .zip(entity_accs.iter())
        .map(|((id, name), acc)| EntityStanding {
            entity_id: id.clone(),
            entity_name: name.clone(),
            average: acc.average(),
            respondent_count: acc.count,
            selected: false,
        })
        .collect();
    // Stable sort: ties keep first-seen order, no secondary key.
    ranking.sort_by(|a, b| {
        b.average
            .partial_cmp(&a.average)
            .unwrap_or(Ordering::Equal)
    });

    let mut ordered = questions.clone();
    sort_descending_stable(&mut ordered);
    let take = ordered.len().min(3);
    let strengths: Vec<QuestionStat> = ordered[..take].to_vec();
    let mut weaknesses: Vec<QuestionStat> = ordered[ordered.len() - take..].to_vec();
    weaknesses.reverse();

    Statistics {
        questions,
        domains,
        ranking,
        strengths,
        weaknesses,
        overall_average: global.average(),
        total_respondents: global.count,
    }
}

/// Domain display name: the Head row's text, falling back to the owning
/// Section's title, falling back to a synthesized Thai label.
fn domain_stats(tree: &RoundTree, by_domain: &HashMap<i64, Acc>) -> Vec<DomainStat> {
    let mut seen: Vec<i64> = Vec::new();
    let mut out: Vec<DomainStat> = Vec::new();
    for section in &tree.sections {
        if section.kind != SectionKind::Questions {
            continue;
        }
        for topic in &section.topics {
            if seen.contains(&topic.topic_ordinal) {
                continue;
            }
            seen.push(topic.topic_ordinal);
            let name = if !topic.text.trim().is_empty() {
                topic.text.clone()
            } else if !section.title.trim().is_empty() {
                section.title.clone()
            } else {
                format!("ด้านที่ {}", topic.topic_ordinal)
            };
            let acc = by_domain
                .get(&topic.topic_ordinal)
                .copied()
                .unwrap_or_default();
            out.push(DomainStat {
                topic_ordinal: topic.topic_ordinal,
                name,
                average: acc.average(),
                respondent_count: acc.count,
            });
        }
    }
    out
}

/// Standalone ranking pass used for peer comparison: same guard, same
/// weighted accumulation, with one entity flagged as selected.
pub fn entity_ranking(
    tree: &RoundTree,
    aggregates: &[AggregateRow],
    selected_entity: Option<&str>,
) -> Vec<EntityStanding> {
    let leaves = scale_leaves(tree);
    let valid: HashSet<&str> = leaves.iter().map(|l| l.id).collect();

    let mut order: Vec<(String, String)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut accs: Vec<Acc> = Vec::new();

    for agg in aggregates {
        if !valid.contains(agg.question_row_id.as_str()) {
            continue;
        }
        let idx = *index.entry(agg.entity_id.clone()).or_insert_with(|| {
            order.push((agg.entity_id.clone(), agg.entity_name.clone()));
            accs.push(Acc::default());
            accs.len() - 1
        });
        accs[idx].add(agg.total_score, agg.respondent_count);
    }

    let mut standings: Vec<EntityStanding> = order
        .iter()
        .zip(accs.iter())
        .map(|((id, name), acc)| EntityStanding {
            entity_id: id.clone(),
            entity_name: name.clone(),
            average: acc.average(),
            respondent_count: acc.count,
            selected: selected_entity == Some(id.as_str()),
        })
        .collect();
    standings.sort_by(|a, b| {
        b.average
            .partial_cmp(&a.average)
            .unwrap_or(Ordering::Equal)
    });
    standings
}
