use crate::poskey::{self, ParsedKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Head,
    Scale,
    Text,
}

impl RowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowKind::Head => "head",
            RowKind::Scale => "scale",
            RowKind::Text => "text",
        }
    }

    pub fn from_str(s: &str) -> Option<RowKind> {
        match s {
            "head" => Some(RowKind::Head),
            "scale" => Some(RowKind::Scale),
            "text" => Some(RowKind::Text),
            _ => None,
        }
    }
}

/// The persisted unit: one positional row of a questionnaire round.
/// Round-level scalars (dates, scale bounds) are denormalized onto rows
/// and read back first-non-null on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatRow {
    pub id: String,
    pub round_id: i64,
    pub section1: i64,
    pub section2: String,
    pub kind: RowKind,
    pub text: String,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Questions,
    Description,
}

impl SectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKind::Questions => "questions",
            SectionKind::Description => "description",
        }
    }

    pub fn from_str(s: &str) -> Option<SectionKind> {
        match s {
            "questions" => Some(SectionKind::Questions),
            "description" => Some(SectionKind::Description),
            _ => None,
        }
    }
}

/// 1:1 per-section metadata record, persisted alongside the flat rows
/// but outside the codec's row stream. The first head record also
/// carries the round-level scalars, so a round whose sections emit no
/// rows still keeps its dates and scale bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionHead {
    pub round_id: i64,
    pub section1: i64,
    pub kind: SectionKind,
    pub title: String,
    pub body: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub max_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeafKind {
    Scale,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafItem {
    #[serde(default)]
    pub id: String,
    pub kind: LeafKind,
    pub text: String,
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub max_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    #[serde(default)]
    pub id: String,
    pub section_ordinal: i64,
    pub topic_ordinal: i64,
    pub text: String,
    pub items: Vec<LeafItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub section1: i64,
    pub kind: SectionKind,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub topics: Vec<Topic>,
}

/// Decoded, in-memory form of one assessment round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundTree {
    pub round_id: i64,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub max_score: Option<f64>,
    pub sections: Vec<Section>,
}

/// Non-fatal decode anomaly. The offending row is dropped from the tree;
/// the rest of the decode always completes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum DecodeDiagnostic {
    MalformedPosition { row_id: String, section2: String },
    OrphanLeaf { row_id: String, section2: String },
}

#[derive(Debug, Clone)]
pub struct Encoded {
    pub rows: Vec<FlatRow>,
    pub heads: Vec<SectionHead>,
}

fn fresh_id(existing: &str) -> String {
    if existing.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        existing.to_string()
    }
}

/// Flatten a round tree into positional rows plus the per-section head
/// records. Ordinals are always recomputed from current array order, so
/// numbering comes out dense and 1-based no matter what the input tree
/// carried.
pub fn encode(tree: &RoundTree) -> Encoded {
    let mut rows: Vec<FlatRow> = Vec::new();
    let mut heads: Vec<SectionHead> = Vec::new();

    for (s_idx, section) in tree.sections.iter().enumerate() {
        let section1 = s_idx as i64 + 1;
        heads.push(SectionHead {
            round_id: tree.round_id,
            section1,
            kind: section.kind,
            title: section.title.clone(),
            body: section.body.clone(),
            start_date: None,
            end_date: None,
            min_score: None,
            max_score: None,
        });

        if section.kind == SectionKind::Description {
            continue;
        }

        for (t_idx, topic) in section.topics.iter().enumerate() {
            let topic_ordinal = t_idx as i64 + 1;
            rows.push(FlatRow {
                id: fresh_id(&topic.id),
                round_id: tree.round_id,
                section1,
                section2: poskey::format_head(topic_ordinal),
                kind: RowKind::Head,
                text: topic.text.clone(),
                min_score: None,
                max_score: None,
                start_date: None,
                end_date: None,
            });

            for (i_idx, item) in topic.items.iter().enumerate() {
                let item_ordinal = i_idx as i64 + 1;
                let is_scale = item.kind == LeafKind::Scale;
                rows.push(FlatRow {
                    id: fresh_id(&item.id),
                    round_id: tree.round_id,
                    section1,
                    section2: poskey::format_leaf(topic_ordinal, item_ordinal),
                    kind: if is_scale { RowKind::Scale } else { RowKind::Text },
                    text: item.text.clone(),
                    min_score: if is_scale { tree.min_score } else { None },
                    max_score: if is_scale { tree.max_score } else { None },
                    start_date: None,
                    end_date: None,
                });
            }
        }
    }

    // The first row carries the round-level dates; decode reads them back
    // first-non-null.
    if let Some(first) = rows.first_mut() {
        first.start_date = tree.start_date.clone();
        first.end_date = tree.end_date.clone();
    }
    // The first head record carries all four round scalars. Heads exist
    // for every section, rows do not, so this is what survives a round
    // with no questions.
    if let Some(first) = heads.first_mut() {
        first.start_date = tree.start_date.clone();
        first.end_date = tree.end_date.clone();
        first.min_score = tree.min_score;
        first.max_score = tree.max_score;
    }

    Encoded { rows, heads }
}

struct TopicBuild {
    section1: i64,
    topic: Topic,
}

/// Rebuild the Section -> Topic -> LeafItem tree from flat rows and the
/// per-section head records.
///
/// Rows are re-sorted numerically by `(section1, topic, item)` before the
/// scan; the store's textual ordering of `section2` is never trusted.
/// Leaves resolve to their topic through the parsed key when possible and
/// otherwise fall back to the most recently seen head in row order (the
/// cursor), carried across section boundaries. Rows that resolve nowhere
/// are dropped with a diagnostic.
pub fn decode(
    round_id: i64,
    rows: &[FlatRow],
    section_heads: &[SectionHead],
) -> (RoundTree, Vec<DecodeDiagnostic>) {
    let mut sorted: Vec<&FlatRow> = rows.iter().collect();
    sorted.sort_by_key(|r| (r.section1, poskey::sort_key(&r.section2)));

    let mut diagnostics: Vec<DecodeDiagnostic> = Vec::new();
    let mut topics: Vec<TopicBuild> = Vec::new();
    let mut topic_index: HashMap<(i64, i64), usize> = HashMap::new();
    let mut cursor: Option<usize> = None;

    let mut start_date: Option<String> = None;
    let mut end_date: Option<String> = None;
    let mut min_score: Option<f64> = None;
    let mut max_score: Option<f64> = None;

    // Head records take precedence for the round scalars; rows fill in
    // whatever the heads left null, first-non-null in positional order.
    for head in section_heads {
        if start_date.is_none() {
            start_date = head.start_date.clone();
        }
        if end_date.is_none() {
            end_date = head.end_date.clone();
        }
        if min_score.is_none() {
            min_score = head.min_score;
        }
        if max_score.is_none() {
            max_score = head.max_score;
        }
    }

    for row in &sorted {
        if start_date.is_none() {
            start_date = row.start_date.clone();
        }
        if end_date.is_none() {
            end_date = row.end_date.clone();
        }
        if min_score.is_none() {
            min_score = row.min_score;
        }
        if max_score.is_none() {
            max_score = row.max_score;
        }

        match row.kind {
            RowKind::Head => {
                // The row's kind, not its key shape, marks it as a head;
                // the topic ordinal is the key's integer part either way.
                let topic_ordinal = match poskey::domain_key(&row.section2) {
                    Some(t) => t,
                    None => {
                        log::warn!(
                            "round {}: head row {} has malformed section2 {:?}, dropped",
                            round_id,
                            row.id,
                            row.section2
                        );
                        diagnostics.push(DecodeDiagnostic::MalformedPosition {
                            row_id: row.id.clone(),
                            section2: row.section2.clone(),
                        });
                        continue;
                    }
                };
                let idx = topics.len();
                topics.push(TopicBuild {
                    section1: row.section1,
                    topic: Topic {
                        id: row.id.clone(),
                        section_ordinal: row.section1,
                        topic_ordinal,
                        text: row.text.clone(),
                        items: Vec::new(),
                    },
                });
                topic_index.entry((row.section1, topic_ordinal)).or_insert(idx);
                cursor = Some(idx);
            }
            RowKind::Scale | RowKind::Text => {
                let parsed = poskey::parse(&row.section2);
                if parsed == ParsedKey::Malformed {
                    log::warn!(
                        "round {}: row {} has malformed section2 {:?}, dropped",
                        round_id,
                        row.id,
                        row.section2
                    );
                    diagnostics.push(DecodeDiagnostic::MalformedPosition {
                        row_id: row.id.clone(),
                        section2: row.section2.clone(),
                    });
                    continue;
                }

                let explicit = match parsed {
                    ParsedKey::Leaf { topic, .. } => {
                        topic_index.get(&(row.section1, topic)).copied()
                    }
                    // A dot-less key on a leaf row is ambiguous; resolution
                    // goes through the cursor, never through the ordinal.
                    _ => None,
                };

                let Some(idx) = explicit.or(cursor) else {
                    log::warn!(
                        "round {}: leaf row {} (section2 {:?}) precedes any head, dropped",
                        round_id,
                        row.id,
                        row.section2
                    );
                    diagnostics.push(DecodeDiagnostic::OrphanLeaf {
                        row_id: row.id.clone(),
                        section2: row.section2.clone(),
                    });
                    continue;
                };

                topics[idx].topic.items.push(LeafItem {
                    id: row.id.clone(),
                    kind: if row.kind == RowKind::Scale {
                        LeafKind::Scale
                    } else {
                        LeafKind::Text
                    },
                    text: row.text.clone(),
                    min_score: row.min_score,
                    max_score: row.max_score,
                });
            }
        }
    }

    // Assemble sections: every recorded head plus any section1 that only
    // appears in the row stream. Sections with no rows at all stay as
    // recorded (Description sections carry no rows by construction).
    let mut section1s: Vec<i64> = section_heads.iter().map(|h| h.section1).collect();
    for tb in &topics {
        if !section1s.contains(&tb.section1) {
            section1s.push(tb.section1);
        }
    }
    section1s.sort_unstable();
    section1s.dedup();

    let head_by_section: HashMap<i64, &SectionHead> =
        section_heads.iter().map(|h| (h.section1, h)).collect();

    let mut sections: Vec<Section> = Vec::new();
    let mut remaining: Vec<Option<TopicBuild>> = topics.into_iter().map(Some).collect();
    for section1 in section1s {
        let mut owned: Vec<Topic> = Vec::new();
        for slot in remaining.iter_mut() {
            if slot.as_ref().map_or(false, |tb| tb.section1 == section1) {
                if let Some(tb) = slot.take() {
                    owned.push(tb.topic);
                }
            }
        }

        match head_by_section.get(&section1) {
            Some(head) => sections.push(Section {
                section1,
                kind: head.kind,
                title: head.title.clone(),
                body: head.body.clone(),
                topics: owned,
            }),
            None => sections.push(Section {
                section1,
                kind: SectionKind::Questions,
                title: String::new(),
                body: None,
                topics: owned,
            }),
        }
    }

    // Leaves attached via the cross-section cursor keep their owning
    // topic's section; nothing else needs fixing up here.
    let tree = RoundTree {
        round_id,
        start_date,
        end_date,
        min_score,
        max_score,
        sections,
    };
    (tree, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scale_leaf(id: &str, text: &str) -> LeafItem {
        LeafItem {
            id: id.to_string(),
            kind: LeafKind::Scale,
            text: text.to_string(),
            min_score: Some(1.0),
            max_score: Some(5.0),
        }
    }

    fn sample_tree() -> RoundTree {
        RoundTree {
            round_id: 25671,
            start_date: Some("2024-06-01".to_string()),
            end_date: Some("2024-07-15".to_string()),
            min_score: Some(1.0),
            max_score: Some(5.0),
            sections: vec![
                Section {
                    section1: 1,
                    kind: SectionKind::Description,
                    title: "คำชี้แจง".to_string(),
                    body: Some("โปรดประเมินตามความเป็นจริง".to_string()),
                    topics: vec![],
                },
                Section {
                    section1: 2,
                    kind: SectionKind::Questions,
                    title: "การสอน".to_string(),
                    body: None,
                    topics: vec![
                        Topic {
                            id: "t1".to_string(),
                            section_ordinal: 2,
                            topic_ordinal: 1,
                            text: "ด้านเนื้อหา".to_string(),
                            items: vec![scale_leaf("q1", "เนื้อหาชัดเจน"), scale_leaf("q2", "เนื้อหาทันสมัย")],
                        },
                        Topic {
                            id: "t2".to_string(),
                            section_ordinal: 2,
                            topic_ordinal: 2,
                            text: "ด้านผู้สอน".to_string(),
                            items: vec![
                                scale_leaf("q3", "ตรงต่อเวลา"),
                                LeafItem {
                                    id: "q4".to_string(),
                                    kind: LeafKind::Text,
                                    text: "ข้อเสนอแนะ".to_string(),
                                    min_score: None,
                                    max_score: None,
                                },
                            ],
                        },
                    ],
                },
            ],
        }
    }

    fn row(
        id: &str,
        section1: i64,
        section2: &str,
        kind: RowKind,
        text: &str,
    ) -> FlatRow {
        FlatRow {
            id: id.to_string(),
            round_id: 25671,
            section1,
            section2: section2.to_string(),
            kind,
            text: text.to_string(),
            min_score: None,
            max_score: None,
            start_date: None,
            end_date: None,
        }
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let tree = sample_tree();
        let encoded = encode(&tree);
        let (decoded, diags) = decode(tree.round_id, &encoded.rows, &encoded.heads);
        assert!(diags.is_empty());
        assert_eq!(decoded, tree);
    }

    #[test]
    fn encode_renumbers_from_array_order() {
        let mut tree = sample_tree();
        // Stale ordinals from a previous edit must not leak into the rows.
        tree.sections[1].topics[0].topic_ordinal = 7;
        let encoded = encode(&tree);
        let keys: Vec<&str> = encoded
            .rows
            .iter()
            .map(|r| r.section2.as_str())
            .collect();
        assert_eq!(keys, vec!["1", "1.1", "1.2", "2", "2.1", "2.2"]);
        assert!(encoded.rows.iter().all(|r| r.section1 == 2));
    }

    #[test]
    fn encode_denormalizes_scale_bounds_onto_scale_rows_only() {
        let encoded = encode(&sample_tree());
        for r in &encoded.rows {
            match r.kind {
                RowKind::Scale => {
                    assert_eq!(r.min_score, Some(1.0));
                    assert_eq!(r.max_score, Some(5.0));
                }
                _ => {
                    assert_eq!(r.min_score, None);
                    assert_eq!(r.max_score, None);
                }
            }
        }
        assert_eq!(encoded.rows[0].start_date.as_deref(), Some("2024-06-01"));
        assert!(encoded.rows[1..].iter().all(|r| r.start_date.is_none()));
    }

    #[test]
    fn decode_reorders_shuffled_rows_numerically() {
        let mut rows = vec![
            row("q22", 1, "2.2", RowKind::Scale, "Q 2.2"),
            row("q1a", 1, "1.10", RowKind::Scale, "Q 1.10"),
            row("t2", 1, "2", RowKind::Head, "Topic two"),
            row("q12", 1, "1.2", RowKind::Scale, "Q 1.2"),
            row("t1", 1, "1", RowKind::Head, "Topic one"),
            row("q21", 1, "2.1", RowKind::Scale, "Q 2.1"),
            row("q11", 1, "1.1", RowKind::Scale, "Q 1.1"),
        ];
        rows.reverse();

        let (tree, diags) = decode(25671, &rows, &[]);
        assert!(diags.is_empty());
        assert_eq!(tree.sections.len(), 1);
        let topics = &tree.sections[0].topics;
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[0].text, "Topic one");
        let t1_texts: Vec<&str> = topics[0].items.iter().map(|i| i.text.as_str()).collect();
        // "1.10" must land after "1.2", not between "1.1" and "1.2".
        assert_eq!(t1_texts, vec!["Q 1.1", "Q 1.2", "Q 1.10"]);
        assert_eq!(topics[1].items.len(), 2);
    }

    #[test]
    fn orphan_leaf_before_any_head_is_dropped_nonfatally() {
        let rows = vec![
            row("stray", 1, "3", RowKind::Scale, "stray"),
            row("t4", 4, "1", RowKind::Head, "late head"),
            row("q41", 4, "1.1", RowKind::Scale, "kept"),
        ];
        let (tree, diags) = decode(25671, &rows, &[]);
        assert_eq!(
            diags,
            vec![DecodeDiagnostic::OrphanLeaf {
                row_id: "stray".to_string(),
                section2: "3".to_string(),
            }]
        );
        let all_items: usize = tree
            .sections
            .iter()
            .flat_map(|s| &s.topics)
            .map(|t| t.items.len())
            .sum();
        assert_eq!(all_items, 1);
    }

    #[test]
    fn dotless_leaf_attaches_to_cursor_head() {
        let rows = vec![
            row("t1", 1, "1", RowKind::Head, "1.)"),
            row("q", 1, "1", RowKind::Scale, "dot-less leaf"),
        ];
        let (tree, diags) = decode(25671, &rows, &[]);
        assert!(diags.is_empty());
        let topic = &tree.sections[0].topics[0];
        assert_eq!(topic.items.len(), 1);
        assert_eq!(topic.items[0].text, "dot-less leaf");
    }

    #[test]
    fn leaf_with_no_matching_topic_falls_back_to_cursor_across_sections() {
        let rows = vec![
            row("t1", 1, "1", RowKind::Head, "only head"),
            row("q", 2, "5.1", RowKind::Scale, "wandering leaf"),
        ];
        let (tree, diags) = decode(25671, &rows, &[]);
        assert!(diags.is_empty());
        assert_eq!(tree.sections[0].topics[0].items.len(), 1);
    }

    #[test]
    fn malformed_section2_drops_single_row_only() {
        let rows = vec![
            row("t1", 1, "1", RowKind::Head, "head"),
            row("bad", 1, "x.y", RowKind::Scale, "bad key"),
            row("q11", 1, "1.1", RowKind::Scale, "good"),
        ];
        let (tree, diags) = decode(25671, &rows, &[]);
        assert_eq!(
            diags,
            vec![DecodeDiagnostic::MalformedPosition {
                row_id: "bad".to_string(),
                section2: "x.y".to_string(),
            }]
        );
        assert_eq!(tree.sections[0].topics[0].items.len(), 1);
    }

    #[test]
    fn round_scalars_come_from_first_non_null_row() {
        let mut r1 = row("t1", 1, "1", RowKind::Head, "head");
        r1.start_date = Some("2024-01-01".to_string());
        let mut r2 = row("q11", 1, "1.1", RowKind::Scale, "q");
        r2.start_date = Some("2099-12-31".to_string());
        r2.min_score = Some(1.0);
        r2.max_score = Some(5.0);
        let mut r3 = row("q12", 1, "1.2", RowKind::Scale, "q");
        r3.min_score = Some(0.0);

        let (tree, _) = decode(25671, &[r1, r2, r3], &[]);
        assert_eq!(tree.start_date.as_deref(), Some("2024-01-01"));
        // Later disagreeing values are ignored without a consistency check.
        assert_eq!(tree.min_score, Some(1.0));
        assert_eq!(tree.max_score, Some(5.0));
    }

    #[test]
    fn description_only_round_keeps_round_scalars() {
        // No section emits rows, so the head record is the only carrier
        // for the dates and scale bounds.
        let tree = RoundTree {
            round_id: 25671,
            start_date: Some("2024-06-01".to_string()),
            end_date: Some("2024-07-15".to_string()),
            min_score: Some(1.0),
            max_score: Some(5.0),
            sections: vec![Section {
                section1: 1,
                kind: SectionKind::Description,
                title: "คำชี้แจง".to_string(),
                body: Some("รอบนี้ไม่มีคำถาม".to_string()),
                topics: vec![],
            }],
        };
        let encoded = encode(&tree);
        assert!(encoded.rows.is_empty());
        assert_eq!(encoded.heads[0].start_date.as_deref(), Some("2024-06-01"));

        let (decoded, diags) = decode(tree.round_id, &encoded.rows, &encoded.heads);
        assert!(diags.is_empty());
        assert_eq!(decoded, tree);
    }

    #[test]
    fn description_only_round_decodes_to_zero_topics() {
        let heads = vec![SectionHead {
            round_id: 25671,
            section1: 1,
            kind: SectionKind::Description,
            title: "คำชี้แจง".to_string(),
            body: Some("รอบนี้ไม่มีคำถาม".to_string()),
            start_date: None,
            end_date: None,
            min_score: None,
            max_score: None,
        }];
        let (tree, diags) = decode(25671, &[], &heads);
        assert!(diags.is_empty());
        assert_eq!(tree.sections.len(), 1);
        assert_eq!(tree.sections[0].kind, SectionKind::Description);
        assert_eq!(tree.sections[0].body.as_deref(), Some("รอบนี้ไม่มีคำถาม"));
        assert!(tree.sections[0].topics.is_empty());
    }
}
