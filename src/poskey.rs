/// Positional addressing for flat questionnaire rows.
///
/// A row's place in the hierarchy is `(section1, section2)` where
/// `section2` is either `"N"` (a topic head, N = 1-based topic ordinal
/// within the section) or `"N.M"` (leaf M under topic N).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedKey {
    Head(i64),
    Leaf { topic: i64, item: i64 },
    Malformed,
}

pub fn parse(section2: &str) -> ParsedKey {
    let s = section2.trim();
    match s.split_once('.') {
        None => match s.parse::<i64>() {
            Ok(topic) if topic > 0 => ParsedKey::Head(topic),
            _ => ParsedKey::Malformed,
        },
        Some((t, i)) => match (t.parse::<i64>(), i.parse::<i64>()) {
            (Ok(topic), Ok(item)) if topic > 0 && item > 0 => ParsedKey::Leaf { topic, item },
            _ => ParsedKey::Malformed,
        },
    }
}

pub fn format_head(topic_ordinal: i64) -> String {
    topic_ordinal.to_string()
}

pub fn format_leaf(topic_ordinal: i64, item_ordinal: i64) -> String {
    format!("{}.{}", topic_ordinal, item_ordinal)
}

/// Topic ordinal of a key regardless of its shape, used to group leaves
/// into reporting domains. `None` when the key is not numeric.
pub fn domain_key(section2: &str) -> Option<i64> {
    match parse(section2) {
        ParsedKey::Head(topic) => Some(topic),
        ParsedKey::Leaf { topic, .. } => Some(topic),
        ParsedKey::Malformed => None,
    }
}

/// Numeric ordering key within a section. Heads sort before their own
/// leaves; malformed keys sort last. The store's textual ordering of
/// `section2` would put "1.10" before "1.2", so callers must never rely
/// on it and always order through this key instead.
pub fn sort_key(section2: &str) -> (i64, i64) {
    match parse(section2) {
        ParsedKey::Head(topic) => (topic, 0),
        ParsedKey::Leaf { topic, item } => (topic, item),
        ParsedKey::Malformed => (i64::MAX, i64::MAX),
    }
}
