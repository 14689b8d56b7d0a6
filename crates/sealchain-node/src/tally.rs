//! Vote counting over the transactions of an entity's chain. Pure
//! application logic: the chain itself never interprets a payload.

use sealchain_core::Block;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

const RANKED_POINTS: [u64; 3] = [3, 2, 1];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TallyKind {
    /// One point to the first choice.
    Single,
    /// One point to every listed choice.
    Multi,
    /// 3, 2 and 1 points to the first three choices.
    Ranked,
}

/// Reads a ballot as either a JSON array of strings or the bracketed text
/// form `"[a, b, c]"`.
pub fn parse_ballot(transaction: &Value) -> Option<Vec<String>> {
    match transaction {
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect(),
        Value::String(text) => {
            let inner = text.trim().trim_start_matches('[').trim_end_matches(']');
            if inner.trim().is_empty() {
                return Some(Vec::new());
            }
            Some(
                inner
                    .split(',')
                    .map(|choice| choice.trim().trim_matches(|c: char| c == '\'' || c == '"').to_string())
                    .collect(),
            )
        }
        _ => None,
    }
}

/// Counts every ballot in every block. Genesis and other empty blocks add
/// nothing; choices that are not candidates are skipped.
pub fn tally(kind: TallyKind, candidates: &[String], blocks: &[Block<Value>]) -> BTreeMap<String, u64> {
    let mut results: BTreeMap<String, u64> =
        candidates.iter().map(|c| (c.clone(), 0)).collect();

    for block in blocks {
        for transaction in &block.transactions {
            let Some(choices) = parse_ballot(transaction) else {
                warn!(block = block.index, "skipping transaction that is not a ballot");
                continue;
            };
            let scored: Vec<(&String, u64)> = match kind {
                TallyKind::Single => choices.iter().take(1).map(|c| (c, 1)).collect(),
                TallyKind::Multi => choices.iter().map(|c| (c, 1)).collect(),
                TallyKind::Ranked => choices.iter().zip(RANKED_POINTS).collect(),
            };
            for (choice, points) in scored {
                match results.get_mut(choice) {
                    Some(count) => *count += points,
                    None => warn!(block = block.index, %choice, "ballot names an unknown candidate"),
                }
            }
        }
    }
    results
}
