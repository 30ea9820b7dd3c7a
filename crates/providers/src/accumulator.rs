//! `ToolCallAccumulator` (§3, §4.3): per-turn transient state assembling
//! streamed tool-call fragments into complete calls. Used by the OpenAI-
//! compat parser; the keying rule here is the single source of truth so the
//! "exactly one unindexed entry" heuristic is applied consistently.

use std::collections::HashMap;

use sa_domain::tool::ToolCall;

#[derive(Debug, Default, Clone)]
struct Entry {
    call_id: Option<String>,
    name: String,
    args_raw: String,
}

/// Keyed by `index -> call` plus an `id -> index` side table and a set of
/// unindexed keys, exactly as specified.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    by_key: HashMap<String, Entry>,
    id_to_key: HashMap<String, String>,
    unindexed_keys: Vec<String>,
    anon_counter: u64,
    /// Preserves first-seen order for deterministic output.
    key_order: Vec<String>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the accumulator key for one incoming delta, per the exact
    /// tie-break policy in §4.3.
    fn resolve_key(&mut self, index: Option<u64>, id: Option<&str>) -> String {
        if let Some(idx) = index {
            let idx_key = format!("i:{idx}");
            if self.by_key.contains_key(&idx_key) {
                return idx_key;
            }
            if let Some(id) = id {
                if let Some(existing) = self.id_to_key.get(id) {
                    return existing.clone();
                }
            }
            return idx_key;
        }

        if id.is_none() {
            if self.unindexed_keys.len() == 1 {
                return self.unindexed_keys[0].clone();
            }
        }

        if let Some(id) = id {
            let id_key = format!("id:{id}");
            self.unindexed_keys.push(id_key.clone());
            return id_key;
        }

        let key = format!("anon:{}:{}", self.anon_counter, self.key_order.len());
        self.anon_counter += 1;
        self.unindexed_keys.push(key.clone());
        key
    }

    /// Merge one incoming fragment: `name` (non-empty wins), `args` merged
    /// using the same cumulative-or-append rule as assistant text.
    pub fn merge(
        &mut self,
        index: Option<u64>,
        id: Option<&str>,
        name: Option<&str>,
        args_fragment: Option<&str>,
    ) {
        let key = self.resolve_key(index, id);
        if !self.by_key.contains_key(&key) {
            self.key_order.push(key.clone());
        }
        let entry = self.by_key.entry(key.clone()).or_default();
        if let Some(id) = id {
            entry.call_id = Some(id.to_string());
            self.id_to_key.insert(id.to_string(), key);
        }
        if let Some(name) = name {
            if !name.is_empty() {
                entry.name = name.to_string();
            }
        }
        if let Some(fragment) = args_fragment {
            entry.args_raw = merge_text(&entry.args_raw, fragment);
        }
    }

    /// Finalize into an ordered list of `ToolCall`s. Entries with no `call_id`
    /// fall back to their accumulator key so downstream code always has a
    /// stable identifier.
    pub fn finish(self) -> Vec<ToolCall> {
        self.key_order
            .into_iter()
            .filter_map(|key| {
                let entry = self.by_key.get(&key)?;
                let args_raw = if entry.args_raw.is_empty() {
                    "{}".to_string()
                } else {
                    entry.args_raw.clone()
                };
                Some(ToolCall {
                    call_id: entry.call_id.clone().unwrap_or_else(|| key.clone()),
                    index: key.strip_prefix("i:").and_then(|s| s.parse().ok()),
                    name: entry.name.clone(),
                    args_raw,
                })
            })
            .collect()
    }
}

/// Cumulative-vs-delta merge (§4.3, §4.4): if `next` is a strict
/// prefix-extended superset of `prev`, only the new suffix is appended;
/// otherwise `next` is appended verbatim.
pub fn merge_text(prev: &str, next: &str) -> String {
    if !prev.is_empty() && next.starts_with(prev) && next.len() > prev.len() {
        let mut merged = prev.to_string();
        merged.push_str(&next[prev.len()..]);
        merged
    } else {
        let mut merged = prev.to_string();
        merged.push_str(next);
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_deltas_accumulate_by_index() {
        let mut acc = ToolCallAccumulator::new();
        acc.merge(Some(0), Some("call_1"), Some("exec"), Some("{\"cmd"));
        acc.merge(Some(0), None, None, Some("\":\"ls\"}"));
        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args_raw, "{\"cmd\":\"ls\"}");
        assert_eq!(calls[0].call_id, "call_1");
    }

    #[test]
    fn single_unindexed_entry_heuristic_binds() {
        let mut acc = ToolCallAccumulator::new();
        acc.merge(None, Some("call_1"), Some("exec"), Some("{}"));
        // A later delta with neither index nor id binds to the lone entry.
        acc.merge(None, None, None, Some("extra"));
        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args_raw, "{}extra");
    }

    #[test]
    fn second_concurrent_unindexed_delta_falls_to_anon_key() {
        let mut acc = ToolCallAccumulator::new();
        acc.merge(None, Some("call_1"), Some("a"), Some("{}"));
        acc.merge(None, Some("call_2"), Some("b"), Some("{}"));
        // Now there are two unindexed entries; an id-less, index-less delta
        // does not guess which one it belongs to.
        acc.merge(None, None, None, Some("stray"));
        let calls = acc.finish();
        assert_eq!(calls.len(), 3);
    }

    #[test]
    fn name_non_empty_wins() {
        let mut acc = ToolCallAccumulator::new();
        acc.merge(Some(0), Some("c1"), Some(""), None);
        acc.merge(Some(0), None, Some("exec"), None);
        let calls = acc.finish();
        assert_eq!(calls[0].name, "exec");
    }

    #[test]
    fn merge_text_cumulative_suffix_only() {
        assert_eq!(merge_text("ab", "abcd"), "abcd");
    }

    #[test]
    fn merge_text_non_prefix_appends() {
        assert_eq!(merge_text("ab", "xy"), "abxy");
    }
}
