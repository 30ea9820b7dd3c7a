use sa_domain::message::Message;
use sa_domain::tokens;

/// Result of [`build`]: the possibly-shortened message list plus the token
/// accounting the caller reports back in the `meta` SSE event.
#[derive(Debug, Clone)]
pub struct ContextResult {
    pub messages: Vec<Message>,
    pub used_tokens: u64,
    pub dropped: usize,
}

/// Truncate `history` to fit within `token_budget`.
///
/// Invariants preserved:
/// - the system message, if present, is always kept;
/// - the round containing the most recent `user` message is always kept;
/// - an `assistant` message with tool calls and all of its matching `tool`
///   messages are kept or dropped together (an atomic round);
/// - rounds are dropped oldest-first.
pub fn build(history: &[Message], token_budget: u64) -> ContextResult {
    let system: Vec<Message> = history
        .iter()
        .filter(|m| matches!(m, Message::System { .. }))
        .cloned()
        .collect();
    let rest: Vec<Message> = history
        .iter()
        .filter(|m| !matches!(m, Message::System { .. }))
        .cloned()
        .collect();

    let rounds = group_rounds(&rest);
    let protected_idx = rounds
        .iter()
        .rposition(|round| round.iter().any(|m| matches!(m, Message::User { .. })));

    let system_tokens: u64 = system.iter().map(message_tokens).sum();
    let round_tokens: Vec<u64> = rounds
        .iter()
        .map(|round| round.iter().map(message_tokens).sum())
        .collect();

    let mut total: u64 = system_tokens + round_tokens.iter().sum::<u64>();
    let mut keep = vec![true; rounds.len()];
    let mut dropped = 0usize;

    while total > token_budget {
        let next = (0..rounds.len()).find(|&i| keep[i] && Some(i) != protected_idx);
        match next {
            Some(i) => {
                keep[i] = false;
                total -= round_tokens[i];
                dropped += rounds[i].len();
            }
            None => break,
        }
    }

    let mut messages = system;
    for (i, round) in rounds.into_iter().enumerate() {
        if keep[i] {
            messages.extend(round);
        }
    }

    ContextResult {
        messages,
        used_tokens: total,
        dropped,
    }
}

/// Group a system-free message slice into atomic rounds: a lone message, or
/// an assistant-with-tool-calls message followed by the tool messages whose
/// `tool_call_id` matches one of its calls.
fn group_rounds(msgs: &[Message]) -> Vec<Vec<Message>> {
    let mut rounds = Vec::new();
    let mut i = 0;
    while i < msgs.len() {
        if let Message::Assistant { tool_calls, .. } = &msgs[i] {
            if !tool_calls.is_empty() {
                let ids: std::collections::HashSet<&str> =
                    tool_calls.iter().map(|tc| tc.call_id.as_str()).collect();
                let mut round = vec![msgs[i].clone()];
                let mut j = i + 1;
                while j < msgs.len() {
                    if let Message::Tool { tool_call_id, .. } = &msgs[j] {
                        if ids.contains(tool_call_id.as_str()) {
                            round.push(msgs[j].clone());
                            j += 1;
                            continue;
                        }
                    }
                    break;
                }
                rounds.push(round);
                i = j;
                continue;
            }
        }
        rounds.push(vec![msgs[i].clone()]);
        i += 1;
    }
    rounds
}

fn message_tokens(msg: &Message) -> u64 {
    let mut text = msg.text();
    for tc in msg.tool_calls() {
        text.push_str(&tc.name);
        text.push_str(&tc.args_raw);
    }
    tokens::estimate_message(&text)
}
