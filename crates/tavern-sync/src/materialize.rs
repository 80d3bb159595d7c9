//! Deterministic CRDT materialization
//!
//! Folds a session's event set into a [`SessionState`]. The fold is a pure
//! function of the event set: topological order with a (lamport, event_id)
//! tie-break, then per-kind merge rules. Two replicas holding the same
//! events always materialize byte-equal state.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tavern_core::dice;
use tavern_core::types::*;
use tracing::warn;
use uuid::Uuid;

/// Order events topologically, ties broken by (lamport ascending, event_id
/// byte-ordinal ascending). Parents absent from the input are tolerated as
/// unknown ancestors and simply don't constrain the order.
pub fn topological_order(events: Vec<EventRecord>) -> Vec<EventRecord> {
    let mut records: HashMap<String, EventRecord> = events
        .into_iter()
        .map(|event| (event.event_id.clone(), event))
        .collect();

    let mut in_degree: HashMap<String, usize> = HashMap::new();
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for (event_id, record) in &records {
        let mut degree = 0;
        for parent in &record.parents {
            if records.contains_key(parent) {
                degree += 1;
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(event_id.clone());
            }
        }
        in_degree.insert(event_id.clone(), degree);
    }

    let mut ready: BinaryHeap<Reverse<(u64, String)>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(event_id, _)| {
            let lamport = records[event_id].lamport_clock;
            Reverse((lamport, event_id.clone()))
        })
        .collect();

    let mut ordered = Vec::with_capacity(records.len());
    while let Some(Reverse((_, event_id))) = ready.pop() {
        for child in children.remove(&event_id).unwrap_or_default() {
            let degree = in_degree.get_mut(&child).expect("child was indexed");
            *degree -= 1;
            if *degree == 0 {
                let lamport = records[&child].lamport_clock;
                ready.push(Reverse((lamport, child)));
            }
        }
        if let Some(record) = records.remove(&event_id) {
            ordered.push(record);
        }
    }

    // Content-addressed ids make cycles impossible, but a defective input
    // must not lose events: drain whatever is left in canonical order.
    if !records.is_empty() {
        warn!(
            remaining = records.len(),
            "topological sort left unreached events, appending by (lamport, id)"
        );
        let mut leftover: Vec<EventRecord> = records.into_values().collect();
        leftover.sort_by(|a, b| {
            a.lamport_clock
                .cmp(&b.lamport_clock)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        ordered.extend(leftover);
    }

    ordered
}

/// Internal LWW cell for flags; `value: None` is a delete that still
/// carries its tie-break coordinates so later lower-versioned writes lose
struct FlagCell {
    value: Option<String>,
    version: u64,
    updated_at: chrono::DateTime<chrono::Utc>,
    event_id: String,
}

/// (version, updated_at, event_id) tie-break shared by presence and flags
fn candidate_wins(
    cand: (u64, chrono::DateTime<chrono::Utc>, &str),
    current: (u64, chrono::DateTime<chrono::Utc>, &str),
) -> bool {
    cand.0
        .cmp(&current.0)
        .then_with(|| cand.1.cmp(&current.1))
        .then_with(|| cand.2.cmp(current.2))
        .is_gt()
}

/// Fold an event set into session state
pub fn materialize(events: Vec<EventRecord>) -> SessionState {
    let ordered = topological_order(events);

    let mut chat: Vec<ChatMessageState> = Vec::new();
    let mut seen_messages: HashSet<Uuid> = HashSet::new();
    let mut presence: HashMap<String, PresenceState> = HashMap::new();
    let mut flags: HashMap<String, FlagCell> = HashMap::new();
    let mut dice_history: Vec<DiceRollState> = Vec::new();

    for record in ordered {
        match &record.body {
            EventBody::ChatMessage(body) => {
                if !seen_messages.insert(body.message_id) {
                    continue;
                }
                let message = ChatMessageState {
                    event_id: record.event_id.clone(),
                    message_id: body.message_id,
                    peer_id: body.peer_id.clone(),
                    device_name: body.device_name.clone(),
                    content: body.content.clone(),
                    created_at: body.created_at,
                };
                let position = body
                    .after_event_id
                    .as_ref()
                    .and_then(|anchor| chat.iter().position(|m| &m.event_id == anchor));
                match position {
                    Some(index) => chat.insert(index + 1, message),
                    None => chat.push(message),
                }
            }
            EventBody::Presence(body) => {
                let replace = presence.get(&body.peer_id).map_or(true, |current| {
                    candidate_wins(
                        (body.version, body.updated_at, record.event_id.as_str()),
                        (
                            current.version,
                            current.updated_at,
                            current.event_id.as_str(),
                        ),
                    )
                });
                if replace {
                    presence.insert(
                        body.peer_id.clone(),
                        PresenceState {
                            peer_id: body.peer_id.clone(),
                            device_name: body.device_name.clone(),
                            is_online: body.is_online,
                            status: body.status.clone(),
                            version: body.version,
                            updated_at: body.updated_at,
                            event_id: record.event_id.clone(),
                        },
                    );
                }
            }
            EventBody::FlagUpdate(body) => {
                let replace = flags.get(&body.key).map_or(true, |current| {
                    candidate_wins(
                        (body.version, body.updated_at, record.event_id.as_str()),
                        (
                            current.version,
                            current.updated_at,
                            current.event_id.as_str(),
                        ),
                    )
                });
                if replace {
                    flags.insert(
                        body.key.clone(),
                        FlagCell {
                            value: body.value.clone(),
                            version: body.version,
                            updated_at: body.updated_at,
                            event_id: record.event_id.clone(),
                        },
                    );
                }
            }
            EventBody::DiceRoll(body) => {
                let signature_valid = dice::verify_roll(body);
                if !signature_valid {
                    warn!(
                        event_id = %record.event_id,
                        roll_id = %body.evidence.roll_id,
                        "dice roll failed signature verification"
                    );
                }
                dice_history.push(DiceRollState {
                    event_id: record.event_id.clone(),
                    evidence: body.evidence.clone(),
                    signature_valid,
                });
            }
        }
    }

    SessionState {
        chat,
        presence: presence.into_iter().collect(),
        flags: flags
            .into_iter()
            .filter_map(|(key, cell)| {
                cell.value.map(|value| {
                    (
                        key.clone(),
                        FlagState {
                            key,
                            value,
                            version: cell.version,
                            updated_at: cell.updated_at,
                            event_id: cell.event_id,
                        },
                    )
                })
            })
            .collect(),
        dice_history,
    }
}
