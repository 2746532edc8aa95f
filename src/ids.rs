//! Snowflake-style id generation for tasks.
//!
//! Ids are time-ordered and unique across the cluster without requiring a
//! shared counter: the top bits are a millisecond timestamp relative to a
//! fixed epoch, followed by a node discriminator and a per-millisecond
//! sequence number that wraps and waits for the clock to advance.

use std::sync::Mutex;

use chrono::Utc;

/// 2024-01-01T00:00:00Z in milliseconds since the Unix epoch.
const EPOCH_MS: i64 = 1_704_067_200_000;

const SEQUENCE_BITS: u32 = 12;
const NODE_BITS: u32 = 10;
const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;
const MAX_NODE_ID: i64 = (1 << NODE_BITS) - 1;

struct GeneratorState {
    last_ms: i64,
    sequence: i64,
}

/// Generates monotonic, globally-unique 64-bit task ids.
pub struct IdGenerator {
    node_id: i64,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    /// `node_id` discriminates generators across processes (e.g. the Host
    /// always uses 0; nothing else in this codebase mints task ids).
    pub fn new(node_id: i64) -> Self {
        assert!(
            (0..=MAX_NODE_ID).contains(&node_id),
            "node_id out of range"
        );
        Self {
            node_id,
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn next_id(&self) -> i64 {
        let mut now = current_millis();
        let mut guard = self.state.lock().unwrap();

        if now == guard.last_ms {
            guard.sequence = (guard.sequence + 1) & MAX_SEQUENCE;
            if guard.sequence == 0 {
                // Sequence exhausted within this millisecond; spin until the clock ticks.
                while now <= guard.last_ms {
                    now = current_millis();
                }
            }
        } else {
            guard.sequence = 0;
        }
        guard.last_ms = now;

        let ts = (now - EPOCH_MS).max(0);
        (ts << (NODE_BITS + SEQUENCE_BITS)) | (self.node_id << SEQUENCE_BITS) | guard.sequence
    }
}

fn current_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let gen = IdGenerator::new(1);
        let mut seen = HashSet::new();
        let mut prev = 0i64;
        for _ in 0..5000 {
            let id = gen.next_id();
            assert!(id > prev);
            assert!(seen.insert(id));
            prev = id;
        }
    }

    #[test]
    fn different_nodes_do_not_collide() {
        let a = IdGenerator::new(1);
        let b = IdGenerator::new(2);
        let ids_a: HashSet<_> = (0..200).map(|_| a.next_id()).collect();
        let ids_b: HashSet<_> = (0..200).map(|_| b.next_id()).collect();
        assert!(ids_a.is_disjoint(&ids_b));
    }
}
