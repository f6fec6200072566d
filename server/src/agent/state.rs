//! Incremental Agent State
//!
//! Per-room bookkeeping for the analysis pipeline: how far each node has
//! consumed the transcript, each node's latest result, and the tick counter.

use std::collections::HashMap;

use super::graph::NodeKind;

/// Mutable pipeline state, owned by the room agent's worker task.
#[derive(Debug, Default)]
pub struct AgentState {
    cursors: HashMap<NodeKind, usize>,
    latest: HashMap<NodeKind, serde_json::Value>,
    /// Monotonic tick counter.
    pub pipeline_tick_id: u64,
}

impl AgentState {
    /// Fresh state with every cursor at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest turn index (exclusive) already consumed by a node.
    #[must_use]
    pub fn cursor(&self, kind: NodeKind) -> usize {
        self.cursors.get(&kind).copied().unwrap_or(0)
    }

    /// Advance a node's cursor to the snapshot length it consumed.
    pub fn advance(&mut self, kind: NodeKind, snapshot_len: usize) {
        let cursor = self.cursors.entry(kind).or_insert(0);
        if snapshot_len > *cursor {
            *cursor = snapshot_len;
        }
    }

    /// Latest stored result for a node.
    #[must_use]
    pub fn latest(&self, kind: NodeKind) -> Option<&serde_json::Value> {
        self.latest.get(&kind)
    }

    /// Record a node's newest result.
    pub fn record(&mut self, kind: NodeKind, payload: serde_json::Value) {
        self.latest.insert(kind, payload);
    }

    /// Whether any node still has unconsumed turns.
    #[must_use]
    pub fn has_pending_input(&self, transcript_len: usize) -> bool {
        transcript_len > 0
            && NodeKind::ALL
                .iter()
                .any(|kind| self.cursor(*kind) < transcript_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_start_at_zero_and_never_regress() {
        let mut state = AgentState::new();
        assert_eq!(state.cursor(NodeKind::Summarize), 0);

        state.advance(NodeKind::Summarize, 4);
        assert_eq!(state.cursor(NodeKind::Summarize), 4);

        state.advance(NodeKind::Summarize, 2);
        assert_eq!(state.cursor(NodeKind::Summarize), 4);
    }

    #[test]
    fn pending_input_tracks_all_nodes() {
        let mut state = AgentState::new();
        assert!(!state.has_pending_input(0));
        assert!(state.has_pending_input(1));

        for kind in NodeKind::ALL {
            state.advance(kind, 1);
        }
        assert!(!state.has_pending_input(1));
        assert!(state.has_pending_input(2));
    }
}
