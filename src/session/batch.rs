use crate::engine::TokenId;

/// One position of a batch submitted to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSlot {
    pub token: TokenId,
    /// Absolute position in the sequence
    pub position: u32,
    pub sequence_id: i32,
    /// Whether the engine should produce an output distribution for this slot
    pub output: bool,
}

/// Tokens packaged for a single decode call.
///
/// Built for a session at position `n_past`: slot `i` sits at `n_past + i`,
/// every slot belongs to sequence 0, and only the last slot requests output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenBatch {
    slots: Vec<BatchSlot>,
}

impl TokenBatch {
    /// Sessions drive a single sequence
    pub const SEQUENCE_ID: i32 = 0;

    pub fn build(tokens: &[TokenId], n_past: u32) -> Self {
        let last = tokens.len().saturating_sub(1);
        let slots = tokens
            .iter()
            .enumerate()
            .map(|(i, &token)| BatchSlot {
                token,
                position: n_past + i as u32,
                sequence_id: Self::SEQUENCE_ID,
                output: i == last,
            })
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[BatchSlot] {
        &self.slots
    }

    /// Index of the last slot that requests output
    pub fn output_index(&self) -> Option<usize> {
        self.slots.iter().rposition(|slot| slot.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_start_at_n_past() {
        let batch = TokenBatch::build(&[7, 8, 9], 10);
        let positions: Vec<u32> = batch.slots().iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![10, 11, 12]);
        assert!(batch.slots().iter().all(|s| s.sequence_id == 0));
    }

    #[test]
    fn test_only_last_slot_requests_output() {
        let batch = TokenBatch::build(&[1, 2, 3, 4], 0);
        let flags: Vec<bool> = batch.slots().iter().map(|s| s.output).collect();
        assert_eq!(flags, vec![false, false, false, true]);
        assert_eq!(batch.output_index(), Some(3));
    }

    #[test]
    fn test_empty_batch() {
        let batch = TokenBatch::build(&[], 5);
        assert!(batch.is_empty());
        assert_eq!(batch.output_index(), None);
    }
}
