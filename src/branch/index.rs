use serde::Serialize;
use std::collections::BTreeMap;
use crate::models::chat::{ ChatHistory, SequenceId };

/// One message position in a round, tagged with every sequence passing through it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub sequence_ids: Vec<SequenceId>,
    pub human: String,
    pub ai: String,
}

impl Slot {
    pub fn carries(&self, sequence_id: SequenceId) -> bool {
        self.sequence_ids.contains(&sequence_id)
    }

    pub fn intersects(&self, other: &[SequenceId]) -> bool {
        self.sequence_ids.iter().any(|id| other.contains(id))
    }

    /// The id that opened this slot's branch, if no later branch passes through it.
    pub fn singleton(&self) -> Option<SequenceId> {
        match self.sequence_ids.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Round {
    pub number: u32,
    pub slots: Vec<Slot>,
}

/// In-memory view of a chat history, rebuilt from the store on every session start.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BranchIndex {
    pub(crate) rounds: Vec<Round>,
    pub(crate) loc: BTreeMap<SequenceId, u32>,
    pub(crate) seq_num: u32,
}

impl BranchIndex {
    pub fn build(history: &ChatHistory) -> Self {
        let mut rounds = Vec::with_capacity(history.len());
        let mut loc = BTreeMap::new();
        let mut highest = 0;

        for (pos, record) in history.iter().enumerate() {
            let number = (pos as u32) + 1;
            let mut slots = Vec::with_capacity(record.messages.len());
            for message in &record.messages {
                let slot = Slot {
                    sequence_ids: message.sequence.clone(),
                    human: message.human.clone(),
                    ai: message.ai.clone(),
                };
                if let Some(id) = slot.singleton() {
                    loc.insert(id, number);
                }
                highest = slot.sequence_ids.iter().copied().fold(highest, u32::max);
                slots.push(slot);
            }
            rounds.push(Round { number, slots });
        }

        let seq_num = (loc.len() as u32).max(highest);
        Self { rounds, loc, seq_num }
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn rounds(&self) -> &[Round] {
        &self.rounds
    }

    /// 1-based lookup.
    pub fn round(&self, number: u32) -> Option<&Round> {
        if number == 0 {
            return None;
        }
        self.rounds.get((number as usize) - 1)
    }

    pub fn loc(&self, sequence_id: SequenceId) -> Option<u32> {
        self.loc.get(&sequence_id).copied()
    }

    pub fn seq_num(&self) -> u32 {
        self.seq_num
    }

    pub fn slot_with(&self, round: u32, sequence_id: SequenceId) -> Option<usize> {
        self.round(round)?
            .slots.iter()
            .position(|slot| slot.carries(sequence_id))
    }

    /// Slots carrying `sequence_id` from round 1 through `round`.
    pub fn path(&self, round: u32, sequence_id: SequenceId) -> Vec<&Slot> {
        self.rounds
            .iter()
            .take(round as usize)
            .filter_map(|r| r.slots.iter().find(|slot| slot.carries(sequence_id)))
            .collect()
    }

    /// Slot indices in `round + 1` that continue the given slot of `round`.
    pub fn children(&self, round: u32, slot: usize) -> Vec<usize> {
        let parent = match self.round(round).and_then(|r| r.slots.get(slot)) {
            Some(parent) => parent,
            None => {
                return Vec::new();
            }
        };
        match self.round(round + 1) {
            Some(next) =>
                next.slots
                    .iter()
                    .enumerate()
                    .filter(|(_, child)| child.intersects(&parent.sequence_ids))
                    .map(|(i, _)| i)
                    .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::chat::{ MessageRecord, RoundRecord };

    pub(crate) fn message(ids: &[SequenceId], human: &str, ai: &str) -> MessageRecord {
        MessageRecord {
            sequence: ids.to_vec(),
            human: format!("{}\n", human),
            ai: format!("{}\n", ai),
        }
    }

    /// Round 1: [1,2]; round 2: [1], [2]; round 3: [1].
    pub(crate) fn sample_history() -> ChatHistory {
        vec![
            RoundRecord { round: 1, messages: vec![message(&[1, 2], "hi", "hello")] },
            RoundRecord {
                round: 2,
                messages: vec![
                    message(&[1], "tell a joke", "knock knock"),
                    message(&[2], "tell a poem", "roses are red")
                ],
            },
            RoundRecord { round: 3, messages: vec![message(&[1], "who is there", "rust")] }
        ]
    }

    #[test]
    fn test_build_slots_and_loc() {
        let index = BranchIndex::build(&sample_history());
        assert_eq!(index.len(), 3);
        assert_eq!(index.round(1).unwrap().slots[0].sequence_ids, vec![1, 2]);
        assert_eq!(index.round(2).unwrap().slots[1].human, "tell a poem\n");
        assert_eq!(index.loc(1), Some(3));
        assert_eq!(index.loc(2), Some(2));
        assert_eq!(index.seq_num(), 2);
        assert!(index.round(0).is_none());
        assert!(index.round(4).is_none());
    }

    #[test]
    fn test_build_is_deterministic() {
        let history = sample_history();
        assert_eq!(BranchIndex::build(&history), BranchIndex::build(&history));
    }

    #[test]
    fn test_build_empty() {
        let index = BranchIndex::build(&Vec::new());
        assert!(index.is_empty());
        assert_eq!(index.seq_num(), 0);
    }

    #[test]
    fn test_seq_num_never_below_highest_id() {
        let history = vec![RoundRecord { round: 1, messages: vec![message(&[4], "a", "b")] }];
        let index = BranchIndex::build(&history);
        assert_eq!(index.loc.len(), 1);
        assert_eq!(index.seq_num(), 4);
    }

    #[test]
    fn test_path_and_children() {
        let index = BranchIndex::build(&sample_history());
        let path = index.path(3, 1);
        assert_eq!(path.len(), 3);
        assert_eq!(path[2].human, "who is there\n");
        assert_eq!(index.path(2, 2).len(), 2);

        assert_eq!(index.children(1, 0), vec![0, 1]);
        assert_eq!(index.children(2, 0), vec![0]);
        assert!(index.children(2, 1).is_empty());
        assert!(index.children(3, 0).is_empty());
        assert_eq!(index.slot_with(2, 2), Some(1));
        assert_eq!(index.slot_with(3, 2), None);
    }
}
