use serde::{ Deserialize, Serialize };
use crate::branch::{ BranchIndex, Round, Slot };
use crate::history::{ AppendRecord, HistoryError, SlotRef };
use crate::models::chat::SequenceId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendMode {
    /// Open a sibling tab at `round` under the slot carrying the anchor; allocates a new id.
    Branch,
    /// Reply below a leaf slot of `round`; the message lands at `round + 1` with the same id.
    Continue,
}

/// A user input as produced by the UI, keyed by the round of the tab it was typed in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendCommand {
    pub mode: AppendMode,
    pub round: u32,
    pub sequence_id: Option<SequenceId>,
    pub text: String,
}

impl AppendCommand {
    pub fn branch(round: u32, anchor: Option<SequenceId>, text: impl Into<String>) -> Self {
        Self { mode: AppendMode::Branch, round, sequence_id: anchor, text: text.into() }
    }

    pub fn reply(round: u32, sequence_id: SequenceId, text: impl Into<String>) -> Self {
        Self {
            mode: AppendMode::Continue,
            round,
            sequence_id: Some(sequence_id),
            text: text.into(),
        }
    }
}

/// A validated mutation. Computing it never touches the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendPlan {
    pub mode: AppendMode,
    /// Round the new slot is written to.
    pub round: u32,
    /// Id carried by the new slot.
    pub sequence_id: SequenceId,
    /// Sequence whose prefix leads to the new slot, if any.
    pub parent: Option<SequenceId>,
    pub backfill: Vec<SlotRef>,
}

impl AppendPlan {
    pub fn record(&self, human: &str, ai: &str) -> AppendRecord {
        AppendRecord {
            round: self.round,
            sequence_ids: vec![self.sequence_id],
            human: human.to_string(),
            ai: ai.to_string(),
            backfill: self.backfill.clone(),
        }
    }
}

impl BranchIndex {
    pub fn plan(&self, command: &AppendCommand) -> Result<AppendPlan, HistoryError> {
        match command.mode {
            AppendMode::Branch => self.plan_branch(command.round, command.sequence_id),
            AppendMode::Continue => {
                let sequence_id = command.sequence_id.ok_or(HistoryError::MissingAnchor {
                    round: command.round,
                })?;
                self.plan_continue(command.round, sequence_id)
            }
        }
    }

    fn plan_branch(
        &self,
        round: u32,
        anchor: Option<SequenceId>
    ) -> Result<AppendPlan, HistoryError> {
        let rounds = self.len();
        if round == 0 || (round as usize) > rounds + 1 {
            return Err(HistoryError::RoundOutOfRange { round, rounds });
        }
        let sequence_id = self.seq_num + 1;
        if round == 1 {
            return Ok(AppendPlan {
                mode: AppendMode::Branch,
                round,
                sequence_id,
                parent: None,
                backfill: Vec::new(),
            });
        }

        let anchor = anchor.ok_or(HistoryError::MissingAnchor { round })?;
        if self.slot_with(round - 1, anchor).is_none() {
            return Err(HistoryError::UnknownSequence { round: round - 1, sequence_id: anchor });
        }

        let mut backfill = Vec::new();
        for k in (1..round).rev() {
            if let Some(r) = self.round(k) {
                for (i, slot) in r.slots.iter().enumerate() {
                    if slot.carries(anchor) {
                        backfill.push(SlotRef { round: k, slot: i });
                    }
                }
            }
        }

        Ok(AppendPlan {
            mode: AppendMode::Branch,
            round,
            sequence_id,
            parent: Some(anchor),
            backfill,
        })
    }

    fn plan_continue(
        &self,
        round: u32,
        sequence_id: SequenceId
    ) -> Result<AppendPlan, HistoryError> {
        if self.slot_with(round, sequence_id).is_none() {
            return Err(HistoryError::UnknownSequence { round, sequence_id });
        }
        if self.slot_with(round + 1, sequence_id).is_some() {
            return Err(HistoryError::DuplicateSequence { round: round + 1, sequence_id });
        }

        Ok(AppendPlan {
            mode: AppendMode::Continue,
            round: round + 1,
            sequence_id,
            parent: Some(sequence_id),
            backfill: Vec::new(),
        })
    }

    /// The already-visible conversation that precedes the planned slot.
    pub fn context(&self, plan: &AppendPlan) -> Vec<&Slot> {
        match plan.parent {
            Some(parent) => self.path(plan.round - 1, parent),
            None => Vec::new(),
        }
    }

    /// Applies a plan whose record has already been persisted. Texts get the
    /// same trailing newline the store writes, so the index stays equal to a
    /// fresh build of the stored history.
    pub fn commit(&mut self, plan: &AppendPlan, human: &str, ai: &str) {
        let slot = Slot {
            sequence_ids: vec![plan.sequence_id],
            human: format!("{}\n", human),
            ai: format!("{}\n", ai),
        };
        if (plan.round as usize) == self.rounds.len() + 1 {
            self.rounds.push(Round { number: plan.round, slots: vec![slot] });
        } else {
            self.rounds[(plan.round as usize) - 1].slots.push(slot);
        }

        for target in &plan.backfill {
            let ids = &mut self.rounds[(target.round as usize) - 1].slots[target.slot].sequence_ids;
            if !ids.contains(&plan.sequence_id) {
                ids.push(plan.sequence_id);
            }
            if ids.len() == 2 && self.loc.get(&ids[0]) == Some(&target.round) {
                // The slot stopped being a singleton: its id now ends somewhere deeper.
                let first = ids[0];
                let deepest = self.rounds
                    .iter()
                    .filter(|r| r.slots.iter().any(|s| s.singleton() == Some(first)))
                    .map(|r| r.number)
                    .max();
                match deepest {
                    Some(number) => self.loc.insert(first, number),
                    None => self.loc.remove(&first),
                };
            }
        }

        let deeper = self.loc.get(&plan.sequence_id).map_or(true, |r| *r <= plan.round);
        if deeper {
            self.loc.insert(plan.sequence_id, plan.round);
        }
        self.seq_num = self.seq_num.max(plan.sequence_id).max(self.loc.len() as u32);
    }
}
