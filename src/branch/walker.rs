use serde::Serialize;
use std::collections::VecDeque;
use crate::branch::BranchIndex;
use crate::models::chat::SequenceId;

pub const NEW_TAB_LABEL: &str = "New";

/// What a client has to draw, in drawing order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderInstruction {
    /// Opens a group of sibling tabs; `tabs` ends with the "New" label.
    EnterRound {
        round: u32,
        tabs: Vec<String>,
    },
    Tab {
        round: u32,
        slot: usize,
        sequence_ids: Vec<SequenceId>,
        human: String,
        ai: String,
    },
    /// Input under a slot with no continuation yet.
    ReplyInput {
        round: u32,
        sequence_id: SequenceId,
    },
    /// Input that opens a sibling branch in `round`.
    NewTab {
        round: u32,
        anchor: Option<SequenceId>,
    },
    LeaveRound {
        round: u32,
    },
}

struct Frame {
    round: u32,
    group: Vec<usize>,
    next: usize,
}

/// Depth-first walk over the branch tree. Holds at most one frame per round.
pub struct Walk<'a> {
    index: &'a BranchIndex,
    stack: Vec<Frame>,
    pending: VecDeque<RenderInstruction>,
    started: bool,
}

pub fn walk(index: &BranchIndex) -> Walk<'_> {
    Walk { index, stack: Vec::new(), pending: VecDeque::new(), started: false }
}

impl<'a> Walk<'a> {
    fn enter(&mut self, round: u32, group: Vec<usize>) -> RenderInstruction {
        let index = self.index;
        let slots = match index.round(round) {
            Some(r) => &r.slots,
            None => {
                return RenderInstruction::NewTab { round, anchor: None };
            }
        };
        let mut tabs: Vec<String> = group
            .iter()
            .map(|i| slots[*i].human.trim_end_matches('\n').to_string())
            .collect();
        tabs.push(NEW_TAB_LABEL.to_string());
        self.stack.push(Frame { round, group, next: 0 });
        RenderInstruction::EnterRound { round, tabs }
    }
}

impl<'a> Iterator for Walk<'a> {
    type Item = RenderInstruction;

    fn next(&mut self) -> Option<RenderInstruction> {
        if let Some(instruction) = self.pending.pop_front() {
            return Some(instruction);
        }

        if !self.started {
            self.started = true;
            return Some(match self.index.round(1) {
                Some(first) => {
                    let group = (0..first.slots.len()).collect();
                    self.enter(1, group)
                }
                None => RenderInstruction::NewTab { round: 1, anchor: None },
            });
        }

        let index = self.index;
        let frame = self.stack.last_mut()?;
        let round = frame.round;
        let slots = &index.round(round)?.slots;

        if frame.next < frame.group.len() {
            let i = frame.group[frame.next];
            frame.next += 1;
            let slot = &slots[i];
            let tab = RenderInstruction::Tab {
                round,
                slot: i,
                sequence_ids: slot.sequence_ids.clone(),
                human: slot.human.clone(),
                ai: slot.ai.clone(),
            };

            let children = index.children(round, i);
            if children.is_empty() {
                if let Some(&sequence_id) = slot.sequence_ids.first() {
                    self.pending.push_back(RenderInstruction::ReplyInput { round, sequence_id });
                }
            } else {
                let enter = self.enter(round + 1, children);
                self.pending.push_back(enter);
            }
            return Some(tab);
        }

        if frame.next == frame.group.len() {
            frame.next += 1;
            let anchor = frame.group
                .first()
                .and_then(|i| slots[*i].sequence_ids.first().copied());
            return Some(RenderInstruction::NewTab { round, anchor });
        }

        self.stack.pop();
        Some(RenderInstruction::LeaveRound { round })
    }
}

/// Indented plain-text outline of the tree, for logs and terminals.
pub fn render_outline(index: &BranchIndex) -> String {
    let mut out = String::new();
    let mut depth = 0usize;
    for instruction in walk(index) {
        let pad = "  ".repeat(depth);
        match instruction {
            RenderInstruction::EnterRound { round, tabs } => {
                out.push_str(&format!("{}round {} ({} tabs)\n", pad, round, tabs.len()));
                depth += 1;
            }
            RenderInstruction::Tab { sequence_ids, human, ai, .. } => {
                out.push_str(&format!("{}{:?} Human: {}\n", pad, sequence_ids, human.trim_end()));
                out.push_str(&format!("{}{:?} AI: {}\n", pad, sequence_ids, ai.trim_end()));
            }
            RenderInstruction::ReplyInput { round, sequence_id } => {
                out.push_str(&format!("{}> reply {} {}\n", pad, round, sequence_id));
            }
            RenderInstruction::NewTab { round, anchor } => {
                match anchor {
                    Some(anchor) => out.push_str(&format!("{}+ branch {} {}\n", pad, round, anchor)),
                    None => out.push_str(&format!("{}+ branch {}\n", pad, round)),
                }
            }
            RenderInstruction::LeaveRound { .. } => {
                depth = depth.saturating_sub(1);
            }
        }
    }
    out
}
