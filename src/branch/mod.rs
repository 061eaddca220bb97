//! Branching conversation history.
//!
//! A chat is a list of rounds. Each round holds slots, and each slot is tagged
//! with every sequence (branch) that passes through it. Starting a sibling
//! branch allocates a new sequence id and backfills it into every ancestor
//! slot on the anchor's path, so a slot's children are exactly the slots of
//! the next round sharing an id with it.

pub mod append;
pub mod index;
pub mod walker;

pub use append::{ AppendCommand, AppendMode, AppendPlan };
pub use index::{ BranchIndex, Round, Slot };
pub use walker::{ render_outline, walk, RenderInstruction, Walk };
