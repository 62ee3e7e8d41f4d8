//! Interactive proofs: goals, the tactic seam and the proof session state
//! machine.

pub mod goal;
pub(crate) mod session;
pub mod tactic;

pub use goal::{Goal, InitialGoal, MetaSupply};
pub use session::{ProofSession, SaveError};
pub use tactic::{Abstract, Admit, Apply, Assumption, Exact, Intro, Tactic, TacticError, TacticOutcome, Then};
