//! Structural consistency checks for extracted ballot forms.
//!
//! [`BallotConsistency`] is an ordinary row evaluator: register it next to
//! any other evaluator. The check functions are exposed for callers that
//! want the raw [`ValidationCheck`] list.

mod ballot;
mod check;
pub mod patterns;

pub use ballot::{BallotConsistency, FormType};
pub use check::{
    check_ballot_statistics, check_vote_results, BallotStatistics, CheckType, ValidationCheck,
    VoteEntry,
};
