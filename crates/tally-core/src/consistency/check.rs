//! Arithmetic checks over extracted ballot figures.

use serde::{Deserialize, Serialize};

/// Largest score a failed check can carry, so tiny discrepancies on huge
/// totals never round up to a pass.
const FAILED_SCORE_CEILING: f64 = 1.0 - f64::EPSILON;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    BallotStatistics,
    VoteResults,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::BallotStatistics => "ballot_statistics",
            CheckType::VoteResults => "vote_results",
        }
    }
}

/// Outcome of one structural check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationCheck {
    pub check_type: CheckType,
    pub passed: bool,
    /// In `[0, 1]`; `1.0` exactly when the check passed
    pub score: f64,
    pub reasoning: String,
}

/// The four ballot counts reported on a form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BallotStatistics {
    pub total_ballots: u64,
    pub valid_ballots: u64,
    pub invalid_ballots: u64,
    pub no_vote_ballots: u64,
}

/// One candidate's or party's vote count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteEntry {
    pub name: String,
    pub votes: u64,
}

/// `total == valid + invalid + no_vote`, with no tolerance.
pub fn check_ballot_statistics(stats: &BallotStatistics) -> ValidationCheck {
    let parts = stats.valid_ballots as u128 + stats.invalid_ballots as u128 + stats.no_vote_ballots as u128;
    let total = stats.total_ballots as u128;
    let difference = total.abs_diff(parts);

    if difference == 0 {
        return ValidationCheck {
            check_type: CheckType::BallotStatistics,
            passed: true,
            score: 1.0,
            reasoning: format!(
                "total_ballots ({}) equals valid_ballots ({}) + invalid_ballots ({}) + no_vote_ballots ({})",
                stats.total_ballots, stats.valid_ballots, stats.invalid_ballots, stats.no_vote_ballots
            ),
        };
    }

    let relation = if total > parts { "exceeds" } else { "falls short of" };
    let score = (1.0 - difference as f64 / total.max(1) as f64).clamp(0.0, FAILED_SCORE_CEILING);
    ValidationCheck {
        check_type: CheckType::BallotStatistics,
        passed: false,
        score,
        reasoning: format!(
            "total_ballots ({}) {} valid_ballots + invalid_ballots + no_vote_ballots ({} + {} + {} = {}): discrepancy of {}",
            stats.total_ballots,
            relation,
            stats.valid_ballots,
            stats.invalid_ballots,
            stats.no_vote_ballots,
            parts,
            difference
        ),
    }
}

/// The summed votes must not exceed `valid_ballots`.
pub fn check_vote_results(votes: &[VoteEntry], valid_ballots: u64) -> ValidationCheck {
    let sum: u128 = votes.iter().map(|v| v.votes as u128).sum();
    let valid = valid_ballots as u128;

    if sum <= valid {
        return ValidationCheck {
            check_type: CheckType::VoteResults,
            passed: true,
            score: 1.0,
            reasoning: format!(
                "sum of {} vote entries ({}) is within valid_ballots ({})",
                votes.len(),
                sum,
                valid_ballots
            ),
        };
    }

    let excess = sum - valid;
    let score = (1.0 - excess as f64 / valid.max(1) as f64).clamp(0.0, FAILED_SCORE_CEILING);
    ValidationCheck {
        check_type: CheckType::VoteResults,
        passed: false,
        score,
        reasoning: format!(
            "sum of {} vote entries ({}) exceeds valid_ballots ({}) by {}",
            votes.len(),
            sum,
            valid_ballots,
            excess
        ),
    }
}
