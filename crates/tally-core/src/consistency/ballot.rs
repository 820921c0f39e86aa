//! The ballot consistency row evaluator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::check::{
    check_ballot_statistics, check_vote_results, BallotStatistics, ValidationCheck, VoteEntry,
};
use super::patterns::parse_count_str;
use crate::evaluation::{Assessment, EvaluatorError, EvaluatorOutput, RichResult};
use crate::evaluators::RowEvaluator;

/// Which kind of form was extracted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FormType {
    /// Candidate-level results; both checks run
    Constituency,
    /// Party totals only; only the vote check runs
    PartyList,
}

impl FormType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormType::Constituency => "constituency",
            FormType::PartyList => "party_list",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "constituency" => Some(FormType::Constituency),
            "party_list" | "partylist" => Some(FormType::PartyList),
            _ => None,
        }
    }
}

/// Checks that extracted ballot counts add up.
///
/// Reads `form_type`, `ballot_statistics` and `vote_results` from the task
/// output. The returned value is the lowest check score.
pub struct BallotConsistency {
    name: String,
}

impl BallotConsistency {
    pub fn new() -> Self {
        Self::named("ballot_consistency")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Run the checks that apply to this output's form type.
    pub fn checks(
        &self,
        input: &Value,
        output: &Value,
    ) -> Result<(FormType, Vec<ValidationCheck>), EvaluatorError> {
        let fields = output
            .as_object()
            .ok_or_else(|| EvaluatorError::invalid_output("expected a JSON object"))?;

        let votes = match fields.get("vote_results") {
            Some(raw) => parse_vote_results(raw)?,
            None => return Err(EvaluatorError::invalid_output("missing vote_results")),
        };
        let form_type = resolve_form_type(fields, input, votes.has_candidates)?;
        let stats = fields
            .get("ballot_statistics")
            .map(parse_ballot_statistics)
            .transpose()?
            .ok_or_else(|| EvaluatorError::invalid_output("missing ballot_statistics"))?;

        let mut checks = Vec::with_capacity(2);
        if form_type == FormType::Constituency {
            checks.push(check_ballot_statistics(&stats));
        }
        checks.push(check_vote_results(&votes.entries, stats.valid_ballots));
        Ok((form_type, checks))
    }
}

impl Default for BallotConsistency {
    fn default() -> Self {
        Self::new()
    }
}

impl RowEvaluator for BallotConsistency {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        input: &Value,
        output: &Value,
        _expected: Option<&Value>,
    ) -> Result<EvaluatorOutput, EvaluatorError> {
        let (form_type, checks) = self.checks(input, output)?;

        let lowest = checks.iter().map(|c| c.score).fold(1.0_f64, f64::min);
        let passed = checks.iter().all(|c| c.passed);
        let reasoning = checks
            .iter()
            .map(|c| format!("{}: {}", c.check_type.as_str(), c.reasoning))
            .collect::<Vec<_>>()
            .join("; ");
        let metadata = serde_json::to_value(&checks)
            .map_err(|e| EvaluatorError::failed(format!("could not serialize checks: {}", e)))?;

        let mut result = RichResult::new(lowest)
            .assessment(Assessment::from_passed(passed))
            .reasoning(reasoning)
            .tag(form_type.as_str())
            .metadata(metadata);
        for check in checks.iter().filter(|c| !c.passed) {
            result = result.tag(check.check_type.as_str());
        }
        Ok(result.into())
    }
}

struct ParsedVotes {
    entries: Vec<VoteEntry>,
    has_candidates: bool,
}

fn resolve_form_type(
    fields: &Map<String, Value>,
    input: &Value,
    has_candidates: bool,
) -> Result<FormType, EvaluatorError> {
    let declared = fields
        .get("form_type")
        .or_else(|| input.get("form_type"))
        .filter(|v| !v.is_null());

    match declared {
        Some(Value::String(raw)) => FormType::parse(raw)
            .ok_or_else(|| EvaluatorError::invalid_output(format!("unknown form_type '{}'", raw))),
        Some(other) => Err(EvaluatorError::invalid_output(format!(
            "form_type must be a string, got {}",
            other
        ))),
        None if has_candidates => Ok(FormType::Constituency),
        None => Ok(FormType::PartyList),
    }
}

fn parse_ballot_statistics(raw: &Value) -> Result<BallotStatistics, EvaluatorError> {
    let fields = raw
        .as_object()
        .ok_or_else(|| EvaluatorError::invalid_output("ballot_statistics must be an object"))?;
    let count = |key: &str| -> Result<u64, EvaluatorError> {
        let value = fields.get(key).ok_or_else(|| {
            EvaluatorError::invalid_output(format!("ballot_statistics.{} is missing", key))
        })?;
        parse_count(value, &format!("ballot_statistics.{}", key))
    };

    Ok(BallotStatistics {
        total_ballots: count("total_ballots")?,
        valid_ballots: count("valid_ballots")?,
        invalid_ballots: count("invalid_ballots")?,
        no_vote_ballots: count("no_vote_ballots")?,
    })
}

fn parse_vote_results(raw: &Value) -> Result<ParsedVotes, EvaluatorError> {
    let items = raw
        .as_array()
        .ok_or_else(|| EvaluatorError::invalid_output("vote_results must be an array"))?;

    let mut entries = Vec::with_capacity(items.len());
    let mut has_candidates = false;
    for (i, item) in items.iter().enumerate() {
        let name = match (item.get("candidate"), item.get("party")) {
            (Some(candidate), _) if !candidate.is_null() => {
                has_candidates = true;
                name_of(candidate)
            }
            (_, Some(party)) if !party.is_null() => name_of(party),
            _ => {
                return Err(EvaluatorError::invalid_output(format!(
                    "vote_results[{}] has neither candidate nor party",
                    i
                )))
            }
        };
        let votes = item.get("votes").ok_or_else(|| {
            EvaluatorError::invalid_output(format!("vote_results[{}].votes is missing", i))
        })?;
        entries.push(VoteEntry {
            name,
            votes: parse_count(votes, &format!("vote_results[{}].votes", i))?,
        });
    }

    Ok(ParsedVotes {
        entries,
        has_candidates,
    })
}

fn name_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_count(value: &Value, field: &str) -> Result<u64, EvaluatorError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => parse_count_str(s),
        _ => None,
    };
    parsed.ok_or_else(|| {
        EvaluatorError::invalid_output(format!(
            "{} must be a non-negative integer, got {}",
            field, value
        ))
    })
}
