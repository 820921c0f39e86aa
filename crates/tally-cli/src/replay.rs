//! Replay pre-recorded task outputs.
//!
//! A dataset imported with a column of recorded model outputs (left in
//! `metadata`) can be evaluated without calling the model again. The task
//! looks the output up by the record's `input_data`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tally_core::{Record, TaskError};
use tally_runtime::{task_fn, Task};

/// Recorded outputs keyed by the canonical JSON of each record's input.
pub type RecordedOutputs = HashMap<String, Value>;

/// Collect `metadata[column]` for every record that has it.
///
/// String cells holding a JSON object or array are parsed. With `wrap_as`,
/// each output becomes `{wrap_as: output}` so it lines up with expected
/// outputs imported from a single named column.
pub fn recorded_outputs(
    records: &[Record],
    column: &str,
    wrap_as: Option<&str>,
) -> Result<RecordedOutputs> {
    let mut outputs = RecordedOutputs::new();
    let mut missing = 0usize;

    for record in records {
        let Some(raw) = record.metadata.as_ref().and_then(|m| m.get(column)) else {
            missing += 1;
            continue;
        };
        let mut output = decode_cell(raw);
        if let Some(key) = wrap_as {
            output = json!({ key: output });
        }

        let key = serde_json::to_string(&record.input_data)
            .with_context(|| format!("Failed to encode input of record '{}'", record.id))?;
        match outputs.get(&key) {
            Some(existing) if *existing != output => bail!(
                "Record '{}' repeats an earlier input with a different recorded output",
                record.id
            ),
            Some(_) => {}
            None => {
                outputs.insert(key, output);
            }
        }
    }

    if missing > 0 {
        tracing::warn!(column, missing, "Records without a recorded output will fail");
    }
    Ok(outputs)
}

fn decode_cell(raw: &Value) -> Value {
    match raw {
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(|v| v.is_object() || v.is_array())
            .unwrap_or_else(|| raw.clone()),
        other => other.clone(),
    }
}

/// A task answering from `outputs`.
pub fn replay_task(outputs: RecordedOutputs) -> impl Task {
    let outputs = Arc::new(outputs);
    task_fn(move |input, _config| {
        let outputs = outputs.clone();
        async move {
            let key = serde_json::to_string(&input).map_err(|e| TaskError::failed(e.to_string()))?;
            outputs
                .get(&key)
                .cloned()
                .ok_or_else(|| TaskError::failed("No recorded output for this input"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded(id: &str, country: &str, output: &str) -> Record {
        Record::with_id(id, json!({ "country": country }))
            .metadata(json!({ "model_output": output }))
    }

    #[test]
    fn test_wraps_and_parses_cells() {
        let records = vec![
            recorded("fr", "France", "Paris"),
            recorded("form", "Unit 7", r#"{"vote_results": []}"#),
        ];
        let outputs = recorded_outputs(&records, "model_output", None).unwrap();
        assert_eq!(outputs[r#"{"country":"France"}"#], json!("Paris"));
        assert_eq!(outputs[r#"{"country":"Unit 7"}"#], json!({"vote_results": []}));

        let wrapped = recorded_outputs(&records[..1], "model_output", Some("capital")).unwrap();
        assert_eq!(wrapped[r#"{"country":"France"}"#], json!({"capital": "Paris"}));
    }

    #[test]
    fn test_numeric_strings_stay_strings() {
        let outputs = recorded_outputs(&[recorded("n", "x", "42")], "model_output", None).unwrap();
        assert_eq!(outputs[r#"{"country":"x"}"#], json!("42"));
    }

    #[test]
    fn test_conflicting_duplicate_inputs_rejected() {
        let records = vec![
            recorded("a", "France", "Paris"),
            recorded("b", "France", "Lyon"),
        ];
        assert!(recorded_outputs(&records, "model_output", None).is_err());
    }

    #[tokio::test]
    async fn test_replay_task_answers_from_recording() {
        let outputs = recorded_outputs(&[recorded("fr", "France", "Paris")], "model_output", None).unwrap();
        let task = replay_task(outputs);

        let hit = task.run(&json!({"country": "France"}), &Value::Null).await;
        assert_eq!(hit, Ok(json!("Paris")));
        let miss = task.run(&json!({"country": "Spain"}), &Value::Null).await;
        assert!(matches!(miss, Err(TaskError::Failed { .. })));
    }
}
