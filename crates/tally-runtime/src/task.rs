//! The function under test.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use tally_core::TaskError;

/// A task maps one record's `input_data` plus the run's `config` to an output.
///
/// Tasks typically wrap a network call to a model. They are invoked from
/// several workers at once and must not rely on call order.
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, input: &Value, config: &Value) -> Result<Value, TaskError>;
}

/// A task backed by an async closure.
pub struct FnTask<F> {
    f: F,
}

/// Build a task from a closure taking owned copies of the input and config.
///
/// ```rust,ignore
/// let task = task_fn(|input, _config| async move {
///     Ok(json!(format!("capital of {}", input["country"])))
/// });
/// ```
pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn(Value, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    FnTask { f }
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn(Value, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    async fn run(&self, input: &Value, config: &Value) -> Result<Value, TaskError> {
        (self.f)(input.clone(), config.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_closure_task_sees_input_and_config() {
        let task = task_fn(|input, config| async move {
            Ok(json!({
                "country": input["country"],
                "model": config["model"],
            }))
        });

        let out = task
            .run(&json!({"country": "France"}), &json!({"model": "small"}))
            .await
            .unwrap();
        assert_eq!(out, json!({"country": "France", "model": "small"}));
    }
}
