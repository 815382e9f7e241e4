//! Demo executor serving `subscription { ticks }`.
//!
//! Each operation yields `{"ticks": n}` for `n` in `1..=count`, one value per
//! interval. `count` and `intervalMs` may be overridden through variables.
//! Connection-init may be gated on a shared token.

use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use subwire_core::{ExecutionResult, JsonMap, OperationId, SubscribePayload};
use subwire_session::{Executor, InitDecision, OperationFailure, ResultStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Executor for the ticker demo.
#[derive(Clone, Debug)]
pub struct TickerExecutor {
    count: u64,
    interval: Duration,
    token: Option<String>,
}

impl TickerExecutor {
    /// Ticker yielding `count` values, one every `interval`.
    pub fn new(count: u64, interval: Duration) -> Self {
        Self {
            count,
            interval,
            token: None,
        }
    }

    /// Require `{"token": token}` in connection-init.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl Default for TickerExecutor {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Whether `query` selects the `ticks` subscription field.
fn is_ticks_query(query: &str) -> bool {
    let compact: String = query.split_whitespace().collect();
    compact.starts_with("subscription") && compact.ends_with("{ticks}")
}

fn variable_u64(request: &SubscribePayload, name: &str) -> Option<u64> {
    request
        .variables
        .as_ref()
        .and_then(|v| v.get(name))
        .and_then(Value::as_u64)
}

#[async_trait]
impl Executor for TickerExecutor {
    async fn accept_init(&self, payload: Option<JsonMap>) -> InitDecision {
        let Some(expected) = &self.token else {
            return Ok(None);
        };
        let offered = payload
            .as_ref()
            .and_then(|p| p.get("token"))
            .and_then(Value::as_str);
        if offered == Some(expected.as_str()) {
            Ok(None)
        } else {
            Err("invalid token".into())
        }
    }

    fn execute(
        &self,
        id: &OperationId,
        request: SubscribePayload,
        cancel: CancellationToken,
    ) -> ResultStream {
        if !is_ticks_query(&request.query) {
            let failure = OperationFailure::message(format!(
                "unsupported operation: {}",
                request.query.trim()
            ));
            return stream::iter([Err(failure)]).boxed();
        }
        let count = variable_u64(&request, "count").unwrap_or(self.count);
        let interval = variable_u64(&request, "intervalMs")
            .map_or(self.interval, Duration::from_millis);
        debug!(operation_id = %id, count, ?interval, "starting ticker");

        stream::unfold(1_u64, move |n| async move {
            if n > count {
                return None;
            }
            tokio::time::sleep(interval).await;
            Some((Ok(ExecutionResult::data(json!({ "ticks": n }))), n + 1))
        })
        .take_until(cancel.cancelled_owned())
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn ticker() -> TickerExecutor {
        TickerExecutor::new(3, Duration::from_millis(10))
    }

    fn values(results: Vec<Result<ExecutionResult, OperationFailure>>) -> Vec<Value> {
        results
            .into_iter()
            .map(|r| r.unwrap().data.unwrap())
            .collect()
    }

    #[test]
    fn query_matching_ignores_whitespace() {
        assert!(is_ticks_query("subscription { ticks }"));
        assert!(is_ticks_query("subscription\n{\n  ticks\n}"));
        assert!(is_ticks_query("subscription Ticks { ticks }"));
        assert!(!is_ticks_query("query { ticks }"));
        assert!(!is_ticks_query("subscription { tocks }"));
    }

    #[tokio::test(start_paused = true)]
    async fn yields_count_values_then_ends() {
        let stream = ticker().execute(
            &"1".into(),
            SubscribePayload::new("subscription { ticks }"),
            CancellationToken::new(),
        );
        let results: Vec<_> = stream.collect().await;
        assert_eq!(
            values(results),
            vec![json!({ "ticks": 1 }), json!({ "ticks": 2 }), json!({ "ticks": 3 })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn variables_override_count() {
        let mut variables = JsonMap::new();
        let _ = variables.insert("count".into(), json!(5));
        let _ = variables.insert("intervalMs".into(), json!(1));
        let request = SubscribePayload::new("subscription { ticks }").with_variables(variables);
        let results: Vec<_> = ticker()
            .execute(&"1".into(), request, CancellationToken::new())
            .collect()
            .await;
        assert_eq!(results.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_stream() {
        let cancel = CancellationToken::new();
        let mut stream = ticker().execute(
            &"1".into(),
            SubscribePayload::new("subscription { ticks }"),
            cancel.clone(),
        );
        assert!(stream.next().await.is_some());
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_query_fails_the_operation() {
        let results: Vec<_> = ticker()
            .execute(
                &"1".into(),
                SubscribePayload::new("subscription { nope }"),
                CancellationToken::new(),
            )
            .collect()
            .await;
        assert_eq!(results.len(), 1);
        assert_matches!(&results[0], Err(failure) if failure.errors[0]["message"]
            .as_str()
            .unwrap()
            .starts_with("unsupported operation"));
    }

    #[tokio::test]
    async fn token_gates_init() {
        let executor = ticker().with_token("secret");
        let mut good = JsonMap::new();
        let _ = good.insert("token".into(), json!("secret"));
        assert_eq!(executor.accept_init(Some(good)).await, Ok(None));
        assert_eq!(
            executor.accept_init(None).await,
            Err("invalid token".to_string())
        );
        assert_eq!(ticker().accept_init(None).await, Ok(None));
    }
}
