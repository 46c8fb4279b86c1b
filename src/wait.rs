//! Waiting for a deleted object to disappear.
//!
//! A DELETE returns as soon as the API server accepts it; finalizers can keep
//! the object around for a while. When a resource configures a
//! `wait_for_delete` block, the provider polls GET at a fixed interval until
//! the server answers 404 or the timeout runs out.

use std::time::Duration;

use kube::discovery::ApiResource;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::catalog::WAIT_FOR_DELETE;
use crate::client::{is_not_found, DynamicClient};
use crate::error::ProviderError;
use crate::schema::Diagnostic;

/// Timeout used when `wait_for_delete.timeout` is unset.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval used when `wait_for_delete.poll_interval` is unset.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Settings of the delete-wait poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitForDelete {
    /// Give up after this long. Zero checks exactly once.
    pub timeout: Duration,
    /// Time between two GETs.
    pub poll_interval: Duration,
}

impl Default for WaitForDelete {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

fn parse_duration(block: &Value, attribute: &str, default: Duration) -> Result<Duration, Diagnostic> {
    match block.get(attribute) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::String(text)) => humantime::parse_duration(text).map_err(|e| {
            Diagnostic::error(format!("Invalid duration for '{}.{}'", WAIT_FOR_DELETE, attribute))
                .with_detail(format!("{:?}: {}", text, e))
                .with_attribute(format!("{}.{}", WAIT_FOR_DELETE, attribute))
        }),
        Some(other) => Err(Diagnostic::error(format!(
            "Invalid duration for '{}.{}'",
            WAIT_FOR_DELETE, attribute
        ))
        .with_detail(format!("Expected a duration string such as \"30s\", got {}", other))
        .with_attribute(format!("{}.{}", WAIT_FOR_DELETE, attribute))),
    }
}

impl WaitForDelete {
    /// Read the `wait_for_delete` block of a resource state.
    ///
    /// Returns `Ok(None)` when the block is absent.
    pub fn from_state(state: &Value) -> Result<Option<Self>, Vec<Diagnostic>> {
        let block = match state.get(WAIT_FOR_DELETE) {
            None | Some(Value::Null) => return Ok(None),
            Some(block) => block,
        };

        let timeout = parse_duration(block, "timeout", DEFAULT_TIMEOUT);
        let poll_interval = parse_duration(block, "poll_interval", DEFAULT_POLL_INTERVAL);

        match (timeout, poll_interval) {
            (Ok(timeout), Ok(poll_interval)) => {
                if poll_interval.is_zero() && !timeout.is_zero() {
                    return Err(vec![Diagnostic::error(format!(
                        "Invalid duration for '{}.poll_interval'",
                        WAIT_FOR_DELETE
                    ))
                    .with_detail("The poll interval must be greater than zero")
                    .with_attribute(format!("{}.poll_interval", WAIT_FOR_DELETE))]);
                }
                Ok(Some(Self {
                    timeout,
                    poll_interval,
                }))
            },
            (timeout, poll_interval) => Err(timeout
                .err()
                .into_iter()
                .chain(poll_interval.err())
                .collect()),
        }
    }

    /// Poll until the object is gone.
    ///
    /// Errors other than 404 count as "still present".
    pub async fn wait(
        &self,
        client: &dyn DynamicClient,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        target: &str,
    ) -> Result<(), ProviderError> {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match client.get(resource, namespace, name).await {
                Err(e) if is_not_found(&e) => {
                    debug!(target_object = %target, attempts, "Object is gone");
                    return Ok(());
                },
                Err(e) => {
                    debug!(target_object = %target, attempts, error = %e, "GET failed while waiting for deletion");
                },
                Ok(_) => {
                    debug!(target_object = %target, attempts, "Object still present");
                },
            }

            if self.timeout.is_zero() {
                return Ok(());
            }
            if start.elapsed() >= self.timeout {
                return Err(ProviderError::WaitTimeoutExceeded {
                    target: target.to_string(),
                    timeout: self.timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDynamicClient;
    use serde_json::json;

    fn widgets() -> ApiResource {
        ApiResource {
            group: "example.com".to_string(),
            version: "v1".to_string(),
            api_version: "example.com/v1".to_string(),
            kind: "Widget".to_string(),
            plural: "widgets".to_string(),
        }
    }

    fn widget(name: &str) -> Value {
        json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": name, "namespace": "default"}
        })
    }

    #[test]
    fn test_from_state() {
        assert_eq!(WaitForDelete::from_state(&json!({})).unwrap(), None);
        assert_eq!(
            WaitForDelete::from_state(&json!({"wait_for_delete": null})).unwrap(),
            None
        );

        let wait = WaitForDelete::from_state(&json!({"wait_for_delete": {}}))
            .unwrap()
            .unwrap();
        assert_eq!(wait, WaitForDelete::default());

        let wait = WaitForDelete::from_state(&json!({
            "wait_for_delete": {"timeout": "2m", "poll_interval": "500ms"}
        }))
        .unwrap()
        .unwrap();
        assert_eq!(wait.timeout, Duration::from_secs(120));
        assert_eq!(wait.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_from_state_errors() {
        let diagnostics = WaitForDelete::from_state(&json!({
            "wait_for_delete": {"timeout": "soon", "poll_interval": 5}
        }))
        .unwrap_err();
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(
            diagnostics[0].attribute.as_deref(),
            Some("wait_for_delete.timeout")
        );
        assert_eq!(
            diagnostics[1].attribute.as_deref(),
            Some("wait_for_delete.poll_interval")
        );

        let diagnostics = WaitForDelete::from_state(&json!({
            "wait_for_delete": {"timeout": "10s", "poll_interval": "0s"}
        }))
        .unwrap_err();
        assert_eq!(diagnostics.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_when_gone() {
        let client = MockDynamicClient::new();
        let wait = WaitForDelete::default();
        wait.wait(&client, &widgets(), Some("default"), "demo", "Widget default/demo")
            .await
            .unwrap();
        assert_eq!(client.counts().get, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_gone() {
        let client = MockDynamicClient::new();
        client.insert(&widgets(), Some("default"), widget("demo"));
        client.linger_on_delete(3);
        client.delete(&widgets(), Some("default"), "demo").await.unwrap();

        let wait = WaitForDelete {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        };
        let start = Instant::now();
        wait.wait(&client, &widgets(), Some("default"), "demo", "Widget default/demo")
            .await
            .unwrap();

        assert_eq!(client.counts().get, 4);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_checks_once() {
        let client = MockDynamicClient::new();
        client.insert(&widgets(), Some("default"), widget("demo"));

        let wait = WaitForDelete {
            timeout: Duration::ZERO,
            poll_interval: Duration::from_secs(1),
        };
        wait.wait(&client, &widgets(), Some("default"), "demo", "Widget default/demo")
            .await
            .unwrap();
        assert_eq!(client.counts().get, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let client = MockDynamicClient::new();
        client.insert(&widgets(), Some("default"), widget("demo"));

        let wait = WaitForDelete {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(3),
        };
        let err = wait
            .wait(&client, &widgets(), Some("default"), "demo", "Widget default/demo")
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::WaitTimeoutExceeded { .. }));
        assert_eq!(
            err.to_string(),
            "Timed out after 10s waiting for Widget default/demo to be deleted"
        );
        // checks at 0s, 3s, 6s, 9s and 12s
        assert_eq!(client.counts().get, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_errors_count_as_present() {
        let client = MockDynamicClient::new();
        client.fail_next_get(500, "InternalError");

        let wait = WaitForDelete {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
        };
        wait.wait(&client, &widgets(), Some("default"), "demo", "Widget default/demo")
            .await
            .unwrap();
        assert_eq!(client.counts().get, 2);
    }
}
