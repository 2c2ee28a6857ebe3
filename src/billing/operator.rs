//! Operator notifications for webhook events that need manual reconciliation.

use async_trait::async_trait;

/// Destination for failures that are acknowledged to the provider but not applied.
#[async_trait]
pub trait OperatorChannel: Send + Sync {
    async fn webhook_failed(&self, event_id: &str, event_type: &str, error: &str);
}

/// Logs failures at `error` on the `tollgate::operator` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingOperatorChannel;

#[async_trait]
impl OperatorChannel for TracingOperatorChannel {
    async fn webhook_failed(&self, event_id: &str, event_type: &str, error: &str) {
        tracing::error!(
            target: "tollgate::operator",
            event_id = %event_id,
            event_type = %event_type,
            error = %error,
            "Webhook event acknowledged but not applied; manual reconciliation required"
        );
    }
}

#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::sync::Mutex;

    /// A failure recorded by `RecordingOperatorChannel`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct OperatorAlert {
        pub event_id: String,
        pub event_type: String,
        pub error: String,
    }

    /// Keeps every alert in memory.
    #[derive(Debug, Default)]
    pub struct RecordingOperatorChannel {
        alerts: Mutex<Vec<OperatorAlert>>,
    }

    impl RecordingOperatorChannel {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn alerts(&self) -> Vec<OperatorAlert> {
            self.alerts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OperatorChannel for RecordingOperatorChannel {
        async fn webhook_failed(&self, event_id: &str, event_type: &str, error: &str) {
            self.alerts.lock().unwrap().push(OperatorAlert {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                error: error.to_string(),
            });
        }
    }
}
