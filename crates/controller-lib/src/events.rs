//! Lifecycle events published against allocation requests

use crate::crd::AllocationRequest;
use crate::error::Result;
use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

/// Reason tag of a published event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    Created,
    Failed,
    FailedCR,
    FailedWatch,
    Modified,
    Configured,
}

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::Created => "Created",
            EventReason::Failed => "Failed",
            EventReason::FailedCR => "FailedCR",
            EventReason::FailedWatch => "FailedWatch",
            EventReason::Modified => "Modified",
            EventReason::Configured => "Configured",
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            EventReason::Failed | EventReason::FailedCR | EventReason::FailedWatch
        )
    }

    fn action(&self) -> &'static str {
        match self {
            EventReason::Created | EventReason::Failed => "Allocate",
            EventReason::FailedCR => "Reconcile",
            EventReason::FailedWatch => "Reallocate",
            EventReason::Modified => "UpdateStatus",
            EventReason::Configured => "Recreate",
        }
    }
}

impl std::fmt::Display for EventReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, request: &AllocationRequest, reason: EventReason, note: String) -> Result<()>;
}

/// [`EventSink`] that writes Kubernetes events through a recorder
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: impl Into<String>, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.into(),
                instance,
            },
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, request: &AllocationRequest, reason: EventReason, note: String) -> Result<()> {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            request.object_ref(&()),
        );
        let type_ = if reason.is_warning() {
            EventType::Warning
        } else {
            EventType::Normal
        };
        recorder
            .publish(Event {
                type_,
                reason: reason.as_str().to_string(),
                note: Some(note),
                action: reason.action().to_string(),
                secondary: None,
            })
            .await?;
        Ok(())
    }
}

/// Publish an event, logging instead of failing when the sink errors
pub async fn emit(sink: &dyn EventSink, request: &AllocationRequest, reason: EventReason, note: String) {
    if let Err(e) = sink.publish(request, reason, note).await {
        tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reasons_are_warnings() {
        assert!(EventReason::Failed.is_warning());
        assert!(EventReason::FailedCR.is_warning());
        assert!(EventReason::FailedWatch.is_warning());
        assert!(!EventReason::Created.is_warning());
        assert!(!EventReason::Configured.is_warning());
        assert_eq!(EventReason::FailedCR.to_string(), "FailedCR");
    }
}
