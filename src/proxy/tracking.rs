use tracing::info;

use crate::metrics_provider::METRICS_PROVIDER;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Manifest,
    Blob,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PullEvent {
    pub kind: ArtifactKind,
    pub from_cache: bool,
    pub group: String,
    pub user: Option<String>,
}

impl PullEvent {
    pub fn name(&self) -> &'static str {
        match (self.kind, self.from_cache) {
            (ArtifactKind::Manifest, false) => "pull_manifest",
            (ArtifactKind::Manifest, true) => "pull_manifest_from_cache",
            (ArtifactKind::Blob, false) => "pull_blob",
            (ArtifactKind::Blob, true) => "pull_blob_from_cache",
        }
    }
}

pub trait EventTracker: Send + Sync {
    fn track(&self, event: &PullEvent);
}

/// Counts events in the Prometheus registry and logs them.
pub struct MetricsTracker;

impl EventTracker for MetricsTracker {
    fn track(&self, event: &PullEvent) {
        METRICS_PROVIDER
            .metric_dependency_proxy_events
            .with_label_values(&[event.name()])
            .inc();

        info!(
            event = event.name(),
            group = %event.group,
            user = event.user.as_deref().unwrap_or("anonymous"),
            "Dependency proxy event"
        );
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingTracker {
        events: Mutex<Vec<PullEvent>>,
    }

    impl RecordingTracker {
        pub fn names(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().iter().map(PullEvent::name).collect()
        }

        pub fn events(&self) -> Vec<PullEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventTracker for RecordingTracker {
        fn track(&self, event: &PullEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_event_names() {
        let mut event = PullEvent {
            kind: ArtifactKind::Manifest,
            from_cache: false,
            group: "acme".to_string(),
            user: None,
        };
        assert_eq!(event.name(), "pull_manifest");

        event.from_cache = true;
        assert_eq!(event.name(), "pull_manifest_from_cache");

        event.kind = ArtifactKind::Blob;
        assert_eq!(event.name(), "pull_blob_from_cache");

        event.from_cache = false;
        assert_eq!(event.name(), "pull_blob");
    }

    #[test]
    fn test_metrics_tracker_counts_events() {
        let event = PullEvent {
            kind: ArtifactKind::Blob,
            from_cache: true,
            group: "acme".to_string(),
            user: Some("alice".to_string()),
        };
        let counter = METRICS_PROVIDER
            .metric_dependency_proxy_events
            .with_label_values(&["pull_blob_from_cache"]);
        let before = counter.get();

        MetricsTracker.track(&event);

        assert!(counter.get() > before);
    }
}
