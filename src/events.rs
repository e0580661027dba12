use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

/// Publishes Kubernetes Events for lifecycle transitions and command
/// outcomes. Publishing is best-effort: a failed event never fails the
/// reconcile that produced it.
pub struct EventPublisher {
    recorder: Recorder,
}

impl EventPublisher {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: "canopy".into(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub async fn normal(&self, regarding: &ObjectReference, reason: &str, message: &str) {
        self.publish(EventType::Normal, regarding, reason, message).await;
    }

    pub async fn warning(&self, regarding: &ObjectReference, reason: &str, message: &str) {
        self.publish(EventType::Warning, regarding, reason, message).await;
    }

    async fn publish(
        &self,
        type_: EventType,
        regarding: &ObjectReference,
        reason: &str,
        message: &str,
    ) {
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(message.into()),
            action: reason.into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, regarding).await {
            warn!(reason, error = %e, "failed to publish event");
        }
    }
}

/// Reference an object for event attribution.
pub fn object_ref<K>(obj: &K) -> ObjectReference
where
    K: Resource<DynamicType = ()>,
{
    ObjectReference {
        api_version: Some(K::api_version(&()).into_owned()),
        kind: Some(K::kind(&()).into_owned()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.uid(),
        ..Default::default()
    }
}
