//! Operation bodies supplied by the application layer, and the session
//! context they run against.

use crate::error::Result;
use crate::process::{Application, ProcessHandle};
use crate::scheduler::ResourceClass;
use crate::session::{Session, SessionRegistry};
use crate::workspace::{self, SessionDirs};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

/// Work executed once a request is admitted.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn run(&self, payload: Value, session: SessionContext) -> anyhow::Result<Value>;
}

struct FnOperation<F>(F);

#[async_trait]
impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(Value, SessionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, payload: Value, session: SessionContext) -> anyhow::Result<Value> {
        (self.0)(payload, session).await
    }
}

/// Maps `(resource class, operation name)` to an operation body.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    bodies: HashMap<(ResourceClass, String), Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        resource_class: ResourceClass,
        name: impl Into<String>,
        operation: impl Operation + 'static,
    ) -> &mut Self {
        self.bodies
            .insert((resource_class, name.into()), Arc::new(operation));
        self
    }

    pub fn register_fn<F, Fut>(
        &mut self,
        resource_class: ResourceClass,
        name: impl Into<String>,
        body: F,
    ) -> &mut Self
    where
        F: Fn(Value, SessionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(resource_class, name, FnOperation(body))
    }

    pub fn get(&self, resource_class: ResourceClass, name: &str) -> Option<Arc<dyn Operation>> {
        self.bodies.get(&(resource_class, name.to_string())).cloned()
    }

    pub fn contains(&self, resource_class: ResourceClass, name: &str) -> bool {
        self.bodies.contains_key(&(resource_class, name.to_string()))
    }

    pub fn names(&self) -> Vec<(ResourceClass, String)> {
        let mut names: Vec<_> = self.bodies.keys().cloned().collect();
        names.sort();
        names
    }
}

/// The admitted request's session, as seen by its operation body.
#[derive(Clone)]
pub struct SessionContext {
    request_id: String,
    session: Session,
    registry: Arc<SessionRegistry>,
}

impl SessionContext {
    pub(crate) fn new(request_id: String, session: Session, registry: Arc<SessionRegistry>) -> Self {
        Self {
            request_id,
            session,
            registry,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn user_id(&self) -> &str {
        &self.session.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn dirs(&self) -> &SessionDirs {
        &self.session.dirs
    }

    /// Bind a fresh exclusive process for `application` to this session.
    pub async fn acquire(&self, application: Application) -> Result<ProcessHandle> {
        self.registry
            .bind_process(self.user_id(), self.session_id(), application)
            .await
    }

    pub async fn release(&self, application: Application) -> bool {
        self.registry
            .unbind_process(self.user_id(), self.session_id(), application)
            .await
    }

    /// Keep the session from idling out during a long body. Returns false
    /// once the session has been replaced or destroyed.
    pub async fn touch(&self) -> bool {
        self.registry.touch(self.user_id(), self.session_id()).await
    }

    pub async fn write_artifact(&self, path: &str, content: &[u8]) -> Result<PathBuf> {
        workspace::write_artifact(self.dirs(), path, content).await
    }

    pub async fn read_artifact(&self, path: &str) -> Result<Vec<u8>> {
        workspace::read_artifact(self.dirs(), path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Operation for Echo {
        async fn run(&self, payload: Value, _session: SessionContext) -> anyhow::Result<Value> {
            Ok(payload)
        }
    }

    #[test]
    fn lookup_is_keyed_by_class_and_name() {
        let mut registry = OperationRegistry::new();
        registry
            .register(ResourceClass::Persistence, "pricing.save", Echo)
            .register_fn(ResourceClass::ExternalApi, "crm.sync", |_payload, _session| async {
                Ok::<_, anyhow::Error>(json!({ "synced": true }))
            });

        assert!(registry.contains(ResourceClass::Persistence, "pricing.save"));
        assert!(!registry.contains(ResourceClass::BackgroundTask, "pricing.save"));
        assert!(registry.get(ResourceClass::ExternalApi, "crm.sync").is_some());
        assert!(registry.get(ResourceClass::ExternalApi, "crm.push").is_none());
        assert_eq!(
            registry.names(),
            vec![
                (ResourceClass::Persistence, "pricing.save".to_string()),
                (ResourceClass::ExternalApi, "crm.sync".to_string()),
            ]
        );
    }
}
