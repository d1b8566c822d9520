use std::sync::Arc;

use ractor::ActorRef;

use crate::actors::agent_listener::{self, AgentListenerError, AgentListenerMsg};
use crate::config::Config;
use crate::rpc::{ResultsClient, TaskClient};
use crate::sanitizer::{Sanitize, TokenSanitizer};
use crate::store::Store;
use crate::transport::Transport;

/// Service context: built once at startup, cloned by handle into every component.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    store: Store,
    transport: Arc<dyn Transport>,
    sanitizer: Arc<dyn Sanitize>,
}

impl AppState {
    pub fn new(config: Config, store: Store, transport: Arc<dyn Transport>) -> Self {
        let sanitizer = Arc::new(TokenSanitizer::new(&config.sanitize_keys));
        Self::with_sanitizer(config, store, transport, sanitizer)
    }

    pub fn with_sanitizer(
        config: Config,
        store: Store,
        transport: Arc<dyn Transport>,
        sanitizer: Arc<dyn Sanitize>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                transport,
                sanitizer,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    pub fn sanitizer(&self) -> &dyn Sanitize {
        self.inner.sanitizer.as_ref()
    }

    pub fn task_client(&self) -> TaskClient {
        TaskClient::new(self.transport(), self.inner.config.tasks_topic.clone())
    }

    pub fn results_client(&self) -> ResultsClient {
        ResultsClient::new(self.transport(), self.inner.config.results_topic.clone())
            .with_timeout(self.inner.config.rpc_timeout)
    }

    /// Agent result listener whose queue keeps undelivered results for the
    /// configured `results_queue_ttl`
    pub async fn spawn_agent_listener(
        &self,
        name: &str,
    ) -> Result<ActorRef<AgentListenerMsg>, AgentListenerError> {
        agent_listener::spawn_agent_listener(
            name,
            self.transport(),
            self.inner.config.results_queue_ttl,
        )
        .await
    }
}
