use std::sync::Arc;

use super::{config::RouterConfig, router::Router};
use crate::boards::BoardRegistry;
use crate::events::EventKind;
use crate::subscribers::Subscribe;

/// Builder for constructing a [`Router`] with optional collaborators.
pub struct RouterBuilder {
    cfg: RouterConfig,
    registry: Option<BoardRegistry>,
    subscribers: Vec<(EventKind, Arc<dyn Subscribe>)>,
}

impl RouterBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: RouterConfig) -> Self {
        Self {
            cfg,
            registry: None,
            subscribers: Vec::new(),
        }
    }

    /// Uses `registry` instead of [`BoardRegistry::builtin`].
    pub fn with_registry(mut self, registry: BoardRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Subscribes `sub` to `kind` before any event can be published.
    ///
    /// A later subscriber for the same kind replaces an earlier one.
    pub fn with_subscriber(mut self, kind: EventKind, sub: Arc<dyn Subscribe>) -> Self {
        self.subscribers.push((kind, sub));
        self
    }

    /// Builds the router and starts its event listener.
    ///
    /// Must be called from within a tokio runtime. No board is selected yet;
    /// call [`Router::change_board`] next.
    pub fn build(self) -> Arc<Router> {
        let registry = self.registry.unwrap_or_else(BoardRegistry::builtin);
        let router = Arc::new(Router::new_internal(self.cfg, registry));

        for (kind, sub) in self.subscribers {
            router.subscribe(kind, sub);
        }
        router.spawn_listener();
        router
    }
}
