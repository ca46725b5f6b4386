//! Routing of messages to handlers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConfigurationError;
use crate::handler::SagaHandler;
use crate::message::{Route, RoutingKey, SagaMessage};

/// Maps routes to their handlers and handler types to handler instances.
///
/// Built once at startup; read-only afterwards.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    routes: HashMap<Route, Vec<Arc<dyn SagaHandler>>>,
    routing_keys: HashMap<Route, RoutingKey>,
    handlers: HashMap<&'static str, Arc<dyn SagaHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Handlers for a route, in registration order.
    pub fn resolve(&self, route: &Route) -> Result<&[Arc<dyn SagaHandler>], ConfigurationError> {
        self.routes
            .get(route)
            .map(Vec::as_slice)
            .ok_or_else(|| ConfigurationError::UnregisteredRoute {
                route: route.to_string(),
            })
    }

    /// Looks up a handler by its persisted type name.
    pub fn handler(&self, handler_type: &str) -> Result<Arc<dyn SagaHandler>, ConfigurationError> {
        self.handlers
            .get(handler_type)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownHandler(handler_type.to_string()))
    }

    /// Transport routing key of the message type behind a route.
    pub fn routing_key(&self, route: &Route) -> Option<&RoutingKey> {
        self.routing_keys.get(route)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.keys()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("HandlerRegistry")
            .field("routes", &self.routes.len())
            .field("handlers", &handlers)
            .finish()
    }
}

/// Builder for [`HandlerRegistry`]. Every registration is validated eagerly.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    registry: HandlerRegistry,
}

impl HandlerRegistryBuilder {
    /// Registers a handler for messages of type `M`.
    pub fn register<M: SagaMessage>(
        self,
        handler: Arc<dyn SagaHandler>,
    ) -> Result<Self, ConfigurationError> {
        let key = RoutingKey::of::<M>()?;
        self.add(Route::message::<M>(), key, handler)
    }

    /// Registers a handler for responses of type `R` to commands of type `C`.
    pub fn register_response<C: SagaMessage, R: SagaMessage>(
        self,
        handler: Arc<dyn SagaHandler>,
    ) -> Result<Self, ConfigurationError> {
        RoutingKey::of::<C>()?;
        let key = RoutingKey::of::<R>()?;
        self.add(Route::response::<C, R>(), key, handler)
    }

    fn add(
        mut self,
        route: Route,
        key: RoutingKey,
        handler: Arc<dyn SagaHandler>,
    ) -> Result<Self, ConfigurationError> {
        let handler_type = handler.handler_type();
        if let Some(existing) = self.registry.handlers.get(handler_type) {
            if !Arc::ptr_eq(existing, &handler) {
                return Err(ConfigurationError::ConflictingHandlerType(
                    handler_type.to_string(),
                ));
            }
        }

        let handlers = self.registry.routes.entry(route.clone()).or_default();
        if handlers.iter().any(|h| h.handler_type() == handler_type) {
            return Err(ConfigurationError::DuplicateHandler {
                handler_type: handler_type.to_string(),
                route: route.to_string(),
            });
        }
        handlers.push(Arc::clone(&handler));

        tracing::debug!(%route, routing_key = %key, handler_type, "registered saga handler");
        self.registry.routing_keys.insert(route, key);
        self.registry.handlers.insert(handler_type, handler);
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        self.registry
    }
}
