//! Route table and dispatch. Faults never leave `dispatch`; they become responses.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use crate::request::{Method, Request};
use crate::response::{Response, StatusCode};
use crate::route::Route;

/// Route handler. Runs on a worker thread; may be called concurrently.
pub type Handler = Arc<dyn Fn(&Request) -> Result<Response, HandlerFault> + Send + Sync>;

/// A handler failure. Converted to a 400 response carrying the message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerFault(pub String);

impl HandlerFault {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerFault(message.into())
    }
}

impl From<serde_json::Error> for HandlerFault {
    fn from(e: serde_json::Error) -> Self {
        HandlerFault(e.to_string())
    }
}

impl From<crate::mapping::MappingError> for HandlerFault {
    fn from(e: crate::mapping::MappingError) -> Self {
        HandlerFault(e.to_string())
    }
}

impl From<crate::action::ActionError> for HandlerFault {
    fn from(e: crate::action::ActionError) -> Self {
        HandlerFault(e.to_string())
    }
}

struct Entry {
    route: Route,
    handler: Handler,
}

/// Route table. Registration order is kept for tie-breaking.
#[derive(Default)]
pub struct Router {
    routes: RwLock<Vec<Entry>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns false if the same method and pattern is already registered;
    /// the first registration stays in effect.
    pub fn add_route<F>(&self, route: Route, handler: F) -> bool
    where
        F: Fn(&Request) -> Result<Response, HandlerFault> + Send + Sync + 'static,
    {
        self.add_handler(route, Arc::new(handler))
    }

    pub fn add_handler(&self, route: Route, handler: Handler) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if routes.iter().any(|e| e.route == route) {
            tracing::debug!(%route, "route already registered");
            return false;
        }
        tracing::debug!(%route, "route registered");
        routes.push(Entry { route, handler });
        true
    }

    pub fn remove_route(&self, route: &Route) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let before = routes.len();
        routes.retain(|e| &e.route != route);
        routes.len() != before
    }

    /// Registered routes in registration order.
    pub fn routes(&self) -> Vec<Route> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.route.clone())
            .collect()
    }

    /// Pick the route for (method, path): exact beats parameterized, then fewest parameters,
    /// then first registered.
    pub fn resolve(&self, method: Method, path: &str) -> Option<(Route, Handler, Vec<(String, String)>)> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes
            .iter()
            .filter(|e| e.route.method() == method)
            .filter_map(|e| e.route.pattern().matches(path).map(|params| (e, params)))
            .min_by_key(|(e, _)| e.route.pattern().wildcard_count())
            .map(|(e, params)| (e.route.clone(), e.handler.clone(), params))
    }

    /// Run the matching handler. No match is 404; handler error is 400; handler panic is 500.
    pub fn dispatch(&self, request: Request) -> Response {
        let Some((route, handler, params)) = self.resolve(request.method(), request.path()) else {
            tracing::debug!(method = %request.method(), path = request.path(), "no route");
            return Response::not_found();
        };
        let request = request.with_params(params);
        match catch_unwind(AssertUnwindSafe(|| handler(&request))) {
            Ok(Ok(response)) => response,
            Ok(Err(fault)) => {
                tracing::warn!(%route, error = %fault, "handler fault");
                Response::error(fault)
            }
            Err(_) => {
                tracing::error!(%route, "handler panicked");
                Response::new(StatusCode::INTERNAL_ERROR)
            }
        }
    }
}
