//! Request routing: predicates bound to strategies, plus a catch handler.
//!
//! Routes are tried in registration order and the first match wins, so
//! specific routes must be registered before a catch-all. A request that
//! matches no route is left to the network without touching any cache.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use swkit_net::{Request, RequestDestination, Response};
use tracing::{debug, trace, warn};
use url::Url;

use crate::context::WorkerContext;
use crate::error::SwError;
use crate::precache::PrecacheController;
use crate::strategy::Strategy;

/// What a route predicate sees.
#[derive(Debug, Clone, Copy)]
pub struct RouteInput<'a> {
    pub url: &'a Url,
    pub request: &'a Request,
    /// The request targets the worker's own origin.
    pub same_origin: bool,
}

type Predicate = Arc<dyn Fn(&RouteInput<'_>) -> bool + Send + Sync>;

/// Request predicate.
#[derive(Clone)]
pub enum RouteMatcher {
    /// Same-origin request whose path equals the given path.
    ExactPath(String),
    /// Request on any origin whose path equals the given path.
    AnyOriginPath(String),
    /// Same-origin request whose path starts with the given prefix.
    PathPrefix(String),
    Destination(RequestDestination),
    /// URL (or a variation) is in the precache manifest.
    Precached(Arc<PrecacheController>),
    Always,
    Custom(Predicate),
}

impl RouteMatcher {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RouteInput<'_>) -> bool + Send + Sync + 'static,
    {
        RouteMatcher::Custom(Arc::new(f))
    }

    pub fn matches(&self, input: &RouteInput<'_>) -> bool {
        match self {
            RouteMatcher::ExactPath(path) => input.same_origin && input.url.path() == path,
            RouteMatcher::AnyOriginPath(path) => input.url.path() == path,
            RouteMatcher::PathPrefix(prefix) => {
                input.same_origin && input.url.path().starts_with(prefix.as_str())
            }
            RouteMatcher::Destination(d) => input.request.destination == *d,
            RouteMatcher::Precached(controller) => controller.is_precached(input.url),
            RouteMatcher::Always => true,
            RouteMatcher::Custom(f) => f(input),
        }
    }
}

impl fmt::Debug for RouteMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMatcher::ExactPath(p) => f.debug_tuple("ExactPath").field(p).finish(),
            RouteMatcher::AnyOriginPath(p) => f.debug_tuple("AnyOriginPath").field(p).finish(),
            RouteMatcher::PathPrefix(p) => f.debug_tuple("PathPrefix").field(p).finish(),
            RouteMatcher::Destination(d) => f.debug_tuple("Destination").field(d).finish(),
            RouteMatcher::Precached(_) => f.write_str("Precached"),
            RouteMatcher::Always => f.write_str("Always"),
            RouteMatcher::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// A predicate bound to a strategy.
#[derive(Debug, Clone)]
pub struct Route {
    pub matcher: RouteMatcher,
    /// Only requests with this method match. Defaults to `GET`.
    pub method: Method,
    pub strategy: Strategy,
}

impl Route {
    pub fn new(matcher: RouteMatcher, strategy: Strategy) -> Self {
        Self {
            matcher,
            method: Method::GET,
            strategy,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn matches(&self, input: &RouteInput<'_>) -> bool {
        input.request.method == self.method && self.matcher.matches(input)
    }
}

/// Produces a response after a route's strategy failed.
#[async_trait]
pub trait CatchHandler: Send + Sync {
    async fn handle(&self, ctx: &WorkerContext, request: &Request, error: &SwError) -> Response;
}

/// Result of routing one request.
#[derive(Debug)]
pub enum RouteOutcome {
    /// No route matched; the request goes to the network untouched.
    Passthrough,
    /// The matched route's strategy produced the response.
    Handled(Response),
    /// The strategy failed and the catch handler produced the response.
    CatchHandled(Response),
    /// The strategy failed and no catch handler is set.
    Failed(SwError),
}

impl RouteOutcome {
    /// The response to hand back, if routing produced one.
    pub fn into_response(self) -> Result<Option<Response>, SwError> {
        match self {
            RouteOutcome::Passthrough => Ok(None),
            RouteOutcome::Handled(r) | RouteOutcome::CatchHandled(r) => Ok(Some(r)),
            RouteOutcome::Failed(e) => Err(e),
        }
    }
}

/// Ordered route table.
#[derive(Default)]
pub struct Router {
    scope: Option<Url>,
    routes: Vec<Route>,
    catch_handler: Option<Arc<dyn CatchHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router for a worker registered at `scope`; path matchers only apply
    /// to requests on the scope's origin.
    pub fn with_scope(scope: Url) -> Self {
        Self {
            scope: Some(scope),
            ..Self::default()
        }
    }

    pub fn register(&mut self, route: Route) {
        debug!(
            matcher = ?route.matcher,
            method = %route.method,
            strategy = route.strategy.name(),
            position = self.routes.len(),
            "Route registered"
        );
        self.routes.push(route);
    }

    pub fn set_catch_handler(&mut self, handler: Arc<dyn CatchHandler>) {
        self.catch_handler = Some(handler);
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    fn is_same_origin(&self, url: &Url) -> bool {
        match &self.scope {
            Some(scope) => scope.origin() == url.origin(),
            None => true,
        }
    }

    /// First route matching `request`.
    pub fn find_route(&self, request: &Request) -> Option<&Route> {
        let input = RouteInput {
            url: &request.url,
            request,
            same_origin: self.is_same_origin(&request.url),
        };
        self.routes.iter().find(|route| route.matches(&input))
    }

    /// Route `request` and run the chosen strategy.
    pub async fn handle_request(&self, ctx: &WorkerContext, request: Request) -> RouteOutcome {
        let Some(route) = self.find_route(&request) else {
            trace!(url = %request.url, method = %request.method, "No route matched");
            return RouteOutcome::Passthrough;
        };

        trace!(url = %request.url, strategy = route.strategy.name(), "Route matched");
        let error = match route.strategy.handle(ctx, request.clone()).await {
            Ok(response) => return RouteOutcome::Handled(response),
            Err(e) => e,
        };

        if error.is_recoverable() {
            debug!(url = %request.url, error = %error, "Route strategy failed");
        } else {
            warn!(url = %request.url, error = %error, "Route strategy failed");
        }

        match &self.catch_handler {
            Some(handler) => {
                RouteOutcome::CatchHandled(handler.handle(ctx, &request, &error).await)
            }
            None => RouteOutcome::Failed(error),
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("scope", &self.scope)
            .field("routes", &self.routes)
            .field("catch_handler", &self.catch_handler.is_some())
            .finish()
    }
}
