//! Offline fallback for failed navigations.

use async_trait::async_trait;
use swkit_net::{Request, RequestDestination, Response};
use tracing::debug;
use url::Url;

use crate::context::WorkerContext;
use crate::error::SwError;
use crate::router::CatchHandler;
use crate::strategy::Strategy;

/// Serves the offline page in place of a failed document request.
///
/// Only document requests get a substitute; every other destination gets a
/// network error, since replacing a script or API response with an HTML page
/// would break the page instead of telling it the request failed.
#[derive(Debug, Clone)]
pub struct OfflineFallback {
    fallback_url: Url,
    strategy: Strategy,
}

impl OfflineFallback {
    /// `strategy` should be the one that warmed `fallback_url`.
    pub fn new(fallback_url: Url, strategy: Strategy) -> Self {
        Self {
            fallback_url,
            strategy,
        }
    }

    pub fn fallback_url(&self) -> &Url {
        &self.fallback_url
    }

    pub async fn respond(&self, ctx: &WorkerContext, request: &Request) -> Response {
        if request.destination != RequestDestination::Document {
            debug!(
                url = %request.url,
                destination = request.destination.as_str(),
                "No fallback for non-document request"
            );
            return Response::error();
        }

        match self
            .strategy
            .handle(ctx, Request::get(self.fallback_url.clone()))
            .await
        {
            Ok(response) => {
                debug!(url = %request.url, fallback = %self.fallback_url, "Serving offline fallback");
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Offline fallback unavailable");
                Response::error()
            }
        }
    }
}

#[async_trait]
impl CatchHandler for OfflineFallback {
    async fn handle(&self, ctx: &WorkerContext, request: &Request, error: &SwError) -> Response {
        debug!(url = %request.url, error = %error, "Catch handler invoked");
        self.respond(ctx, request).await
    }
}
