//! Dispatch logic and the hook seam. [Interceptor] is the entrypoint: it
//! turns an outgoing request into a synthesized response without any network
//! I/O. This is the life cycle of an intercepted request:
//!
//! ```no_test
//! +-------------------+
//! | InterceptedRequest|
//! +-------------------+
//!      |
//!   lookup
//!      |
//!      +--none--> fallback producer --none--> strict? --+
//!      |                |                               |
//!      v                v                          yes / \ no
//! +--------+      +----------+                        |   |
//! | Recipe |      | response |              Unmatched-+   +-empty 200
//! +--------+      +----------+
//!      |
//!   callback ------error/cancel------> propagated
//!      |
//!  synthesize
//!      |
//!      v
//! +---------------------+
//! | SynthesizedResponse |
//! +---------------------+
//! ```

mod models;
#[cfg(test)]
mod tests;

pub use models::*;

use crate::{recipe::Recipe, registry::Registry};
use std::sync::Arc;
use tracing::{debug, info, info_span};

/// The dispatcher: selects a recipe for each outgoing request, runs its
/// callbacks, and materializes the response. Cheap to clone; the registry is
/// shared behind an `Arc`.
#[derive(Clone)]
pub struct Interceptor {
    registry: Arc<Registry>,
}

impl Interceptor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Turn one outgoing request into a synthesized response. Honors the
    /// request's cancellation signal at every suspension point: a fired
    /// signal yields [DispatchError::Cancelled], never a half-built
    /// response.
    pub async fn dispatch(
        &self,
        request: &InterceptedRequest,
    ) -> Result<SynthesizedResponse, DispatchError> {
        let _ = info_span!(
            "Dispatch request",
            method = %request.method(),
            url = %request.url(),
        )
        .entered();

        if request.cancellation().is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let Some(recipe) = self.registry.lookup(request) else {
            return self.missing(request);
        };

        let result = self.run_recipe(&recipe, request).await;
        // A single-use recipe was claimed by lookup; drop it from its scope
        // layer whether or not the dispatch succeeded
        if !recipe.is_reusable() {
            self.registry.remove_consumed(recipe.id());
        }
        let mut response = result?;

        self.registry.apply_mutators(&mut response);
        info!(status = response.status.as_u16(), "Synthesized response");
        Ok(response)
    }

    /// Run the recipe's pre-dispatch callback, then synthesize the response
    async fn run_recipe(
        &self,
        recipe: &Recipe,
        request: &InterceptedRequest,
    ) -> Result<SynthesizedResponse, DispatchError> {
        if let Some(callback) = recipe.callback() {
            request
                .cancellation()
                .run_until_cancelled(callback(request, recipe.user_data()))
                .await
                .ok_or(DispatchError::Cancelled)??;
        }
        recipe.synthesize(request).await
    }

    /// The missing-recipe path: fallback producer, then strict failure or
    /// the permissive sentinel
    fn missing(
        &self,
        request: &InterceptedRequest,
    ) -> Result<SynthesizedResponse, DispatchError> {
        if let Some(response) = self.registry.fallback(request) {
            debug!("Fallback produced a response for unmatched request");
            return Ok(response);
        }
        if self.registry.is_strict() {
            Err(DispatchError::Unmatched {
                method: request.method(),
                url: request.url().clone(),
            })
        } else {
            debug!("No recipe matched; returning sentinel empty response");
            Ok(SynthesizedResponse::empty())
        }
    }
}

/// The adapter between the host HTTP stack and the dispatcher. It has no
/// state of its own: wire [Self::handle] into whatever extension seam the
/// host client offers (for reqwest, convert via
/// `InterceptedRequest::try_from(&request)` on the way in and
/// [SynthesizedResponse::into_http] on the way out).
#[derive(Clone)]
pub struct InterceptHook {
    interceptor: Interceptor,
}

impl InterceptHook {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            interceptor: Interceptor::new(registry),
        }
    }

    /// The single sink: request in, synthesized response out
    pub async fn handle(
        &self,
        request: &InterceptedRequest,
    ) -> Result<SynthesizedResponse, DispatchError> {
        self.interceptor.dispatch(request).await
    }
}
