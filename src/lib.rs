//! In-process HTTP request interception for tests. waylay sits between your
//! HTTP client and the network: instead of dispatching a request, it matches
//! the request against registered recipes and synthesizes a response
//! locally. No server is started and no port is bound.
//!
//! ```
//! use std::sync::Arc;
//! use waylay::{
//!     HttpMethod, InterceptedRequest, Interceptor, RecipeBuilder, Registry,
//! };
//!
//! # async fn example() {
//! let registry = Arc::new(Registry::new());
//! RecipeBuilder::new()
//!     .requests()
//!     .method(HttpMethod::Get)
//!     .host("api.example")
//!     .path("/terms")
//!     .responds()
//!     .json(&serde_json::json!({"id": 1}))
//!     .register_with(&registry)
//!     .unwrap();
//!
//! let request = InterceptedRequest::new(
//!     HttpMethod::Get,
//!     "https://api.example/terms".parse().unwrap(),
//! );
//! let interceptor = Interceptor::new(Arc::clone(&registry));
//! let response = interceptor.dispatch(&request).await.unwrap();
//! assert_eq!(response.status.as_u16(), 200);
//! # }
//! ```

pub use waylay_core::{
    builder::{RecipeBuildError, RecipeBuilder},
    http::{
        DispatchError, HttpMethod, HttpVersion, InterceptHook,
        InterceptedRequest, Interceptor, RequestBody, ResponseBody,
        SynthesizedResponse,
    },
    matcher::RequestMatcher,
    recipe::{CanonicalKey, KeyPart, QueryKey, Recipe, RecipeId, UserData},
    registry::{Registry, ScopeHandle},
};

#[cfg(feature = "bundle")]
pub use waylay_bundle as bundle;

#[cfg(feature = "test")]
pub use waylay_core::test_util;
