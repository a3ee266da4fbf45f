//! Core matching-and-dispatch engine for waylay: recipes, the matcher
//! algebra, the scoped registry, and the dispatcher that turns an outgoing
//! HTTP request into a synthesized response without touching the network.
//!
//! **This crate is not semver compliant**. The version is locked to the root
//! `waylay` crate version. If you choose to depend directly on this crate, you
//! do so at your own risk of breakage.

pub mod builder;
pub mod http;
pub mod matcher;
pub mod recipe;
pub mod registry;
#[cfg(any(test, feature = "test"))]
pub mod test_util;
