//! Load pre-declared recipe bundles from JSON documents into a waylay
//! registry. The loader is a translator: its only effect is to emit
//! equivalent builder calls against the registry you pass in.
//!
//! **This crate is not semver compliant**. The version is locked to the root
//! `waylay` crate version. If you choose to depend directly on this crate,
//! you do so at your own risk of breakage.

mod document;
mod load;

pub use document::{Bundle, BundleItem};
pub use load::{BundleError, from_file, from_json, from_reader};
