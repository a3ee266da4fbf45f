//! Translation from a parsed bundle document into registered recipes

use crate::document::{
    Bundle, BundleItem, OneOrMany, StatusField, parse_status_name,
};
use base64::{Engine, prelude::BASE64_STANDARD};
use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;
use waylay_core::{
    builder::{RecipeBuildError, RecipeBuilder},
    http::{HttpMethodParseError, HttpVersionParseError},
    registry::Registry,
};

/// The schema version this loader understands
const SUPPORTED_VERSION: u32 = 1;

/// An error that can occur while loading a bundle. Nothing is registered
/// past the first faulty item; earlier items stay registered.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("Error reading bundle file `{path}`")]
    Io {
        path: String,
        #[source]
        error: io::Error,
    },

    #[error("Error parsing bundle document")]
    Parse(#[from] serde_json::Error),

    #[error(
        "Unsupported bundle version {0}; this loader understands version \
        {SUPPORTED_VERSION}"
    )]
    UnsupportedVersion(u32),

    #[error("Item `{item}` has no `uri`")]
    MissingUri { item: String },

    #[error("Item `{item}` has an invalid `uri`")]
    InvalidUri {
        item: String,
        #[source]
        error: url::ParseError,
    },

    #[error("Item `{item}` has an invalid `method`")]
    InvalidMethod {
        item: String,
        #[source]
        error: HttpMethodParseError,
    },

    #[error("Item `{item}` has an invalid `version`")]
    InvalidVersion {
        item: String,
        #[source]
        error: HttpVersionParseError,
    },

    #[error("Item `{item}` has an unknown status name `{status}`")]
    UnknownStatus { item: String, status: String },

    #[error("Item `{item}` has an unknown content format `{format}`")]
    UnknownContentFormat { item: String, format: String },

    #[error("Item `{item}` has invalid base64 content")]
    Base64 {
        item: String,
        #[source]
        error: base64::DecodeError,
    },

    #[error("Error registering item `{item}`")]
    Register {
        item: String,
        #[source]
        error: RecipeBuildError,
    },
}

/// Load a bundle from a JSON string and register its items. Returns the
/// number of recipes registered (skipped items don't count).
pub fn from_json(
    json: &str,
    registry: &Registry,
) -> Result<usize, BundleError> {
    load(serde_json::from_str(json)?, registry)
}

/// Load a bundle from a reader
pub fn from_reader(
    reader: impl Read,
    registry: &Registry,
) -> Result<usize, BundleError> {
    load(serde_json::from_reader(reader)?, registry)
}

/// Load a bundle from a file on disk
pub fn from_file(
    path: impl AsRef<Path>,
    registry: &Registry,
) -> Result<usize, BundleError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|error| BundleError::Io {
        path: path.display().to_string(),
        error,
    })?;
    from_reader(io::BufReader::new(file), registry)
}

fn load(bundle: Bundle, registry: &Registry) -> Result<usize, BundleError> {
    if let Some(version) = bundle.version
        && version != SUPPORTED_VERSION
    {
        return Err(BundleError::UnsupportedVersion(version));
    }

    let mut registered = 0;
    for (index, item) in bundle.items.iter().enumerate() {
        let label = item.label(index);
        if item.skip {
            debug!(item = %label, "Skipping bundle item");
            continue;
        }
        register_item(item, &label, registry)?;
        registered += 1;
    }
    info!(
        bundle = bundle.id.as_deref().unwrap_or_default(),
        registered, "Loaded bundle"
    );
    Ok(registered)
}

/// Emit the builder calls equivalent to one bundle item
fn register_item(
    item: &BundleItem,
    label: &str,
    registry: &Registry,
) -> Result<(), BundleError> {
    let uri = item.uri.as_deref().ok_or_else(|| BundleError::MissingUri {
        item: label.to_owned(),
    })?;
    let url: Url = uri.parse().map_err(|error| BundleError::InvalidUri {
        item: label.to_owned(),
        error,
    })?;
    let method = item
        .method
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(|error| BundleError::InvalidMethod {
            item: label.to_owned(),
            error,
        })?
        .unwrap_or(waylay_core::http::HttpMethod::Get);

    let mut builder =
        RecipeBuilder::new().requests().method(method).scheme(url.scheme());
    if let Some(port) = url.port() {
        builder = builder.port(port);
    }
    if item.ignore_host {
        builder = builder.any_host();
    } else if let Some(host) = url.host_str() {
        builder = builder.host(host);
    }
    if !item.ignore_path {
        builder = builder.path(url.path());
    }
    if !item.ignore_query {
        // An absent query in the URI means "require no query", which is the
        // empty verbatim string
        builder = builder.query(url.query().unwrap_or_default());
    }
    for (name, values) in &item.request_headers {
        builder = builder.requires_header_values(name, values.values());
    }
    if let Some(priority) = item.priority {
        builder = builder.priority(priority);
    }

    builder = builder.responds();
    if let Some(status) = &item.status {
        let status = match status {
            StatusField::Code(code) => *code,
            StatusField::Name(name) => parse_status_name(name)
                .ok_or_else(|| BundleError::UnknownStatus {
                    item: label.to_owned(),
                    status: name.clone(),
                })?
                .as_u16(),
        };
        builder = builder.status(status);
    }
    if let Some(version) = &item.version {
        let version = version.parse().map_err(|error| {
            BundleError::InvalidVersion {
                item: label.to_owned(),
                error,
            }
        })?;
        builder = builder.version(version);
    }
    builder = apply_headers(builder, &item.response_headers, false);
    builder = apply_headers(builder, &item.content_headers, true);
    builder = apply_content(builder, item, label)?;

    builder
        .register_with(registry)
        .map_err(|error| BundleError::Register {
            item: label.to_owned(),
            error,
        })?;
    Ok(())
}

fn apply_headers(
    mut builder: RecipeBuilder,
    headers: &indexmap::IndexMap<String, OneOrMany>,
    content: bool,
) -> RecipeBuilder {
    for (name, values) in headers {
        for value in values.values() {
            builder = if content {
                builder.content_header(name, value)
            } else {
                builder.response_header(name, value)
            };
        }
    }
    builder
}

fn apply_content(
    builder: RecipeBuilder,
    item: &BundleItem,
    label: &str,
) -> Result<RecipeBuilder, BundleError> {
    let format = item.content_format.as_deref().unwrap_or("string");
    match format {
        "string" => Ok(match &item.content_string {
            Some(content) => builder.content(content.clone()),
            None => builder,
        }),
        "json" => match &item.content_json {
            Some(value) => Ok(builder.content(serde_json::to_vec(value)?)),
            None => Ok(builder),
        },
        "base64" => match &item.content_base64 {
            Some(encoded) => {
                let bytes =
                    BASE64_STANDARD.decode(encoded).map_err(|error| {
                        BundleError::Base64 {
                            item: label.to_owned(),
                            error,
                        }
                    })?;
                Ok(builder.content(bytes))
            }
            None => Ok(builder),
        },
        other => Err(BundleError::UnknownContentFormat {
            item: label.to_owned(),
            format: other.to_owned(),
        }),
    }
}
