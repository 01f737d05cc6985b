//! Static backend registry.
//!
//! Maps a backend identifier to a constructor function, populated at
//! process start. An unknown identifier is a validation error, not a
//! runtime lookup failure.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use lazy_static::lazy_static;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use super::http::HttpBackend;
use super::mock::MockBackend;
use super::{Backend, BackendConfig};
use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum BackendKind {
    Http,
    Mock,
}

type Constructor = fn(&BackendConfig) -> Result<Arc<dyn Backend>>;

fn build_http(config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    let backend = HttpBackend::new(config.clone()).map_err(Error::Backend)?;
    Ok(Arc::new(backend))
}

fn build_mock(_config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    Ok(Arc::new(MockBackend::new(Vec::new())))
}

lazy_static! {
    static ref REGISTRY: HashMap<BackendKind, Constructor> = {
        let mut registry = HashMap::new();
        registry.insert(BackendKind::Http, build_http as Constructor);
        registry.insert(BackendKind::Mock, build_mock as Constructor);
        registry
    };
}

/// The identifiers `resolve` accepts.
pub fn known_backends() -> Vec<String> {
    BackendKind::iter().map(|kind| kind.to_string()).collect()
}

/// Construct the backend registered under `id`.
pub fn resolve(id: &str, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    let kind = BackendKind::from_str(id).map_err(|_| {
        Error::Validation(format!(
            "Unknown backend '{}', expected one of: {}",
            id,
            known_backends().join(", ")
        ))
    })?;
    let constructor = REGISTRY
        .get(&kind)
        .ok_or_else(|| Error::Validation(format!("Backend '{id}' is not registered")))?;
    constructor(config)
}
