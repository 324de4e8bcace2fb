use thiserror::Error;

use crate::catalog::CatalogError;
use crate::lock::LockError;
use crate::provider::ProviderError;
use crate::store::{RegistryError, StateError};

#[derive(Debug, Error)]
pub enum StocksmithError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Batch state error: {0}")]
    State(#[from] StateError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
