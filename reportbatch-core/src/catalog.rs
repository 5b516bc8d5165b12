//! Portfolio catalogs.
//!
//! The TOML catalog is an ordered array of tables:
//!
//! ```toml
//! [[portfolio]]
//! id = "8001"
//! name = "Fund Alpha"
//! ```
//!
//! Order is preserved; it defines the work-list order of a batch.

use crate::domain::Portfolio;
use crate::ports::{CatalogError, PortfolioCatalog};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "portfolio")]
    portfolios: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    name: String,
}

/// Catalog loaded from a TOML document.
#[derive(Debug, Clone)]
pub struct TomlCatalog {
    portfolios: Vec<Portfolio>,
}

impl TomlCatalog {
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(content)?;
        let portfolios = file
            .portfolios
            .into_iter()
            .map(|e| Portfolio::new(e.id, e.name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { portfolios })
    }

    pub fn len(&self) -> usize {
        self.portfolios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.portfolios.is_empty()
    }
}

impl PortfolioCatalog for TomlCatalog {
    fn list_portfolios(&self) -> Result<Vec<Portfolio>, CatalogError> {
        Ok(self.portfolios.clone())
    }
}

/// Fixed in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog(pub Vec<Portfolio>);

impl PortfolioCatalog for StaticCatalog {
    fn list_portfolios(&self) -> Result<Vec<Portfolio>, CatalogError> {
        Ok(self.0.clone())
    }
}

/// The catalog entries named by `ids`, in catalog order.
///
/// An empty `ids` selects everything. Ids are trimmed and repeats ignored;
/// any id missing from the catalog is an error.
pub fn select_portfolios(
    portfolios: &[Portfolio],
    ids: &[String],
) -> Result<Vec<Portfolio>, CatalogError> {
    if ids.is_empty() {
        return Ok(portfolios.to_vec());
    }
    let wanted: Vec<&str> = ids.iter().map(|id| id.trim()).collect();
    let mut unknown: Vec<String> = Vec::new();
    for id in &wanted {
        if !portfolios.iter().any(|p| p.id == *id) && !unknown.iter().any(|u| u == id) {
            unknown.push(id.to_string());
        }
    }
    if !unknown.is_empty() {
        return Err(CatalogError::Unknown { ids: unknown });
    }
    Ok(portfolios
        .iter()
        .filter(|p| wanted.contains(&p.id.as_str()))
        .cloned()
        .collect())
}
