//! Portfolio: the unit of work for one report request.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortfolioError {
    #[error("portfolio id must not be empty")]
    EmptyId,

    #[error("portfolio '{id}' has an empty name")]
    EmptyName { id: String },

    #[error("portfolio id '{id}' may only contain letters, digits and '-'")]
    InvalidId { id: String },
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

/// A named fund or account for which reports are requested.
///
/// Both fields are trimmed on construction and must be non-empty. Ids are
/// restricted to ASCII letters, digits and `-` so they can name files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: String,
    pub name: String,
}

impl Portfolio {
    pub fn new(id: impl AsRef<str>, name: impl AsRef<str>) -> Result<Self, PortfolioError> {
        let id = id.as_ref().trim();
        let name = name.as_ref().trim();
        if id.is_empty() {
            return Err(PortfolioError::EmptyId);
        }
        if !id.chars().all(is_id_char) {
            return Err(PortfolioError::InvalidId { id: id.to_string() });
        }
        if name.is_empty() {
            return Err(PortfolioError::EmptyName { id: id.to_string() });
        }
        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
        })
    }

    /// File-system friendly stem for this portfolio's artifacts.
    ///
    /// The id part never contains `_`, so the first `_` separates id from
    /// name and distinct ids never share a stem. Ids that bypassed
    /// [`Portfolio::new`] (e.g. deserialized) are filtered the same way.
    pub fn file_stem(&self) -> String {
        let id: String = self
            .id
            .chars()
            .map(|c| if is_id_char(c) { c } else { '-' })
            .collect();
        let name: String = self
            .name
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect();
        format!("{}_{}", id, name.trim_matches('_'))
    }
}

impl std::fmt::Display for Portfolio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
