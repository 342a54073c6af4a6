//! Product identifiers and match results.

use crate::error::{FingerprintError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const WILDCARD: &str = "*";
const DEFAULT_PART: &str = "a";

/// Common Platform Enumeration identifier.
///
/// Empty fields are unset; they render as `*` (and `part` as `a`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Cpe {
    pub part: String,
    pub vendor: String,
    pub product: String,
    pub version: String,
    pub update: String,
    pub edition: String,
    pub language: String,
}

impl Cpe {
    pub fn product(product: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            ..Self::default()
        }
    }

    /// Parse the `cpe:/part:vendor:product:...` form. Missing trailing
    /// components stay unset.
    pub fn parse(text: &str) -> Result<Self> {
        let body = text
            .trim()
            .strip_prefix("cpe:/")
            .ok_or_else(|| FingerprintError::InvalidCpe(text.to_string()))?;

        let mut parts = body.split(':').map(|p| {
            if p == WILDCARD {
                String::new()
            } else {
                p.to_string()
            }
        });
        let mut next = || parts.next().unwrap_or_default();

        let cpe = Self {
            part: next(),
            vendor: next(),
            product: next(),
            version: next(),
            update: next(),
            edition: next(),
            language: next(),
        };
        if parts.next().is_some() {
            return Err(FingerprintError::InvalidCpe(text.to_string()));
        }
        Ok(cpe)
    }

    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|f| f.is_empty())
    }

    /// Copy every set component of `other` over `self`.
    pub fn overlay(&mut self, other: &Cpe) {
        let pairs = [
            (&mut self.part, &other.part),
            (&mut self.vendor, &other.vendor),
            (&mut self.product, &other.product),
            (&mut self.version, &other.version),
            (&mut self.update, &other.update),
            (&mut self.edition, &other.edition),
            (&mut self.language, &other.language),
        ];
        for (dst, src) in pairs {
            if !src.is_empty() {
                dst.clone_from(src);
            }
        }
    }

    fn fields(&self) -> [&str; 7] {
        [
            &self.part,
            &self.vendor,
            &self.product,
            &self.version,
            &self.update,
            &self.edition,
            &self.language,
        ]
    }
}

impl fmt::Display for Cpe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .fields()
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                if value.is_empty() {
                    (if idx == 0 { DEFAULT_PART } else { WILDCARD }).to_string()
                } else {
                    value.to_lowercase().replace(' ', "_")
                }
            })
            .collect();
        write!(f, "cpe:/{}", rendered.join(":"))
    }
}

/// Identification produced by a successful match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintInfo {
    pub protocol: String,
    pub service_name: String,
    pub product: String,
    pub info: String,
    pub version: String,
    pub device_type: String,
    pub cpe: Cpe,
    /// The substring of the response that produced the match.
    pub raw: String,
}

impl FingerprintInfo {
    pub fn with_cpe(cpe: Cpe) -> Self {
        Self {
            cpe,
            ..Self::default()
        }
    }

    /// Merge a more specific record (a nested node's info, or the fields
    /// captured by a regex) into this one. Set fields of `other` win.
    pub fn overlay(&mut self, other: &FingerprintInfo) {
        let pairs = [
            (&mut self.protocol, &other.protocol),
            (&mut self.service_name, &other.service_name),
            (&mut self.product, &other.product),
            (&mut self.info, &other.info),
            (&mut self.version, &other.version),
            (&mut self.device_type, &other.device_type),
            (&mut self.raw, &other.raw),
        ];
        for (dst, src) in pairs {
            if !src.is_empty() {
                dst.clone_from(src);
            }
        }
        self.cpe.overlay(&other.cpe);
        if self.version.is_empty() {
            self.version.clone_from(&self.cpe.version);
        }
        if self.product.is_empty() {
            self.product.clone_from(&self.cpe.product);
        }
    }
}
