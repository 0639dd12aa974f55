//! Platform-supplied hardware and analysis metadata.

use serde::{Deserialize, Serialize};

/// Core types and analysis codes offered by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCatalog {
    pub core_types: Vec<String>,
    pub analysis_codes: Vec<String>,
}

impl PlatformCatalog {
    pub fn new(core_types: Vec<String>, analysis_codes: Vec<String>) -> Self {
        Self {
            core_types,
            analysis_codes,
        }
    }

    pub fn has_core_type(&self, code: &str) -> bool {
        self.core_types.iter().any(|c| c.eq_ignore_ascii_case(code))
    }

    pub fn has_analysis_code(&self, code: &str) -> bool {
        self.analysis_codes.iter().any(|c| c.eq_ignore_ascii_case(code))
    }
}
