//! Category quota table and role tiers.
//!
//! The table is built once at startup, from the built-in defaults optionally
//! overridden by a YAML document, and is read-only afterwards. Role tiers
//! raise the effective quota per request without touching the table.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use super::counter::RateLimitConfig;
use crate::error::{Result, TurnstileError};

/// Call category; picks which quota applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    General,
    Auth,
    Upload,
    Download,
    ApiKey,
    Search,
    Admin,
    Public,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::General,
        Category::Auth,
        Category::Upload,
        Category::Download,
        Category::ApiKey,
        Category::Search,
        Category::Admin,
        Category::Public,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::General => "general",
            Category::Auth => "auth",
            Category::Upload => "upload",
            Category::Download => "download",
            Category::ApiKey => "api-key",
            Category::Search => "search",
            Category::Admin => "admin",
            Category::Public => "public",
        }
    }

    /// Quota shipped with the service.
    pub const fn builtin_limit(&self) -> RateLimitConfig {
        const MINUTE: u64 = 60_000;
        match self {
            Category::General => RateLimitConfig::from_parts(MINUTE, 100),
            Category::Auth => RateLimitConfig::from_parts(5 * MINUTE, 10),
            Category::Upload => RateLimitConfig::from_parts(60 * MINUTE, 20),
            Category::Download => RateLimitConfig::from_parts(10 * MINUTE, 30),
            Category::ApiKey => RateLimitConfig::from_parts(60 * MINUTE, 5),
            Category::Search => RateLimitConfig::from_parts(MINUTE, 30),
            Category::Admin => RateLimitConfig::from_parts(MINUTE, 100),
            Category::Public => RateLimitConfig::from_parts(MINUTE, 20),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| TurnstileError::UnknownCategory(s.to_string()))
    }
}

/// Quota uplift for a role: `multiplier` times the base, capped at `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTier {
    pub multiplier: u64,
    pub ceiling: u64,
}

impl RoleTier {
    pub fn new(multiplier: u64, ceiling: u64) -> Result<Self> {
        let tier = Self { multiplier, ceiling };
        tier.validate()?;
        Ok(tier)
    }

    fn validate(&self) -> Result<()> {
        if self.multiplier == 0 {
            return Err(TurnstileError::InvalidLimit {
                field: "multiplier",
                value: self.multiplier,
            });
        }
        if self.ceiling == 0 {
            return Err(TurnstileError::InvalidLimit {
                field: "ceiling",
                value: self.ceiling,
            });
        }
        Ok(())
    }

    /// Effective quota for a base quota. Never below the base.
    pub fn apply(&self, base: u64) -> u64 {
        base.saturating_mul(self.multiplier)
            .min(self.ceiling)
            .max(base)
    }
}

/// Override document as it appears on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RulesDocument {
    #[serde(default)]
    limits: HashMap<Category, RateLimitConfig>,
    #[serde(default)]
    role_tiers: Option<HashMap<String, RoleTier>>,
}

/// Category → quota table plus role tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitTable {
    limits: HashMap<Category, RateLimitConfig>,
    role_tiers: HashMap<String, RoleTier>,
}

impl RateLimitTable {
    /// The built-in table and tiers (`admin` ×3 up to 1000, `manager` ×2 up to 500).
    pub fn builtin() -> Self {
        let limits = Category::ALL
            .into_iter()
            .map(|c| (c, c.builtin_limit()))
            .collect();

        let role_tiers = HashMap::from([
            ("admin".to_string(), RoleTier { multiplier: 3, ceiling: 1000 }),
            ("manager".to_string(), RoleTier { multiplier: 2, ceiling: 500 }),
        ]);

        Self { limits, role_tiers }
    }

    /// Load overrides from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load overrides from a YAML string.
    ///
    /// Categories absent from the document keep their built-in quota; a
    /// `role_tiers` section replaces the built-in tiers entirely.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: RulesDocument = if yaml.trim().is_empty() {
            RulesDocument::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|e| {
                TurnstileError::Config(format!("Failed to parse rate limit rules: {}", e))
            })?
        };

        let mut table = Self::builtin();
        table.limits.extend(document.limits);

        if let Some(tiers) = document.role_tiers {
            for tier in tiers.values() {
                tier.validate()?;
            }
            table.role_tiers = tiers;
        }

        Ok(table)
    }

    /// Base quota for a category.
    pub fn get(&self, category: Category) -> RateLimitConfig {
        self.limits
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.builtin_limit())
    }

    pub fn role_tier(&self, role: &str) -> Option<&RoleTier> {
        self.role_tiers.get(role)
    }

    /// Effective quota for one request.
    ///
    /// With `adjust` set and a tier registered for `role`, the quota is
    /// raised per the tier; otherwise the base quota is returned.
    pub fn resolve(&self, category: Category, role: Option<&str>, adjust: bool) -> RateLimitConfig {
        let base = self.get(category);
        if !adjust {
            return base;
        }

        match role.and_then(|r| self.role_tier(r)) {
            Some(tier) => base.with_max_requests(tier.apply(base.max_requests())),
            None => base,
        }
    }

    /// Snapshot for listing, ordered by category.
    pub fn limits(&self) -> BTreeMap<Category, RateLimitConfig> {
        Category::ALL.into_iter().map(|c| (c, self.get(c))).collect()
    }

    pub fn role_tiers(&self) -> BTreeMap<String, RoleTier> {
        self.role_tiers
            .iter()
            .map(|(role, tier)| (role.clone(), *tier))
            .collect()
    }
}

impl Default for RateLimitTable {
    fn default() -> Self {
        Self::builtin()
    }
}
