//! Per-user authorization state

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Account status of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Normal account
    #[default]
    Active,
    /// Account disabled by an operator or billing
    Suspended,
}

/// Derived authorization context of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    /// Account status
    pub account_status: AccountStatus,
    /// Plan identifier
    pub plan_id: String,
    /// Tool calls recorded today
    pub daily_used: u64,
    /// Tool calls allowed per day by the plan
    pub daily_limit: u64,
    /// Modules the user enabled
    #[serde(default)]
    pub enabled_modules: BTreeSet<String>,
    /// Enabled tools per module; a module without an entry enables all its tools
    #[serde(default)]
    pub enabled_tools: BTreeMap<String, BTreeSet<String>>,
    /// Human-readable module descriptions
    #[serde(default)]
    pub module_descriptions: BTreeMap<String, String>,
}

impl UserContext {
    /// Whether `requested` more calls fit into today's allowance.
    ///
    /// This is the only admission predicate: `daily_used + requested <= daily_limit`.
    #[must_use]
    pub fn within_daily_limit(&self, requested: u64) -> bool {
        self.daily_used
            .checked_add(requested)
            .is_some_and(|total| total <= self.daily_limit)
    }

    /// Whether the account may use tools at all
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.account_status == AccountStatus::Active
    }

    /// Whether the user enabled `module`
    #[must_use]
    pub fn is_module_enabled(&self, module: &str) -> bool {
        self.enabled_modules.contains(module)
    }

    /// Whether `tool` of `module` is enabled
    #[must_use]
    pub fn is_tool_enabled(&self, module: &str, tool: &str) -> bool {
        if !self.is_module_enabled(module) {
            return false;
        }
        self.enabled_tools
            .get(module)
            .is_none_or(|tools| tools.contains(tool))
    }
}
