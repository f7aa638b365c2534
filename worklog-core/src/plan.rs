use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
}

impl Plan {
    /// Limits applied when the account payload carries no explicit override.
    pub fn default_limits(&self) -> SubscriptionLimits {
        match self {
            Plan::Free => SubscriptionLimits {
                max_entries_per_month: Some(30),
                max_platforms: Some(2),
                history_days: Some(90),
                csv_export: false,
                reminders: false,
            },
            Plan::Pro => SubscriptionLimits {
                max_entries_per_month: None,
                max_platforms: None,
                history_days: None,
                csv_export: true,
                reminders: true,
            },
        }
    }
}

/// Plan entitlements. `None` means unrestricted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SubscriptionLimits {
    #[serde(default)]
    pub max_entries_per_month: Option<u32>,
    #[serde(default)]
    pub max_platforms: Option<u32>,
    #[serde(default)]
    pub history_days: Option<u32>,
    #[serde(default)]
    pub csv_export: bool,
    #[serde(default)]
    pub reminders: bool,
}

impl SubscriptionLimits {
    pub fn unrestricted() -> Self {
        Plan::Pro.default_limits()
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct AccountUsage {
    #[serde(default)]
    pub entries_this_month: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountInfo {
    pub account_id: String,
    pub plan: Plan,
    #[serde(default)]
    pub limits: Option<SubscriptionLimits>,
    #[serde(default)]
    pub usage: AccountUsage,
}

impl AccountInfo {
    pub fn effective_limits(&self) -> SubscriptionLimits {
        self.limits
            .clone()
            .unwrap_or_else(|| self.plan.default_limits())
    }
}
