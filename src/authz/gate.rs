//! Tool admission
//!
//! Single entry point a module wrapper calls before executing a tool: checks
//! entitlement against the user's context, fetches (and refreshes) the module
//! credential, then records usage.

use std::sync::Arc;

use tracing::debug;

use super::{AuthorizationContext, UserContext};
use crate::broker::TokenBroker;
use crate::credential::Credential;
use crate::{Error, Result};

/// Everything a module needs to run an admitted tool call
#[derive(Debug, Clone)]
pub struct ToolGrant {
    /// Provider credential, refreshed if it was near expiry
    pub credential: Credential,
    /// User context the decision was made on
    pub context: UserContext,
}

/// Admission check for tool calls
pub struct ToolGate {
    authz: Arc<AuthorizationContext>,
    broker: Arc<TokenBroker>,
}

impl ToolGate {
    /// Create a gate over the given context cache and broker
    pub fn new(authz: Arc<AuthorizationContext>, broker: Arc<TokenBroker>) -> Self {
        Self { authz, broker }
    }

    /// Admit `count` calls of `module:tool` for a user.
    ///
    /// Usage is recorded only after the credential was obtained.
    ///
    /// # Errors
    ///
    /// - [`Error::AccountSuspended`] if the account is not active
    /// - [`Error::ModuleDisabled`] / [`Error::ToolDisabled`] if not enabled
    /// - [`Error::QuotaExceeded`] if the call would exceed the daily limit
    /// - any error of [`TokenBroker::get_module_token`]
    pub async fn authorize(&self, user_id: &str, module: &str, tool: &str, count: u64) -> Result<ToolGrant> {
        let context = self.authz.get_user_context(user_id).await?;
        check_entitlement(&context, module, tool, count)?;

        let credential = self.broker.get_module_token(user_id, module).await?;
        self.authz.record_usage(user_id, module, tool, count);

        debug!(user_id = %user_id, module = %module, tool = %tool, count, "Tool call admitted");
        Ok(ToolGrant { credential, context })
    }
}

/// Pure entitlement check, in order: account, module, tool, quota
pub(crate) fn check_entitlement(context: &UserContext, module: &str, tool: &str, count: u64) -> Result<()> {
    if !context.is_active() {
        return Err(Error::AccountSuspended("suspended".to_string()));
    }
    if !context.is_module_enabled(module) {
        return Err(Error::ModuleDisabled(module.to_string()));
    }
    if !context.is_tool_enabled(module, tool) {
        return Err(Error::ToolDisabled {
            module: module.to_string(),
            tool: tool.to_string(),
        });
    }
    if !context.within_daily_limit(count) {
        return Err(Error::QuotaExceeded {
            used: context.daily_used,
            limit: context.daily_limit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::authz::AccountStatus;

    fn context() -> UserContext {
        UserContext {
            account_status: AccountStatus::Active,
            plan_id: "free".to_string(),
            daily_used: 9,
            daily_limit: 10,
            enabled_modules: BTreeSet::from(["notion".to_string()]),
            enabled_tools: BTreeMap::from([(
                "notion".to_string(),
                BTreeSet::from(["search".to_string()]),
            )]),
            module_descriptions: BTreeMap::new(),
        }
    }

    #[test]
    fn admits_enabled_tool_within_quota() {
        assert!(check_entitlement(&context(), "notion", "search", 1).is_ok());
    }

    #[test]
    fn rejects_in_order() {
        let mut ctx = context();
        assert!(matches!(
            check_entitlement(&ctx, "notion", "search", 2),
            Err(Error::QuotaExceeded { used: 9, limit: 10 })
        ));
        assert!(matches!(
            check_entitlement(&ctx, "notion", "delete_page", 1),
            Err(Error::ToolDisabled { .. })
        ));
        assert!(matches!(
            check_entitlement(&ctx, "github", "search", 1),
            Err(Error::ModuleDisabled(m)) if m == "github"
        ));

        ctx.account_status = AccountStatus::Suspended;
        assert!(matches!(
            check_entitlement(&ctx, "notion", "search", 1),
            Err(Error::AccountSuspended(_))
        ));
    }
}
