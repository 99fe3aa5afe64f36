//! Tab host abstraction — how the broker reaches the browser.

use std::sync::Arc;

use async_trait::async_trait;
use chorus_core::{Result, Target};

use crate::driver::TabDriver;

/// An open browser tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: u64,
    pub url: String,
}

/// Access to the set of open tabs and to per-tab drivers.
#[async_trait]
pub trait TabHost: Send + Sync {
    async fn list_tabs(&self) -> Result<Vec<TabInfo>>;

    /// Bind a driver to a tab. Reviving a dead listener re-attaches to the
    /// already-identified tab through the same path.
    async fn attach(&self, tab: &TabInfo) -> Result<Arc<dyn TabDriver>>;
}

/// First open tab matching the target's URL patterns, if any.
pub async fn find_tab(host: &dyn TabHost, target: Target) -> Result<Option<TabInfo>> {
    let tabs = host.list_tabs().await?;
    Ok(tabs.into_iter().find(|tab| target.matches_url(&tab.url)))
}
