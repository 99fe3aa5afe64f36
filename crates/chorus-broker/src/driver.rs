//! The listener's side-effecting view of one tab.

use async_trait::async_trait;
use chorus_capture::PageProbe;
use chorus_core::Result;

/// Page operations a listener performs against its tab. Snapshot access
/// comes from the [`PageProbe`] supertrait, so a driver plugs straight
/// into the capture engine.
#[async_trait]
pub trait TabDriver: PageProbe {
    /// Type the text into the target's composer and submit it.
    async fn inject_message(&self, text: &str) -> Result<()>;

    /// Start a fresh conversation in the tab.
    async fn new_conversation(&self) -> Result<()>;
}
