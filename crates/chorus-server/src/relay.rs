//! Browser-agent relay — how the daemon reaches tabs.
//!
//! A companion agent running in the browser connects over one WebSocket
//! and answers tab enumeration and per-tab page operations. The hub
//! implements the broker's [`TabHost`]/[`TabDriver`] seams over that
//! connection. Thin host glue: all correctness-critical logic stays in
//! the broker and capture crates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chorus_broker::{TabDriver, TabHost, TabInfo};
use chorus_capture::PageProbe;
use chorus_core::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Round-trip budget for one relay exchange.
const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames sent to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayDown {
    ListTabs { id: String },
    Inject { id: String, tab: u64, text: String },
    Snapshot { id: String, tab: u64 },
    NewConversation { id: String, tab: u64 },
}

/// Frames received from the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayUp {
    Hello { agent: String },
    Tabs { id: String, tabs: Vec<TabEntry> },
    Ok { id: String },
    Html { id: String, html: String },
    Error { id: String, message: String },
    TabLoaded { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabEntry {
    pub id: u64,
    pub url: String,
}

impl RelayUp {
    /// Correlation id, for replies that carry one.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            RelayUp::Tabs { id, .. }
            | RelayUp::Ok { id }
            | RelayUp::Html { id, .. }
            | RelayUp::Error { id, .. } => Some(id),
            RelayUp::Hello { .. } | RelayUp::TabLoaded { .. } => None,
        }
    }
}

/// One live agent connection.
#[derive(Clone)]
pub struct AgentLink {
    tx: mpsc::Sender<RelayDown>,
    pending: Arc<DashMap<String, oneshot::Sender<RelayUp>>>,
    alive: Arc<AtomicBool>,
}

impl AgentLink {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Correlated request/response round-trip with the agent.
    async fn exchange(&self, build: impl FnOnce(String) -> RelayDown) -> Result<RelayUp> {
        let id = uuid::Uuid::new_v4().to_string();
        let (reply, rx) = oneshot::channel();
        self.pending.insert(id.clone(), reply);

        if self.tx.send(build(id.clone())).await.is_err() {
            self.pending.remove(&id);
            return Err(Error::TargetUnreachable);
        }
        match tokio::time::timeout(RELAY_TIMEOUT, rx).await {
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::Timeout)
            }
            Ok(Err(_)) => Err(Error::TargetUnreachable),
            Ok(Ok(reply)) => Ok(reply),
        }
    }

    /// Complete a pending exchange. Unknown ids are dropped.
    pub fn complete(&self, reply: RelayUp) {
        if let Some(id) = reply.correlation_id() {
            if let Some((_, tx)) = self.pending.remove(id) {
                let _ = tx.send(reply);
            }
        }
    }
}

/// Tracks the current agent connection (latest wins) and hands out
/// per-tab drivers bound to it.
pub struct RelayHub {
    agent: RwLock<Option<AgentLink>>,
}

impl RelayHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            agent: RwLock::new(None),
        })
    }

    /// Register a new agent connection, displacing any previous one.
    pub fn register(&self, tx: mpsc::Sender<RelayDown>) -> AgentLink {
        let link = AgentLink {
            tx,
            pending: Arc::new(DashMap::new()),
            alive: Arc::new(AtomicBool::new(true)),
        };
        let mut slot = self.agent.write();
        if let Some(old) = slot.take() {
            old.alive.store(false, Ordering::Release);
        }
        *slot = Some(link.clone());
        link
    }

    /// Drop a connection. Only clears the slot if it still holds this link.
    pub fn unregister(&self, link: &AgentLink) {
        link.alive.store(false, Ordering::Release);
        let mut slot = self.agent.write();
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(&current.alive, &link.alive) {
                *slot = None;
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.agent.read().as_ref().map_or(false, |l| l.is_alive())
    }

    fn link(&self) -> Result<AgentLink> {
        self.agent
            .read()
            .as_ref()
            .filter(|l| l.is_alive())
            .cloned()
            .ok_or(Error::TargetUnreachable)
    }
}

#[async_trait]
impl TabHost for RelayHub {
    async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
        let link = self.link()?;
        match link.exchange(|id| RelayDown::ListTabs { id }).await? {
            RelayUp::Tabs { tabs, .. } => Ok(tabs
                .into_iter()
                .map(|t| TabInfo { id: t.id, url: t.url })
                .collect()),
            RelayUp::Error { message, .. } => Err(Error::App(message)),
            _ => Err(Error::Channel("unexpected relay reply".into())),
        }
    }

    async fn attach(&self, tab: &TabInfo) -> Result<Arc<dyn TabDriver>> {
        let link = self.link()?;
        Ok(Arc::new(RelayDriver { link, tab: tab.id }))
    }
}

/// Driver for one tab, valid as long as its agent connection lives.
struct RelayDriver {
    link: AgentLink,
    tab: u64,
}

#[async_trait]
impl PageProbe for RelayDriver {
    async fn snapshot(&self) -> Result<String> {
        match self
            .link
            .exchange(|id| RelayDown::Snapshot { id, tab: self.tab })
            .await?
        {
            RelayUp::Html { html, .. } => Ok(html),
            RelayUp::Error { message, .. } => Err(Error::App(message)),
            _ => Err(Error::Channel("unexpected relay reply".into())),
        }
    }

    fn context_valid(&self) -> bool {
        self.link.is_alive()
    }
}

#[async_trait]
impl TabDriver for RelayDriver {
    async fn inject_message(&self, text: &str) -> Result<()> {
        match self
            .link
            .exchange(|id| RelayDown::Inject {
                id,
                tab: self.tab,
                text: text.to_string(),
            })
            .await?
        {
            RelayUp::Ok { .. } => Ok(()),
            RelayUp::Error { message, .. } => Err(Error::App(message)),
            _ => Err(Error::Channel("unexpected relay reply".into())),
        }
    }

    async fn new_conversation(&self) -> Result<()> {
        match self
            .link
            .exchange(|id| RelayDown::NewConversation { id, tab: self.tab })
            .await?
        {
            RelayUp::Ok { .. } => Ok(()),
            RelayUp::Error { message, .. } => Err(Error::App(message)),
            _ => Err(Error::Channel("unexpected relay reply".into())),
        }
    }
}
