//! The dispatch broker — central coordinator between the session channel
//! and the per-target listeners.

use std::collections::HashMap;
use std::sync::Arc;

use chorus_capture::{CaptureEngine, CaptureEvent, ExtractionPolicy, TargetRecord};
use chorus_core::{
    BrokerConfig, BrokerEvent, CaptureConfig, Error, OpReply, Operation, Result, Target,
};
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::listener::{spawn_listener, ListenerHandle, ListenerRequest};
use crate::liveness;
use crate::tabs::{find_tab, TabHost};

pub struct DispatchBroker {
    host: Arc<dyn TabHost>,
    config: BrokerConfig,
    capture: CaptureConfig,
    listeners: DashMap<Target, ListenerHandle>,
    records: DashMap<Target, Arc<TargetRecord>>,
    events: broadcast::Sender<BrokerEvent>,
    capture_tx: mpsc::UnboundedSender<CaptureEvent>,
}

impl DispatchBroker {
    pub fn new(host: Arc<dyn TabHost>, config: BrokerConfig, capture: CaptureConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (capture_tx, mut capture_rx) = mpsc::unbounded_channel::<CaptureEvent>();

        let broker = Arc::new(Self {
            host,
            config,
            capture,
            listeners: DashMap::new(),
            records: DashMap::new(),
            events: events.clone(),
            capture_tx,
        });

        // Stabilized replies land on the event stream so consumers that
        // only observe events stay in sync.
        tokio::spawn(async move {
            while let Some(event) = capture_rx.recv().await {
                let _ = events.send(BrokerEvent::ResponseCaptured {
                    target: event.target,
                    content: event.content,
                });
            }
        });

        broker
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Subscribe to the unsolicited event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Dispatch one operation to one target, with liveness handling and
    /// bounded retries. Every outcome also lands on the event stream.
    pub async fn dispatch(&self, target: Target, op: Operation) -> Result<OpReply> {
        let result = self.dispatch_inner(target, &op).await;
        let _ = self.events.send(BrokerEvent::SendResult {
            target,
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    async fn dispatch_inner(&self, target: Target, op: &Operation) -> Result<OpReply> {
        let mut attempt = 0u32;
        loop {
            let handle = self.ensure_listener(target).await?;
            attempt += 1;

            let call = handle.call(listener_request(op));
            match tokio::time::timeout(self.config.request_timeout(), call).await {
                Err(_) => return Err(Error::Timeout),
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(err)) if err.is_transient() && attempt < self.config.max_send_attempts => {
                    debug!(
                        "{}: {} raced a dead listener (attempt {}), backing off",
                        target,
                        op.kind(),
                        attempt
                    );
                    self.listeners.remove(&target);
                    tokio::time::sleep(self.config.backoff_delay(attempt - 1)).await;
                }
                Ok(Err(err)) => return Err(err),
            }
        }
    }

    /// Fan one operation out to several targets independently. One
    /// target's failure never blocks or fails the others.
    pub async fn fan_out(
        &self,
        targets: &[Target],
        op: Operation,
    ) -> HashMap<Target, Result<OpReply>> {
        let dispatches = targets.iter().map(|target| {
            let op = op.clone();
            async move { (*target, self.dispatch(*target, op).await) }
        });
        join_all(dispatches).await.into_iter().collect()
    }

    /// Listener presence per target, from the listener table.
    pub fn status(&self) -> HashMap<Target, bool> {
        Target::all()
            .iter()
            .map(|target| {
                let present = self
                    .listeners
                    .get(target)
                    .map(|h| !h.is_closed())
                    .unwrap_or(false);
                (*target, present)
            })
            .collect()
    }

    /// Last captured text for a target, if any.
    pub fn stored_response(&self, target: Target) -> Option<String> {
        self.records.get(&target).and_then(|r| r.last_delivered())
    }

    /// Navigation hook: a completed page load in a tab owned by a target
    /// marks it connected.
    pub fn note_tab_loaded(&self, url: &str) {
        if let Some(target) = Target::for_url(url) {
            let _ = self
                .events
                .send(BrokerEvent::TabStatusUpdate {
                    target,
                    connected: true,
                });
        }
    }

    /// Ping every registered listener; drop and report the ones that have
    /// stopped answering. Advisory only — never revives.
    pub async fn heartbeat_sweep(&self) {
        let entries: Vec<(Target, ListenerHandle)> = self
            .listeners
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        for (target, handle) in entries {
            if !liveness::probe(&handle, self.config.probe_timeout()).await {
                warn!("{}: heartbeat missed", target);
                self.listeners.remove(&target);
                let _ = self.events.send(BrokerEvent::TabStatusUpdate {
                    target,
                    connected: false,
                });
            }
        }
    }

    fn record(&self, target: Target) -> Arc<TargetRecord> {
        self.records
            .entry(target)
            .or_insert_with(|| TargetRecord::new(target))
            .clone()
    }

    /// Return a live listener handle for the target, probing the existing
    /// one and reviving if needed.
    async fn ensure_listener(&self, target: Target) -> Result<ListenerHandle> {
        if let Some(handle) = self.listeners.get(&target).map(|h| h.clone()) {
            if liveness::probe(&handle, self.config.probe_timeout()).await {
                return Ok(handle);
            }
            debug!("{}: listener dead, reviving", target);
            self.listeners.remove(&target);
        }
        self.revive(target).await
    }

    async fn revive(&self, target: Target) -> Result<ListenerHandle> {
        let tab = find_tab(self.host.as_ref(), target)
            .await?
            .ok_or(Error::TabNotFound(target))?;

        let driver = match self.host.attach(&tab).await {
            Ok(driver) => driver,
            Err(err) => {
                warn!("{}: attach failed: {}", target, err);
                return Err(Error::TargetUnreachable);
            }
        };

        let policy = ExtractionPolicy::for_target(target).with_min_len(self.capture.min_content_len);
        let engine = Arc::new(CaptureEngine::new(
            self.capture.clone(),
            policy,
            self.record(target),
            self.capture_tx.clone(),
        ));
        let handle = spawn_listener(driver, engine, self.capture.poll_interval());

        // A freshly injected listener needs time to register its handlers.
        tokio::time::sleep(self.config.settle_delay()).await;

        self.listeners.insert(target, handle.clone());
        let _ = self.events.send(BrokerEvent::TabStatusUpdate {
            target,
            connected: true,
        });
        Ok(handle)
    }
}

fn listener_request(op: &Operation) -> ListenerRequest {
    match op {
        Operation::InjectMessage { text } => ListenerRequest::Inject { text: text.clone() },
        Operation::ReadLatest => ListenerRequest::ReadLatest,
        Operation::NewConversation => ListenerRequest::NewConversation,
        Operation::StatusProbe => ListenerRequest::Ping,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chorus_capture::PageProbe;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::driver::TabDriver;
    use crate::tabs::TabInfo;

    fn test_configs() -> (BrokerConfig, CaptureConfig) {
        (
            BrokerConfig::default(),
            CaptureConfig {
                sample_interval_ms: 500,
                stability_threshold: 4,
                wait_budget_ms: 10_000,
                min_content_len: 5,
                poll_interval_ms: 2_000,
            },
        )
    }

    /// A tab whose page holds one fixed reply.
    struct FixedDriver {
        html: String,
        valid: AtomicBool,
    }

    impl FixedDriver {
        fn new(reply: &str) -> Self {
            Self {
                html: format!(r#"<main><div class="markdown-body">{}</div></main>"#, reply),
                valid: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl PageProbe for FixedDriver {
        async fn snapshot(&self) -> Result<String> {
            Ok(self.html.clone())
        }

        fn context_valid(&self) -> bool {
            self.valid.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl TabDriver for FixedDriver {
        async fn inject_message(&self, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn new_conversation(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Driver whose operations hang forever.
    struct HangingDriver;

    #[async_trait]
    impl PageProbe for HangingDriver {
        async fn snapshot(&self) -> Result<String> {
            Ok(String::new())
        }

        fn context_valid(&self) -> bool {
            true
        }
    }

    #[async_trait]
    impl TabDriver for HangingDriver {
        async fn inject_message(&self, _text: &str) -> Result<()> {
            std::future::pending::<()>().await;
            unreachable!()
        }

        async fn new_conversation(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Driver whose page operations fail at the application level.
    struct BrokenPageDriver;

    #[async_trait]
    impl PageProbe for BrokenPageDriver {
        async fn snapshot(&self) -> Result<String> {
            Ok(String::new())
        }

        fn context_valid(&self) -> bool {
            true
        }
    }

    #[async_trait]
    impl TabDriver for BrokenPageDriver {
        async fn inject_message(&self, _text: &str) -> Result<()> {
            Err(Error::App("Could not find input field".into()))
        }

        async fn new_conversation(&self) -> Result<()> {
            Err(Error::App("Could not find new chat button".into()))
        }
    }

    /// Driver that is torn down before the listener can serve anything, so
    /// every call observes a closed endpoint.
    struct DeadOnArrivalDriver;

    #[async_trait]
    impl PageProbe for DeadOnArrivalDriver {
        async fn snapshot(&self) -> Result<String> {
            Ok(String::new())
        }

        fn context_valid(&self) -> bool {
            false
        }
    }

    #[async_trait]
    impl TabDriver for DeadOnArrivalDriver {
        async fn inject_message(&self, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn new_conversation(&self) -> Result<()> {
            Ok(())
        }
    }

    enum HostBehavior {
        Fixed(&'static str),
        Shared(Arc<FixedDriver>),
        Hanging,
        BrokenPage,
        DeadOnArrival,
        AttachFails,
    }

    struct FakeHost {
        tabs: Vec<TabInfo>,
        behaviors: HashMap<Target, HostBehavior>,
        attach_count: AtomicUsize,
    }

    impl FakeHost {
        fn single(target: Target, url: &str, behavior: HostBehavior) -> Arc<Self> {
            let mut behaviors = HashMap::new();
            behaviors.insert(target, behavior);
            Arc::new(Self {
                tabs: vec![TabInfo {
                    id: 1,
                    url: url.into(),
                }],
                behaviors,
                attach_count: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TabHost for FakeHost {
        async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
            Ok(self.tabs.clone())
        }

        async fn attach(&self, tab: &TabInfo) -> Result<Arc<dyn TabDriver>> {
            self.attach_count.fetch_add(1, Ordering::Relaxed);
            let target = Target::for_url(&tab.url).ok_or(Error::TargetUnreachable)?;
            match self.behaviors.get(&target) {
                Some(HostBehavior::Fixed(reply)) => Ok(Arc::new(FixedDriver::new(reply))),
                Some(HostBehavior::Shared(driver)) => Ok(driver.clone()),
                Some(HostBehavior::Hanging) => Ok(Arc::new(HangingDriver)),
                Some(HostBehavior::BrokenPage) => Ok(Arc::new(BrokenPageDriver)),
                Some(HostBehavior::DeadOnArrival) => Ok(Arc::new(DeadOnArrivalDriver)),
                Some(HostBehavior::AttachFails) | None => Err(Error::TargetUnreachable),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_and_capture_flow() {
        let host = FakeHost::single(
            Target::Claude,
            "https://claude.ai/chat/1",
            HostBehavior::Fixed("a long and complete reply"),
        );
        let (config, capture) = test_configs();
        let broker = DispatchBroker::new(host, config, capture);
        let mut events = broker.subscribe();

        let reply = broker
            .dispatch(
                Target::Claude,
                Operation::InjectMessage {
                    text: "hello".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(reply, OpReply::Sent);

        assert_eq!(
            events.recv().await.unwrap(),
            BrokerEvent::TabStatusUpdate {
                target: Target::Claude,
                connected: true
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            BrokerEvent::SendResult {
                target: Target::Claude,
                success: true,
                error: None
            }
        );

        // Let the post-send capture session stabilize.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            events.recv().await.unwrap(),
            BrokerEvent::ResponseCaptured {
                target: Target::Claude,
                content: "a long and complete reply".into()
            }
        );
        assert_eq!(
            broker.stored_response(Target::Claude).as_deref(),
            Some("a long and complete reply")
        );
        assert_eq!(broker.status()[&Target::Claude], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tab_is_configuration_error() {
        let host = FakeHost::single(
            Target::Claude,
            "https://claude.ai/",
            HostBehavior::Fixed("x"),
        );
        let (config, capture) = test_configs();
        let broker = DispatchBroker::new(host.clone(), config, capture);

        let err = broker
            .dispatch(Target::Gemini, Operation::ReadLatest)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TabNotFound(Target::Gemini)));
        assert_eq!(host.attach_count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_failure_is_unreachable_not_retried() {
        let host = FakeHost::single(
            Target::Qwen,
            "https://chat.qwen.ai/",
            HostBehavior::AttachFails,
        );
        let (config, capture) = test_configs();
        let broker = DispatchBroker::new(host.clone(), config, capture);

        let err = broker
            .dispatch(Target::Qwen, Operation::ReadLatest)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TargetUnreachable));
        assert_eq!(host.attach_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_for_dead_listeners() {
        let host = FakeHost::single(
            Target::Kimi,
            "https://www.kimi.com/chat",
            HostBehavior::DeadOnArrival,
        );
        let (config, capture) = test_configs();
        let broker = DispatchBroker::new(host.clone(), config, capture);

        let started = tokio::time::Instant::now();
        let err = broker
            .dispatch(
                Target::Kimi,
                Operation::InjectMessage { text: "hi".into() },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ListenerGone));
        // One attach per attempt, bounded at the attempt cap.
        assert_eq!(host.attach_count.load(Ordering::Relaxed), 4);
        // Elapsed stays within settle delays plus capped backoffs.
        assert!(started.elapsed() <= Duration::from_millis(4 * 500 + 1_000 + 2_000 + 3_000 + 500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_not_retried() {
        let host = FakeHost::single(
            Target::Doubao,
            "https://www.doubao.com/chat",
            HostBehavior::Hanging,
        );
        let (config, capture) = test_configs();
        let broker = DispatchBroker::new(host.clone(), config, capture);

        let err = broker
            .dispatch(
                Target::Doubao,
                Operation::InjectMessage { text: "hi".into() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(host.attach_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_error_surfaced_verbatim() {
        let host = FakeHost::single(
            Target::ChatGlm,
            "https://chatglm.cn/",
            HostBehavior::BrokenPage,
        );
        let (config, capture) = test_configs();
        let broker = DispatchBroker::new(host.clone(), config, capture);

        let err = broker
            .dispatch(
                Target::ChatGlm,
                Operation::InjectMessage { text: "hi".into() },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Could not find input field");
        assert_eq!(host.attach_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_isolates_failures() {
        let mut behaviors = HashMap::new();
        behaviors.insert(Target::Claude, HostBehavior::AttachFails);
        behaviors.insert(Target::ChatGpt, HostBehavior::Fixed("fine"));
        let host = Arc::new(FakeHost {
            tabs: vec![
                TabInfo {
                    id: 1,
                    url: "https://claude.ai/".into(),
                },
                TabInfo {
                    id: 2,
                    url: "https://chatgpt.com/".into(),
                },
            ],
            behaviors,
            attach_count: AtomicUsize::new(0),
        });
        let (config, capture) = test_configs();
        let broker = DispatchBroker::new(host, config, capture);

        let results = broker
            .fan_out(
                &[Target::Claude, Target::ChatGpt],
                Operation::NewConversation,
            )
            .await;

        assert!(matches!(
            results[&Target::Claude],
            Err(Error::TargetUnreachable)
        ));
        assert_eq!(
            results[&Target::ChatGpt].as_ref().unwrap(),
            &OpReply::Started
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sweep_reports_dead_listener() {
        let driver = Arc::new(FixedDriver::new("some stable reply text"));
        let host = FakeHost::single(
            Target::DeepSeek,
            "https://chat.deepseek.com/",
            HostBehavior::Shared(driver.clone()),
        );
        let (config, capture) = test_configs();
        let broker = DispatchBroker::new(host, config, capture);

        broker
            .dispatch(Target::DeepSeek, Operation::StatusProbe)
            .await
            .unwrap();
        let mut events = broker.subscribe();
        assert_eq!(broker.status()[&Target::DeepSeek], true);

        // Tear the tab down; the listener exits at its next wakeup and the
        // following sweep reports it.
        driver.valid.store(false, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(3)).await;

        broker.heartbeat_sweep().await;
        assert_eq!(
            events.recv().await.unwrap(),
            BrokerEvent::TabStatusUpdate {
                target: Target::DeepSeek,
                connected: false
            }
        );
        assert_eq!(broker.status()[&Target::DeepSeek], false);
    }

    #[tokio::test]
    async fn test_note_tab_loaded_emits_status() {
        let host = FakeHost::single(
            Target::Claude,
            "https://claude.ai/",
            HostBehavior::Fixed("x"),
        );
        let (config, capture) = test_configs();
        let broker = DispatchBroker::new(host, config, capture);
        let mut events = broker.subscribe();

        broker.note_tab_loaded("https://gemini.google.com/app");
        broker.note_tab_loaded("https://unrelated.example.com/");

        assert_eq!(
            events.recv().await.unwrap(),
            BrokerEvent::TabStatusUpdate {
                target: Target::Gemini,
                connected: true
            }
        );
        assert!(events.try_recv().is_err());
    }
}
