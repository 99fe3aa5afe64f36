//! Capture sessions — per-target stabilization state machine.
//!
//! A session samples the live document until the extracted reply stops
//! changing and no in-progress signal remains, then emits a single
//! `captured` event. At most one session per target runs at a time; the
//! single-flight flag on [`TargetRecord`] silently drops every competing
//! trigger (post-send, passive poll, observer).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chorus_core::{CaptureConfig, Result, Target};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::extract;
use crate::policy::ExtractionPolicy;

/// Read access to a live, continuously mutating document.
#[async_trait]
pub trait PageProbe: Send + Sync {
    /// Serialized snapshot of the page's current markup.
    async fn snapshot(&self) -> Result<String>;

    /// Whether the hosting tab is still attached. A session aborts without
    /// emitting as soon as this turns false.
    fn context_valid(&self) -> bool;
}

/// Per-target capture state: the single-flight flag and the last delivered
/// content. Owned by the capture subsystem, shared with the broker by
/// handle, never duplicated. Registered once per target and only ever
/// reset, not destroyed.
pub struct TargetRecord {
    target: Target,
    watching: AtomicBool,
    last_delivered: Mutex<Option<String>>,
}

impl TargetRecord {
    pub fn new(target: Target) -> Arc<Self> {
        Arc::new(Self {
            target,
            watching: AtomicBool::new(false),
            last_delivered: Mutex::new(None),
        })
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::Acquire)
    }

    pub fn last_delivered(&self) -> Option<String> {
        self.last_delivered.lock().clone()
    }

    /// Clear captured state, e.g. after the tab navigated away.
    pub fn reset(&self) {
        *self.last_delivered.lock() = None;
    }

    fn begin_watch(&self) -> bool {
        !self.watching.swap(true, Ordering::AcqRel)
    }

    fn end_watch(&self) {
        self.watching.store(false, Ordering::Release);
    }
}

/// A stabilized reply, emitted at most once per distinct content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureEvent {
    pub target: Target,
    pub content: String,
}

/// Terminal result of one capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Content stabilized and was delivered.
    Captured(String),
    /// Content stabilized but matched the last delivered value.
    Unchanged,
    /// Wait budget exhausted; carries the delivered best-effort snapshot
    /// if one was worth emitting.
    Abandoned(Option<String>),
    /// Another session already holds the target; trigger dropped.
    AlreadyWatching,
    /// Hosting context went away mid-session; nothing emitted.
    HostGone,
}

/// Drives capture sessions for one target.
pub struct CaptureEngine {
    config: CaptureConfig,
    policy: ExtractionPolicy,
    record: Arc<TargetRecord>,
    events: mpsc::UnboundedSender<CaptureEvent>,
}

/// Releases the single-flight flag on every exit path.
struct WatchGuard<'a>(&'a TargetRecord);

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        self.0.end_watch();
    }
}

impl CaptureEngine {
    pub fn new(
        config: CaptureConfig,
        policy: ExtractionPolicy,
        record: Arc<TargetRecord>,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self {
            config,
            policy,
            record,
            events,
        }
    }

    pub fn record(&self) -> &Arc<TargetRecord> {
        &self.record
    }

    /// Run one capture session to its terminal outcome.
    ///
    /// Takes an entry sample immediately, then one per sampling period;
    /// the stability counter advances only while no in-progress signal is
    /// present and the extracted text has stopped changing.
    pub async fn watch<P: PageProbe + ?Sized>(&self, probe: &P) -> CaptureOutcome {
        if !self.record.begin_watch() {
            debug!("{}: capture already in flight, trigger dropped", self.record.target);
            return CaptureOutcome::AlreadyWatching;
        }
        let _guard = WatchGuard(&self.record);

        let started = tokio::time::Instant::now();
        let mut previous = String::new();
        let mut stable = 0u32;

        loop {
            if !probe.context_valid() {
                return CaptureOutcome::HostGone;
            }
            let snapshot = match probe.snapshot().await {
                Ok(s) => s,
                Err(_) => return CaptureOutcome::HostGone,
            };

            let busy = extract::is_generating(&snapshot, &self.policy);
            let current = extract::latest_reply(&snapshot, &self.policy).unwrap_or_default();

            let unchanged = current == previous || current.len() == previous.len();
            if !busy && !current.is_empty() && unchanged {
                stable += 1;
                if stable >= self.config.stability_threshold {
                    return self.deliver(current);
                }
            } else {
                stable = 0;
            }
            previous = current;

            if started.elapsed() >= self.config.wait_budget() {
                return self.abandon(previous);
            }
            tokio::time::sleep(self.config.sample_interval()).await;
        }
    }

    /// Passive trigger: start a session when the page holds a reply that
    /// differs from the last delivered value and is longer.
    pub async fn poll<P: PageProbe + ?Sized>(&self, probe: &P) -> Option<CaptureOutcome> {
        if self.should_recapture(probe).await {
            Some(self.watch(probe).await)
        } else {
            None
        }
    }

    /// Real-time read: freshly extracted text, falling back to the last
    /// delivered value when the page yields nothing.
    pub async fn read_latest<P: PageProbe + ?Sized>(&self, probe: &P) -> Option<String> {
        if let Ok(snapshot) = probe.snapshot().await {
            if let Some(text) = extract::latest_reply(&snapshot, &self.policy) {
                return Some(text);
            }
        }
        self.record.last_delivered()
    }

    pub async fn should_recapture<P: PageProbe + ?Sized>(&self, probe: &P) -> bool {
        if self.record.is_watching() || !probe.context_valid() {
            return false;
        }
        let Ok(snapshot) = probe.snapshot().await else {
            return false;
        };
        let Some(current) = extract::latest_reply(&snapshot, &self.policy) else {
            return false;
        };
        match self.record.last_delivered() {
            Some(last) => current != last && current.len() > last.len(),
            None => current.len() >= self.config.min_content_len,
        }
    }

    /// Deliver stabilized content, suppressing duplicates. The compare,
    /// update and emit happen under one lock so no observer can see the
    /// same content delivered twice.
    fn deliver(&self, content: String) -> CaptureOutcome {
        let mut last = self.record.last_delivered.lock();
        if last.as_deref() == Some(content.as_str()) {
            return CaptureOutcome::Unchanged;
        }
        *last = Some(content.clone());
        let _ = self.events.send(CaptureEvent {
            target: self.record.target,
            content: content.clone(),
        });
        info!(
            "{}: reply captured ({} chars)",
            self.record.target,
            content.len()
        );
        CaptureOutcome::Captured(content)
    }

    fn abandon(&self, best: String) -> CaptureOutcome {
        debug!("{}: wait budget exhausted", self.record.target);
        if best.chars().count() >= self.config.min_content_len {
            match self.deliver(best) {
                CaptureOutcome::Captured(content) => CaptureOutcome::Abandoned(Some(content)),
                _ => CaptureOutcome::Abandoned(None),
            }
        } else {
            CaptureOutcome::Abandoned(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            sample_interval_ms: 500,
            stability_threshold: 4,
            wait_budget_ms: 10_000,
            min_content_len: 5,
            poll_interval_ms: 2_000,
        }
    }

    fn test_policy() -> ExtractionPolicy {
        ExtractionPolicy::new(&[".markdown-body"], &[r#"[class*="loading"]"#], 5)
    }

    fn page(content: &str) -> String {
        format!(
            r#"<main><div class="markdown-body">{}</div></main>"#,
            content
        )
    }

    struct FakeProbe {
        html: Mutex<String>,
        valid: AtomicBool,
    }

    impl FakeProbe {
        fn new(html: String) -> Arc<Self> {
            Arc::new(Self {
                html: Mutex::new(html),
                valid: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl PageProbe for FakeProbe {
        async fn snapshot(&self) -> Result<String> {
            Ok(self.html.lock().clone())
        }

        fn context_valid(&self) -> bool {
            self.valid.load(Ordering::Relaxed)
        }
    }

    /// Content grows on every snapshot, so stability is never reached.
    struct GrowingProbe {
        samples: AtomicUsize,
    }

    #[async_trait]
    impl PageProbe for GrowingProbe {
        async fn snapshot(&self) -> Result<String> {
            let n = self.samples.fetch_add(1, Ordering::Relaxed);
            Ok(page(&format!("still streaming part {} of many", n)))
        }

        fn context_valid(&self) -> bool {
            true
        }
    }

    fn engine(
        record: Arc<TargetRecord>,
    ) -> (Arc<CaptureEngine>, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(CaptureEngine::new(test_config(), test_policy(), record, tx));
        (engine, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stability_threshold_timing() {
        let record = TargetRecord::new(Target::Claude);
        let (engine, mut rx) = engine(record);
        let probe = FakeProbe::new(page("a complete stable answer"));

        let started = tokio::time::Instant::now();
        let outcome = engine.watch(probe.as_ref()).await;

        // Entry sample at t=0, stability confirmed after threshold further
        // samples: 4 × 500 ms.
        assert_eq!(started.elapsed(), Duration::from_millis(2_000));
        assert_eq!(
            outcome,
            CaptureOutcome::Captured("a complete stable answer".into())
        );
        assert_eq!(
            rx.try_recv().unwrap().content,
            "a complete stable answer"
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_signal_blocks_stability() {
        let record = TargetRecord::new(Target::Claude);
        let (engine, mut rx) = engine(record);
        let probe = FakeProbe::new(format!(
            r#"<div class="loading-spinner"></div>{}"#,
            page("answer still being produced")
        ));

        let watcher = {
            let engine = engine.clone();
            let probe = probe.clone();
            tokio::spawn(async move { engine.watch(probe.as_ref()).await })
        };

        // While the busy signal is present, nothing fires.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        // Signal clears; stability is confirmed from here.
        *probe.html.lock() = page("answer still being produced");
        let outcome = watcher.await.unwrap();
        assert_eq!(
            outcome,
            CaptureOutcome::Captured("answer still being produced".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let record = TargetRecord::new(Target::DeepSeek);
        let (engine, mut rx) = engine(record);
        let probe = FakeProbe::new(page("one answer for all triggers"));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let engine = engine.clone();
            let probe = probe.clone();
            handles.push(tokio::spawn(async move {
                engine.watch(probe.as_ref()).await
            }));
        }

        let mut captured = 0;
        let mut dropped = 0;
        for handle in handles {
            match handle.await.unwrap() {
                CaptureOutcome::Captured(_) => captured += 1,
                CaptureOutcome::AlreadyWatching => dropped += 1,
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        assert_eq!(captured, 1);
        assert_eq!(dropped, 2);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_content_not_redelivered() {
        let record = TargetRecord::new(Target::Qwen);
        let (engine, mut rx) = engine(record);
        let probe = FakeProbe::new(page("the one and only answer"));

        let first = engine.watch(probe.as_ref()).await;
        assert!(matches!(first, CaptureOutcome::Captured(_)));
        assert!(rx.try_recv().is_ok());

        let second = engine.watch(probe.as_ref()).await;
        assert_eq!(second, CaptureOutcome::Unchanged);
        assert!(rx.try_recv().is_err());
        assert!(!engine.record().is_watching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_budget_escape() {
        let record = TargetRecord::new(Target::Kimi);
        let (engine, mut rx) = engine(record);
        let probe = GrowingProbe {
            samples: AtomicUsize::new(0),
        };

        let started = tokio::time::Instant::now();
        let outcome = engine.watch(&probe).await;

        assert!(started.elapsed() >= Duration::from_secs(10));
        match outcome {
            CaptureOutcome::Abandoned(Some(content)) => {
                assert!(content.starts_with("still streaming part"))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        // Exactly one best-effort event, and the machine is back in Idle.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(!engine.record().is_watching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_invalidation_aborts_without_emitting() {
        let record = TargetRecord::new(Target::Doubao);
        let (engine, mut rx) = engine(record);
        let probe = FakeProbe::new(page("will never be delivered"));

        let watcher = {
            let engine = engine.clone();
            let probe = probe.clone();
            tokio::spawn(async move { engine.watch(probe.as_ref()).await })
        };

        tokio::time::sleep(Duration::from_millis(600)).await;
        probe.valid.store(false, Ordering::Relaxed);

        let outcome = watcher.await.unwrap();
        assert_eq!(outcome, CaptureOutcome::HostGone);
        assert!(rx.try_recv().is_err());
        assert!(!engine.record().is_watching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_poll_longer_rule() {
        let record = TargetRecord::new(Target::Gemini);
        let (engine, _rx) = engine(record);

        // Nothing delivered yet: any qualifying text triggers.
        let probe = FakeProbe::new(page("fresh reply nobody asked about"));
        assert!(engine.should_recapture(probe.as_ref()).await);

        // Deliver it, then: identical text must not re-trigger.
        assert!(matches!(
            engine.watch(probe.as_ref()).await,
            CaptureOutcome::Captured(_)
        ));
        assert!(!engine.should_recapture(probe.as_ref()).await);

        // Different but shorter must not trigger.
        *probe.html.lock() = page("short different");
        assert!(!engine.should_recapture(probe.as_ref()).await);

        // Different and longer triggers.
        *probe.html.lock() = page("fresh reply nobody asked about, now grown longer");
        assert!(engine.should_recapture(probe.as_ref()).await);
        let outcome = engine.poll(probe.as_ref()).await;
        assert!(matches!(outcome, Some(CaptureOutcome::Captured(_))));
    }

    #[test]
    fn test_record_reset_keeps_registration() {
        let record = TargetRecord::new(Target::ChatGlm);
        *record.last_delivered.lock() = Some("old".into());
        record.reset();
        assert_eq!(record.last_delivered(), None);
        assert_eq!(record.target(), Target::ChatGlm);
    }
}
