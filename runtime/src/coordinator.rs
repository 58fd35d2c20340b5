//! Agent lifecycle tracking and request relay.
//!
//! The coordinator owns one [`AgentRecord`] per page handle. The only way
//! to change a record is through the methods here. State per handle:
//!
//! ```text
//! Unregistered --inject--> Injecting --injected--> RegisteredUnconfirmed
//!     --probe ok--> RegisteredConfirmed --navigate--> RegisteredUnconfirmed
//! any --closed / inactive--> removed
//! ```
//!
//! A record is confirmed only when the readiness marker probe succeeds
//! after the latest navigation. A successful injection call alone never
//! confirms, since injecting into a page that already runs an agent is a
//! silent no-op on the host.
//!
//! Calls for different handles run concurrently. A second `ensure_injected`
//! for a handle that is already injecting waits for the first one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{ScanError, ScanResult};
use crate::host::{is_supported_url, PageHandle, PageHost};
use crate::protocol::{AgentRequest, AgentResponse, Responder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Unregistered,
    Injecting,
    RegisteredUnconfirmed,
    RegisteredConfirmed,
    /// The agent's context went away under a relay; reinjection is needed.
    Stale,
}

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub handle: PageHandle,
    pub location_url: String,
    pub last_activity: Instant,
    pub status: AgentStatus,
}

/// Serializable view of a record for status output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub handle: PageHandle,
    pub url: String,
    pub status: AgentStatus,
    pub idle_ms: u64,
}

/// Notifications from page agents and the host.
#[derive(Debug)]
pub enum CoordinatorEvent {
    /// An agent started. `ack` is answered once the record exists.
    Register {
        handle: PageHandle,
        url: String,
        ack: oneshot::Sender<()>,
    },
    Heartbeat {
        handle: PageHandle,
    },
    Navigated {
        handle: PageHandle,
        url: String,
    },
    Closed {
        handle: PageHandle,
    },
}

type InjectionOutcome = Option<ScanResult<()>>;

struct Entry {
    record: AgentRecord,
    /// Bumped on every navigation. An injection started under an older
    /// epoch cannot confirm the record.
    epoch: u64,
    injecting: Option<watch::Receiver<InjectionOutcome>>,
}

impl Entry {
    fn new(handle: PageHandle, url: String) -> Self {
        Self {
            record: AgentRecord {
                handle,
                location_url: url,
                last_activity: Instant::now(),
                status: AgentStatus::Unregistered,
            },
            epoch: 0,
            injecting: None,
        }
    }

    fn touch(&mut self) {
        self.record.last_activity = Instant::now();
    }
}

/// False once the injecting caller went away without publishing a result.
fn injection_live(rx: &watch::Receiver<InjectionOutcome>) -> bool {
    rx.has_changed().is_ok()
}

enum Claim {
    Ready,
    Wait(watch::Receiver<InjectionOutcome>),
    Run {
        epoch: u64,
        done: watch::Sender<InjectionOutcome>,
    },
}

/// Owner of the agent record table.
pub struct Coordinator {
    host: Arc<dyn PageHost>,
    config: RuntimeConfig,
    records: Mutex<HashMap<PageHandle, Entry>>,
}

impl Coordinator {
    pub fn new(host: Arc<dyn PageHost>, config: RuntimeConfig) -> Self {
        Self {
            host,
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &Arc<dyn PageHost> {
        &self.host
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn records(&self) -> MutexGuard<'_, HashMap<PageHandle, Entry>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn status(&self, handle: PageHandle) -> Option<AgentStatus> {
        self.records().get(&handle).map(|e| e.record.status)
    }

    pub fn record(&self, handle: PageHandle) -> Option<AgentRecord> {
        self.records().get(&handle).map(|e| e.record.clone())
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        let now = Instant::now();
        let mut out: Vec<AgentSnapshot> = self
            .records()
            .values()
            .map(|e| AgentSnapshot {
                handle: e.record.handle,
                url: e.record.location_url.clone(),
                status: e.record.status,
                idle_ms: now.duration_since(e.record.last_activity).as_millis() as u64,
            })
            .collect();
        out.sort_by_key(|s| s.handle);
        out
    }

    /// Make sure a confirmed agent runs on the page.
    ///
    /// A confirmed record returns immediately without touching the host
    /// unless `force` is set. Otherwise the agent is injected and the
    /// readiness marker polled with rising delays until it shows up or the
    /// probe budget runs out.
    pub async fn ensure_injected(&self, handle: PageHandle, force: bool) -> ScanResult<()> {
        match self.claim(handle, force) {
            Claim::Ready => Ok(()),
            Claim::Wait(mut rx) => {
                debug!(%handle, "injection already in flight, waiting");
                let outcome = rx
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| ScanError::InjectionFailed("injection abandoned".into()))?
                    .clone();
                outcome.unwrap_or(Ok(()))
            }
            Claim::Run { epoch, done } => {
                let probed = self.inject_and_confirm(handle, epoch).await;
                let result = self.finish_injection(handle, epoch, probed);
                let _ = done.send(Some(result.clone()));
                result
            }
        }
    }

    fn claim(&self, handle: PageHandle, force: bool) -> Claim {
        let mut records = self.records();
        let entry = records
            .entry(handle)
            .or_insert_with(|| Entry::new(handle, String::new()));
        if let Some(rx) = entry.injecting.as_ref().filter(|rx| injection_live(rx)) {
            return Claim::Wait(rx.clone());
        }
        if entry.record.status == AgentStatus::RegisteredConfirmed && !force {
            entry.touch();
            return Claim::Ready;
        }
        let (done, rx) = watch::channel(None);
        entry.injecting = Some(rx);
        entry.record.status = AgentStatus::Injecting;
        entry.touch();
        Claim::Run {
            epoch: entry.epoch,
            done,
        }
    }

    /// Returns the number of probes it took to see the marker.
    async fn inject_and_confirm(&self, handle: PageHandle, epoch: u64) -> ScanResult<u32> {
        let url = self.host.url(handle).await?;
        if !is_supported_url(&url) {
            return Err(ScanError::UnsupportedScheme(url));
        }
        self.update(handle, |entry| entry.record.location_url = url.clone());

        self.host
            .inject(handle)
            .await
            .map_err(|e| match e {
                ScanError::UnknownPage(_) | ScanError::ContextInvalidated => e,
                other => ScanError::InjectionFailed(other.to_string()),
            })?;
        self.update(handle, |entry| {
            if entry.epoch == epoch {
                entry.record.status = AgentStatus::RegisteredUnconfirmed;
            }
        });
        info!(%handle, %url, "agent injected, probing readiness marker");

        let attempts = self.config.probe_attempts;
        for attempt in 0..attempts {
            tokio::time::sleep(self.config.probe_delay(attempt)).await;
            match self.host.probe_marker(handle).await {
                Ok(true) => return Ok(attempt + 1),
                Ok(false) => debug!(%handle, attempt, "readiness marker absent"),
                Err(e @ (ScanError::UnknownPage(_) | ScanError::ContextInvalidated)) => return Err(e),
                Err(e) => warn!(%handle, attempt, "readiness probe failed: {e}"),
            }
        }
        Err(ScanError::AgentUnconfirmed { attempts })
    }

    /// Settle the record after an injection attempt. A marker seen before
    /// a navigation belonged to the old document, so it does not confirm.
    fn finish_injection(&self, handle: PageHandle, epoch: u64, probed: ScanResult<u32>) -> ScanResult<()> {
        let mut records = self.records();
        let Some(entry) = records.get_mut(&handle) else {
            // Closed while injecting.
            return probed.and(Err(ScanError::UnknownPage(handle.0)));
        };
        entry.injecting = None;
        let navigated = entry.epoch != epoch;
        match probed {
            Ok(_) if !navigated => {
                entry.record.status = AgentStatus::RegisteredConfirmed;
                entry.touch();
                info!(%handle, "agent confirmed");
                Ok(())
            }
            Ok(attempts) => {
                entry.record.status = AgentStatus::RegisteredUnconfirmed;
                debug!(%handle, "page navigated during injection, not confirming");
                Err(ScanError::AgentUnconfirmed { attempts })
            }
            Err(e @ (ScanError::UnsupportedScheme(_) | ScanError::UnknownPage(_))) => {
                records.remove(&handle);
                Err(e)
            }
            Err(e @ ScanError::InjectionFailed(_)) => {
                entry.record.status = AgentStatus::Unregistered;
                Err(e)
            }
            Err(e) => {
                if entry.record.status == AgentStatus::Injecting {
                    entry.record.status = AgentStatus::Unregistered;
                }
                Err(e)
            }
        }
    }

    fn update(&self, handle: PageHandle, f: impl FnOnce(&mut Entry)) -> bool {
        match self.records().get_mut(&handle) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Forward a request to a confirmed agent and wait for its reply. The
    /// relay timeout covers queueing the request as well as the reply, so
    /// a busy agent with a full inbox cannot stall the caller.
    pub async fn relay(&self, handle: PageHandle, request: AgentRequest) -> ScanResult<AgentResponse> {
        if self.status(handle) != Some(AgentStatus::RegisteredConfirmed) {
            return Err(ScanError::AgentUnconfirmed { attempts: 0 });
        }

        let action = request.name();
        let (responder, reply) = Responder::channel();
        let exchange = async {
            self.host.deliver(handle, request, responder).await?;
            reply.await.map_err(|_| ScanError::ContextInvalidated)
        };

        match tokio::time::timeout(self.config.relay_timeout, exchange).await {
            Ok(Ok(response)) => {
                self.update(handle, Entry::touch);
                Ok(response)
            }
            Ok(Err(e)) => {
                self.mark_stale_on(handle, &e);
                Err(e)
            }
            Err(_) => {
                warn!(%handle, action, "agent did not answer in time");
                Err(ScanError::RelayTimeout(self.config.relay_timeout))
            }
        }
    }

    fn mark_stale_on(&self, handle: PageHandle, error: &ScanError) {
        if matches!(error, ScanError::ContextInvalidated) {
            self.update(handle, |entry| entry.record.status = AgentStatus::Stale);
        }
    }

    /// Inject if needed, then relay. Failures other than a torn-down
    /// context are retried a bounded number of times, forcing reinjection.
    pub async fn request(&self, handle: PageHandle, request: AgentRequest) -> ScanResult<AgentResponse> {
        let mut force = false;
        let mut last_error = ScanError::AgentUnconfirmed { attempts: 0 };
        for attempt in 0..=self.config.request_retries {
            let result = match self.ensure_injected(handle, force).await {
                Ok(()) => self.relay(handle, request.clone()).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    debug!(%handle, attempt, "request failed, retrying: {e}");
                    last_error = e;
                    force = true;
                }
            }
        }
        Err(last_error)
    }

    /// An agent announced itself. Creates the record when missing; never
    /// confirms it.
    pub fn register(&self, handle: PageHandle, url: &str) {
        let mut records = self.records();
        let entry = records
            .entry(handle)
            .or_insert_with(|| Entry::new(handle, url.to_string()));
        entry.record.location_url = url.to_string();
        if entry.record.status == AgentStatus::Unregistered || entry.record.status == AgentStatus::Stale {
            entry.record.status = AgentStatus::RegisteredUnconfirmed;
        }
        entry.touch();
        debug!(%handle, url, "agent registered");
    }

    /// Keep a record alive. Returns false for handles with no record.
    pub fn register_heartbeat(&self, handle: PageHandle) -> bool {
        self.update(handle, Entry::touch)
    }

    pub fn on_page_closed(&self, handle: PageHandle) {
        if self.records().remove(&handle).is_some() {
            debug!(%handle, "agent record removed, page closed");
        }
    }

    /// The page loaded a new document. Its agent must be confirmed again.
    pub fn on_page_navigated(&self, handle: PageHandle, url: &str) {
        let mut records = self.records();
        if !is_supported_url(url) {
            if records.remove(&handle).is_some() {
                debug!(%handle, url, "agent record removed, unsupported page");
            }
            return;
        }
        if let Some(entry) = records.get_mut(&handle) {
            entry.epoch += 1;
            entry.record.location_url = url.to_string();
            if entry.record.status == AgentStatus::RegisteredConfirmed {
                entry.record.status = AgentStatus::RegisteredUnconfirmed;
            }
            entry.touch();
            debug!(%handle, url, "page navigated, agent needs reconfirming");
        }
    }

    /// Drop records idle for longer than the inactivity threshold.
    pub fn sweep_inactive(&self) -> Vec<PageHandle> {
        let threshold = self.config.inactivity_threshold;
        let now = Instant::now();
        let mut removed = Vec::new();
        self.records().retain(|handle, entry| {
            let idle = now.duration_since(entry.record.last_activity);
            let keep = idle <= threshold || entry.injecting.as_ref().is_some_and(injection_live);
            if !keep {
                removed.push(*handle);
            }
            keep
        });
        if !removed.is_empty() {
            info!(count = removed.len(), "swept inactive agent records");
        }
        removed
    }

    pub fn handle_event(&self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Register { handle, url, ack } => {
                self.register(handle, &url);
                let _ = ack.send(());
            }
            CoordinatorEvent::Heartbeat { handle } => {
                if !self.register_heartbeat(handle) {
                    debug!(%handle, "heartbeat for unknown page");
                }
            }
            CoordinatorEvent::Navigated { handle, url } => self.on_page_navigated(handle, &url),
            CoordinatorEvent::Closed { handle } => self.on_page_closed(handle),
        }
    }

    /// Consume events and sweep periodically until shutdown is signaled or
    /// every sender is gone.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<CoordinatorEvent>,
        shutdown: Arc<Notify>,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let every = coordinator.config.sweep_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            info!(sweep_secs = every.as_secs(), "coordinator event loop started");
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        info!("coordinator event loop stopping");
                        break;
                    }
                    event = inbox.recv() => match event {
                        Some(event) => coordinator.handle_event(event),
                        None => {
                            debug!("coordinator inbox closed");
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        coordinator.sweep_inactive();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Host with one page whose agent behaviour is scripted.
    #[derive(Default)]
    struct ScriptedHost {
        url: Mutex<String>,
        calls: AtomicUsize,
        injected: AtomicBool,
        /// Probes that must fail after injection before the marker shows.
        probes_before_marker: AtomicUsize,
        marker_never: AtomicBool,
        agent_silent: AtomicBool,
        agent_gone: AtomicBool,
        /// The agent inbox is full: `deliver` never gets to queue.
        inbox_full: AtomicBool,
        /// Navigates the page through this coordinator during the next probe.
        navigate_on_probe: Mutex<Option<Arc<Coordinator>>>,
    }

    impl ScriptedHost {
        fn new(url: &str) -> Arc<Self> {
            let host = Self::default();
            *host.url.lock().unwrap() = url.to_string();
            Arc::new(host)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PageHost for ScriptedHost {
        async fn open(&self, _url: &str) -> ScanResult<PageHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PageHandle(1))
        }
        async fn wait_loaded(&self, _handle: PageHandle) -> ScanResult<()> {
            Ok(())
        }
        async fn navigate(&self, _handle: PageHandle, url: &str) -> ScanResult<()> {
            *self.url.lock().unwrap() = url.to_string();
            self.injected.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn url(&self, _handle: PageHandle) -> ScanResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.url.lock().unwrap().clone())
        }
        async fn inject(&self, _handle: PageHandle) -> ScanResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.injected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn probe_marker(&self, handle: PageHandle) -> ScanResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let navigate = self.navigate_on_probe.lock().unwrap().take();
            if let Some(coordinator) = navigate {
                coordinator.on_page_navigated(handle, "https://www.example.com/rice");
            }
            if !self.injected.load(Ordering::SeqCst) || self.marker_never.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let pending = self.probes_before_marker.load(Ordering::SeqCst);
            if pending > 0 {
                self.probes_before_marker.store(pending - 1, Ordering::SeqCst);
                return Ok(false);
            }
            Ok(true)
        }
        async fn deliver(
            &self,
            _handle: PageHandle,
            request: AgentRequest,
            responder: Responder,
        ) -> ScanResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.inbox_full.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.agent_gone.load(Ordering::SeqCst) {
                drop(responder);
                return Ok(());
            }
            if self.agent_silent.load(Ordering::SeqCst) {
                // Keep the responder alive without answering.
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    drop(responder);
                });
                return Ok(());
            }
            assert_eq!(request, AgentRequest::Ping);
            responder.respond(AgentResponse::pong());
            Ok(())
        }
        async fn close(&self, _handle: PageHandle) -> ScanResult<()> {
            Ok(())
        }
        fn open_pages(&self) -> usize {
            1
        }
    }

    const H: PageHandle = PageHandle(1);

    fn coordinator(host: Arc<ScriptedHost>) -> Arc<Coordinator> {
        Arc::new(Coordinator::new(host, RuntimeConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_only_after_probe() {
        let host = ScriptedHost::new("https://www.example.com/oats");
        host.probes_before_marker.store(2, Ordering::SeqCst);
        let coord = coordinator(Arc::clone(&host));

        let started = Instant::now();
        coord.ensure_injected(H, false).await.unwrap();
        assert_eq!(coord.status(H), Some(AgentStatus::RegisteredConfirmed));
        // Three probes: 500 + 625 + 750 ms of delay.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1875) && elapsed < Duration::from_millis(1900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_ensure_makes_no_host_calls() {
        let host = ScriptedHost::new("https://www.example.com/oats");
        let coord = coordinator(Arc::clone(&host));

        coord.ensure_injected(H, false).await.unwrap();
        let calls = host.calls();
        coord.ensure_injected(H, false).await.unwrap();
        coord.ensure_injected(H, false).await.unwrap();
        assert_eq!(host.calls(), calls);

        coord.ensure_injected(H, true).await.unwrap();
        assert!(host.calls() > calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_after_probe_budget() {
        let host = ScriptedHost::new("https://www.example.com/oats");
        host.marker_never.store(true, Ordering::SeqCst);
        let coord = coordinator(Arc::clone(&host));

        let err = coord.ensure_injected(H, false).await.unwrap_err();
        assert_eq!(err, ScanError::AgentUnconfirmed { attempts: 5 });
        // Injection succeeded, so the record is registered but not confirmed.
        assert_eq!(coord.status(H), Some(AgentStatus::RegisteredUnconfirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_ensure_injects_once() {
        let host = ScriptedHost::new("https://www.example.com/oats");
        let coord = coordinator(Arc::clone(&host));

        let (a, b) = tokio::join!(coord.ensure_injected(H, false), coord.ensure_injected(H, false));
        a.unwrap();
        b.unwrap();
        // url + inject + one probe.
        assert_eq!(host.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_scheme_removes_record() {
        let host = ScriptedHost::new("chrome://settings");
        let coord = coordinator(Arc::clone(&host));

        let err = coord.ensure_injected(H, false).await.unwrap_err();
        assert!(matches!(err, ScanError::UnsupportedScheme(_)));
        assert!(coord.status(H).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_demotes_confirmed_agent() {
        let host = ScriptedHost::new("https://www.example.com/oats");
        let coord = coordinator(Arc::clone(&host));
        coord.ensure_injected(H, false).await.unwrap();

        host.navigate(H, "https://www.example.com/rice").await.unwrap();
        coord.on_page_navigated(H, "https://www.example.com/rice");
        assert_eq!(coord.status(H), Some(AgentStatus::RegisteredUnconfirmed));
        assert!(coord.relay(H, AgentRequest::Ping).await.is_err());

        coord.ensure_injected(H, false).await.unwrap();
        assert_eq!(coord.status(H), Some(AgentStatus::RegisteredConfirmed));
        assert_eq!(coord.record(H).unwrap().location_url, "https://www.example.com/rice");

        coord.on_page_navigated(H, "about:blank");
        assert!(coord.status(H).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_round_trip() {
        let host = ScriptedHost::new("https://www.example.com/oats");
        let coord = coordinator(Arc::clone(&host));
        let response = coord.request(H, AgentRequest::Ping).await.unwrap();
        assert!(response.success);
        assert!(response.timestamp.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_times_out() {
        let host = ScriptedHost::new("https://www.example.com/oats");
        let coord = coordinator(Arc::clone(&host));
        coord.ensure_injected(H, false).await.unwrap();
        host.agent_silent.store(true, Ordering::SeqCst);

        let started = Instant::now();
        let err = coord.relay(H, AgentRequest::Ping).await.unwrap_err();
        assert_eq!(err, ScanError::RelayTimeout(Duration::from_secs(5)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_times_out_while_queueing() {
        let host = ScriptedHost::new("https://www.example.com/oats");
        let coord = coordinator(Arc::clone(&host));
        coord.ensure_injected(H, false).await.unwrap();
        host.inbox_full.store(true, Ordering::SeqCst);

        let started = Instant::now();
        for _ in 0..3 {
            let err = coord.relay(H, AgentRequest::Ping).await.unwrap_err();
            assert_eq!(err, ScanError::RelayTimeout(Duration::from_secs(5)));
        }
        assert!(started.elapsed() < Duration::from_millis(15_100));
        assert_eq!(coord.status(H), Some(AgentStatus::RegisteredConfirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_during_probe_is_not_confirmed() {
        let host = ScriptedHost::new("https://www.example.com/oats");
        let coord = coordinator(Arc::clone(&host));
        *host.navigate_on_probe.lock().unwrap() = Some(Arc::clone(&coord));

        // The waiting caller sees the same outcome as the injecting one.
        let (a, b) = tokio::join!(coord.ensure_injected(H, false), coord.ensure_injected(H, false));
        assert_eq!(a, Err(ScanError::AgentUnconfirmed { attempts: 1 }));
        assert_eq!(b, Err(ScanError::AgentUnconfirmed { attempts: 1 }));
        assert_eq!(coord.status(H), Some(AgentStatus::RegisteredUnconfirmed));
        assert_eq!(coord.record(H).unwrap().location_url, "https://www.example.com/rice");
        assert!(coord.relay(H, AgentRequest::Ping).await.is_err());

        coord.ensure_injected(H, false).await.unwrap();
        assert_eq!(coord.status(H), Some(AgentStatus::RegisteredConfirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_invalidated_is_not_retried() {
        let host = ScriptedHost::new("https://www.example.com/oats");
        let coord = coordinator(Arc::clone(&host));
        coord.ensure_injected(H, false).await.unwrap();
        host.agent_gone.store(true, Ordering::SeqCst);

        let calls = host.calls();
        let err = coord.request(H, AgentRequest::Ping).await.unwrap_err();
        assert_eq!(err, ScanError::ContextInvalidated);
        // One deliver, no reinjection.
        assert_eq!(host.calls(), calls + 1);
        assert_eq!(coord.status(H), Some(AgentStatus::Stale));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_idle_records() {
        let host = ScriptedHost::new("https://www.example.com/oats");
        let coord = coordinator(Arc::clone(&host));
        coord.register(H, "https://www.example.com/oats");
        coord.register(PageHandle(2), "https://www.example.com/rice");

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(coord.register_heartbeat(PageHandle(2)));
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(coord.sweep_inactive(), vec![H]);
        assert!(coord.status(H).is_none());
        assert_eq!(coord.status(PageHandle(2)), Some(AgentStatus::RegisteredUnconfirmed));
        assert!(!coord.register_heartbeat(H));
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_loop_acks_registration_and_sweeps() {
        let host = ScriptedHost::new("https://www.example.com/oats");
        let coord = coordinator(Arc::clone(&host));
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let task = coord.spawn_event_loop(rx, Arc::clone(&shutdown));

        let (ack, acked) = oneshot::channel();
        tx.send(CoordinatorEvent::Register {
            handle: H,
            url: "https://www.example.com/oats".into(),
            ack,
        })
        .unwrap();
        acked.await.unwrap();
        assert_eq!(coord.status(H), Some(AgentStatus::RegisteredUnconfirmed));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(coord.status(H).is_none());

        shutdown.notify_one();
        task.await.unwrap();
    }
}
