//! ---
//! certmgr_section: "04-provisioning-core"
//! certmgr_subsection: "module"
//! certmgr_type: "source"
//! certmgr_scope: "code"
//! certmgr_description: "Certificate request loop multiplexing timer, config and response events."
//! certmgr_version: "v0.1.0"
//! certmgr_owner: "platform"
//! ---
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use certmgr_common::{BusConfig, RequesterConfig};
use certmgr_metrics::RequesterMetrics;
use certmgr_msg::{
    decode_payload, ClusterConfig, Message, MessageBus, Payload, SslCertRequest, SslCertResponse,
    Subscription,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::installer::{CertInstaller, InstallError, UpdateCertsRequest};

/// Operating mode last reported by the certificate authority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    /// The serving component terminates TLS and needs a certificate.
    #[default]
    Managed,
    /// TLS is passed through; nothing to provision.
    Passthrough,
}

impl From<ClusterConfig> for ClusterMode {
    fn from(config: ClusterConfig) -> Self {
        if config.passthrough_enabled {
            ClusterMode::Passthrough
        } else {
            ClusterMode::Managed
        }
    }
}

/// Why a certificate request was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTrigger {
    Initial,
    Timer,
    ConfigChange,
}

impl RequestTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestTrigger::Initial => "initial",
            RequestTrigger::Timer => "timer",
            RequestTrigger::ConfigChange => "config_change",
        }
    }
}

/// Snapshot of the request loop, written only by the loop task.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterStatus {
    pub running: bool,
    pub mode: ClusterMode,
    #[serde(rename = "interval_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub installs_completed: u64,
    pub malformed_messages: u64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub last_install_at: Option<DateTime<Utc>>,
}

impl RequesterStatus {
    fn starting(interval: Duration) -> Self {
        Self {
            running: true,
            mode: ClusterMode::Managed,
            interval,
            requests_sent: 0,
            responses_received: 0,
            installs_completed: 0,
            malformed_messages: 0,
            last_request_at: None,
            last_install_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RequesterError {
    /// Installing a received certificate failed; the process should not continue.
    #[error("certificate installation failed: {0}")]
    Fatal(#[from] InstallError),
    #[error("request loop task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Timer whose period can be replaced while armed.
///
/// Ticks repeat every `period`; [`RearmTimer::rearm`] swaps the period and
/// restarts the countdown from now.
#[derive(Debug)]
pub struct RearmTimer {
    period: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl RearmTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            sleep: Box::pin(sleep(period)),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn deadline(&self) -> Instant {
        self.sleep.deadline()
    }

    pub fn rearm(&mut self, period: Duration) {
        self.period = period;
        self.sleep.as_mut().reset(Instant::now() + period);
    }

    /// Wait for the deadline and schedule the next one. Cancel safe.
    pub async fn tick(&mut self) {
        self.sleep.as_mut().await;
        let next = self.sleep.deadline() + self.period;
        self.sleep.as_mut().reset(next);
    }
}

/// Keeps the cluster's serving certificate fresh.
///
/// Publishes certificate requests, follows the authority's mode changes and
/// hands every received certificate to the [`CertInstaller`].
pub struct CertRequester {
    cluster_id: Uuid,
    bus: Arc<dyn MessageBus>,
    installer: CertInstaller,
    topics: BusConfig,
    intervals: RequesterConfig,
    metrics: Option<RequesterMetrics>,
}

impl CertRequester {
    pub fn new(
        cluster_id: Uuid,
        bus: Arc<dyn MessageBus>,
        installer: CertInstaller,
        topics: &BusConfig,
        intervals: &RequesterConfig,
    ) -> Self {
        Self {
            cluster_id,
            bus,
            installer,
            topics: topics.clone(),
            intervals: intervals.clone(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: RequesterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the loop on its own task.
    pub fn spawn(self) -> CertRequesterHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) =
            watch::channel(RequesterStatus::starting(self.intervals.active_interval));
        let task = tokio::spawn(self.run(stop_rx, status_tx));
        CertRequesterHandle {
            stop: stop_tx,
            status: status_rx,
            task: Some(task),
        }
    }

    /// Drive the loop until `stop` flips to `true` (or its sender is dropped).
    ///
    /// Returns `Ok(())` after a stop and [`RequesterError::Fatal`] when a
    /// received certificate could not be installed.
    pub async fn run(
        self,
        mut stop: watch::Receiver<bool>,
        status: watch::Sender<RequesterStatus>,
    ) -> Result<(), RequesterError> {
        info!(cluster_id = %self.cluster_id, "requesting ssl certificates");
        let mut responses = self.open(&self.topics.response_topic).await;
        let mut configs = self.open(&self.topics.config_topic).await;

        let mut state = LoopState {
            status,
            metrics: self.metrics.clone(),
            timer: RearmTimer::new(self.intervals.active_interval),
        };
        state.set_interval(self.intervals.active_interval);
        self.send_request(&mut state, RequestTrigger::Initial).await;

        let outcome = loop {
            if *stop.borrow() {
                break Ok(());
            }

            tokio::select! {
                // Stop wins over anything else that is ready.
                biased;

                changed = stop.changed() => {
                    if changed.is_err() {
                        debug!("stop handle dropped; shutting down");
                        break Ok(());
                    }
                }
                delivery = next_delivery(&mut configs) => match delivery {
                    Some(raw) => self.on_config(&mut state, raw).await,
                    None => close_channel(&mut configs),
                },
                delivery = next_delivery(&mut responses) => match delivery {
                    Some(raw) => {
                        if let Err(err) = self.on_response(&mut state, raw).await {
                            break Err(err);
                        }
                    }
                    None => close_channel(&mut responses),
                },
                _ = state.timer.tick() => {
                    info!(interval_secs = state.timer.period().as_secs(), "no certificate yet; re-requesting");
                    self.send_request(&mut state, RequestTrigger::Timer).await;
                }
            }
        };

        release(responses);
        release(configs);
        state.status.send_modify(|status| status.running = false);
        match &outcome {
            Ok(()) => info!("certificate requester stopped"),
            Err(err) => error!(error = %err, "certificate requester terminated"),
        }
        outcome
    }

    async fn open(&self, topic: &str) -> Option<Subscription> {
        match self.bus.subscribe(topic).await {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(topic, error = %err, "failed to subscribe; channel will stay silent");
                None
            }
        }
    }

    async fn send_request(&self, state: &mut LoopState, trigger: RequestTrigger) {
        let request = SslCertRequest {
            cluster_id: self.cluster_id,
        };
        let encoded = Message::for_cluster(self.cluster_id, request.into_payload()).encode();
        let published = match encoded {
            Ok(payload) => self.bus.publish(&self.topics.request_topic, payload).await,
            Err(err) => Err(err),
        };
        match published {
            Ok(()) => {
                debug!(trigger = trigger.as_str(), "certificate request published");
                if let Some(metrics) = &state.metrics {
                    metrics.record_request(trigger.as_str());
                }
                state.status.send_modify(|status| {
                    status.requests_sent += 1;
                    status.last_request_at = Some(Utc::now());
                });
            }
            Err(err) => {
                warn!(trigger = trigger.as_str(), error = %err, "failed to publish certificate request");
            }
        }
    }

    async fn on_config(&self, state: &mut LoopState, raw: Bytes) {
        let config = match decode_payload::<ClusterConfig>(&raw) {
            Ok(config) => config,
            Err(err) => {
                state.malformed("config", &err);
                return;
            }
        };

        let mode = ClusterMode::from(config);
        info!(mode = ?mode, "cluster config received");
        state.set_mode(mode);
        match mode {
            ClusterMode::Passthrough => {
                state.rearm(self.intervals.passthrough_interval);
            }
            ClusterMode::Managed => {
                state.rearm(self.intervals.active_interval);
                self.send_request(state, RequestTrigger::ConfigChange).await;
            }
        }
    }

    async fn on_response(&self, state: &mut LoopState, raw: Bytes) -> Result<(), RequesterError> {
        let response = match decode_payload::<SslCertResponse>(&raw) {
            Ok(response) => response,
            Err(err) => {
                state.malformed("response", &err);
                return Ok(());
            }
        };

        info!("ssl certificate received");
        if let Some(metrics) = &state.metrics {
            metrics.record_response();
        }
        state
            .status
            .send_modify(|status| status.responses_received += 1);

        let SslCertResponse { key, cert } = response;
        match self
            .installer
            .update_certs(UpdateCertsRequest { key, cert })
            .await
        {
            Ok(reply) => {
                info!(ok = reply.ok, "certs updated");
                if let Some(metrics) = &state.metrics {
                    metrics.record_install("success");
                }
                state.status.send_modify(|status| {
                    status.installs_completed += 1;
                    status.last_install_at = Some(Utc::now());
                });
                state.rearm(self.intervals.installed_interval);
                Ok(())
            }
            Err(err) => {
                error!(error = %err, kind = err.kind().as_str(), "failed to update certs");
                if let Some(metrics) = &state.metrics {
                    metrics.record_install(err.kind().as_str());
                }
                Err(RequesterError::Fatal(err))
            }
        }
    }
}

impl std::fmt::Debug for CertRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertRequester")
            .field("cluster_id", &self.cluster_id)
            .field("bus", &self.bus.name())
            .field("installer", &self.installer)
            .field("intervals", &self.intervals)
            .finish()
    }
}

struct LoopState {
    status: watch::Sender<RequesterStatus>,
    metrics: Option<RequesterMetrics>,
    timer: RearmTimer,
}

impl LoopState {
    fn rearm(&mut self, interval: Duration) {
        self.timer.rearm(interval);
        self.set_interval(interval);
        debug!(interval_secs = interval.as_secs(), "request timer re-armed");
    }

    fn set_interval(&self, interval: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.set_interval(interval);
        }
        self.status.send_modify(|status| status.interval = interval);
    }

    fn set_mode(&self, mode: ClusterMode) {
        if let Some(metrics) = &self.metrics {
            metrics.set_passthrough(mode == ClusterMode::Passthrough);
        }
        self.status.send_modify(|status| status.mode = mode);
    }

    fn malformed(&self, channel: &str, err: &certmgr_msg::MessagingError) {
        warn!(channel, error = %err, "ignoring malformed message");
        if let Some(metrics) = &self.metrics {
            metrics.record_malformed(channel);
        }
        self.status
            .send_modify(|status| status.malformed_messages += 1);
    }
}

async fn next_delivery(subscription: &mut Option<Subscription>) -> Option<Bytes> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

fn close_channel(subscription: &mut Option<Subscription>) {
    if let Some(closed) = subscription.take() {
        warn!(topic = closed.topic(), "delivery channel closed; no longer listening");
        release(Some(closed));
    }
}

fn release(subscription: Option<Subscription>) {
    if let Some(subscription) = subscription {
        let topic = subscription.topic().to_owned();
        if let Err(err) = subscription.unsubscribe() {
            error!(topic = %topic, error = %err, "failed to unsubscribe");
        }
    }
}

/// Control handle for a spawned [`CertRequester`].
#[derive(Debug)]
pub struct CertRequesterHandle {
    stop: watch::Sender<bool>,
    status: watch::Receiver<RequesterStatus>,
    task: Option<JoinHandle<Result<(), RequesterError>>>,
}

impl CertRequesterHandle {
    /// Latest status snapshot.
    pub fn status(&self) -> RequesterStatus {
        self.status.borrow().clone()
    }

    /// Receiver following every status update.
    pub fn subscribe_status(&self) -> watch::Receiver<RequesterStatus> {
        self.status.clone()
    }

    /// Resolve when the loop ends by itself. Cancel safe.
    pub async fn wait(&mut self) -> Result<(), RequesterError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let outcome = task.await;
        self.task = None;
        outcome?
    }

    /// Signal the loop to stop and wait until it has released its subscriptions.
    pub async fn stop(mut self) -> Result<(), RequesterError> {
        let _ = self.stop.send(true);
        self.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::InMemoryResourceManager;
    use certmgr_common::InstallConfig;
    use certmgr_msg::{InMemoryBus, MessagingError};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Harness {
        bus: InMemoryBus,
        resources: Arc<InMemoryResourceManager>,
        requests: Subscription,
        handle: CertRequesterHandle,
    }

    async fn start(resources: InMemoryResourceManager) -> Harness {
        let bus = InMemoryBus::new();
        let resources = Arc::new(resources);
        let requests = bus.subscribe("v2c.ssl").await.expect("subscribe");
        let installer = CertInstaller::new(resources.clone(), &InstallConfig::default());
        let handle = CertRequester::new(
            Uuid::new_v4(),
            Arc::new(bus.clone()),
            installer,
            &BusConfig::default(),
            &RequesterConfig::default(),
        )
        .spawn();
        let mut harness = Harness {
            bus,
            resources,
            requests,
            handle,
        };
        harness.requests.recv().await.expect("initial request");
        harness
    }

    async fn publish(bus: &InMemoryBus, topic: &str, payload: certmgr_msg::MessagePayload) {
        let raw = Message::new(payload).encode().expect("encode");
        bus.publish(topic, raw).await.expect("publish");
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_period_and_deadline() {
        let mut timer = RearmTimer::new(Duration::from_secs(30));
        let started = Instant::now();
        timer.tick().await;
        assert_eq!(started.elapsed(), Duration::from_secs(30));

        timer.rearm(Duration::from_secs(5));
        assert_eq!(timer.period(), Duration::from_secs(5));
        let rearmed = Instant::now();
        timer.tick().await;
        timer.tick().await;
        assert_eq!(rearmed.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_request_carries_cluster_identity() {
        let bus = InMemoryBus::new();
        let mut requests = bus.subscribe("v2c.ssl").await.expect("subscribe");
        let cluster_id = Uuid::new_v4();
        let installer = CertInstaller::new(
            Arc::new(InMemoryResourceManager::new()),
            &InstallConfig::default(),
        );
        let handle = CertRequester::new(
            cluster_id,
            Arc::new(bus.clone()),
            installer,
            &BusConfig::default(),
            &RequesterConfig::default(),
        )
        .spawn();

        let raw = requests.recv().await.expect("request");
        let message = Message::decode(&raw).expect("decode");
        assert_eq!(message.cluster_id, Some(cluster_id));
        let request = decode_payload::<SslCertRequest>(&raw).expect("payload");
        assert_eq!(request.cluster_id, cluster_id);

        handle.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn silence_re_requests_once_per_active_interval() {
        let mut harness = start(InMemoryResourceManager::new()).await;
        let waited = Instant::now();

        harness.requests.recv().await.expect("timer request");
        assert_eq!(waited.elapsed(), Duration::from_secs(30));
        assert!(
            timeout(Duration::from_secs(29), harness.requests.recv())
                .await
                .is_err(),
            "only one request per interval"
        );

        let status = harness.handle.status();
        assert_eq!(status.interval, Duration::from_secs(30));
        assert_eq!(status.requests_sent, 2);
        harness.handle.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn passthrough_idles_and_managed_requests_immediately() {
        let mut harness = start(InMemoryResourceManager::new()).await;
        let mut status = harness.handle.subscribe_status();

        publish(
            &harness.bus,
            "c2v.sslVizierConfigResp",
            ClusterConfig {
                passthrough_enabled: true,
            }
            .into_payload(),
        )
        .await;
        status
            .wait_for(|s| s.mode == ClusterMode::Passthrough)
            .await
            .expect("passthrough observed");
        assert_eq!(harness.handle.status().interval, Duration::from_secs(3600));
        assert!(
            timeout(Duration::from_secs(3500), harness.requests.recv())
                .await
                .is_err(),
            "no requests while passthrough"
        );

        let switched = Instant::now();
        publish(
            &harness.bus,
            "c2v.sslVizierConfigResp",
            ClusterConfig {
                passthrough_enabled: false,
            }
            .into_payload(),
        )
        .await;
        harness.requests.recv().await.expect("immediate request");
        assert_eq!(switched.elapsed(), Duration::ZERO);

        let current = harness.handle.status();
        assert_eq!(current.mode, ClusterMode::Managed);
        assert_eq!(current.interval, Duration::from_secs(30));
        harness.handle.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn passthrough_wins_regardless_of_prior_interval() {
        let harness = start(
            InMemoryResourceManager::new().with_instances("vizier-proxy-service", ["proxy-0"]),
        )
        .await;
        let mut status = harness.handle.subscribe_status();

        publish(
            &harness.bus,
            "c2v.sslResp",
            SslCertResponse {
                key: "K".into(),
                cert: "C".into(),
            }
            .into_payload(),
        )
        .await;
        status
            .wait_for(|s| s.installs_completed == 1)
            .await
            .expect("install observed");
        assert_eq!(harness.handle.status().interval, Duration::from_secs(300));

        publish(
            &harness.bus,
            "c2v.sslVizierConfigResp",
            ClusterConfig {
                passthrough_enabled: true,
            }
            .into_payload(),
        )
        .await;
        status
            .wait_for(|s| s.interval == Duration::from_secs(3600))
            .await
            .expect("idle interval");
        harness.handle.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn response_installs_and_backs_off() {
        let harness = start(
            InMemoryResourceManager::new().with_instances("vizier-proxy-service", ["proxy-0"]),
        )
        .await;
        let mut status = harness.handle.subscribe_status();

        publish(
            &harness.bus,
            "c2v.sslResp",
            SslCertResponse {
                key: "K".into(),
                cert: "C".into(),
            }
            .into_payload(),
        )
        .await;
        status
            .wait_for(|s| s.installs_completed == 1)
            .await
            .expect("install observed");

        let stored = harness.resources.secret("proxy-tls-certs").expect("secret");
        assert_eq!((stored.key.as_str(), stored.cert.as_str()), ("K", "C"));
        assert_eq!(harness.resources.deleted_instances(), vec!["proxy-0"]);
        assert_eq!(harness.handle.status().interval, Duration::from_secs(300));
        harness.handle.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_instances_end_the_loop_fatally() {
        let mut harness = start(InMemoryResourceManager::new()).await;

        publish(
            &harness.bus,
            "c2v.sslResp",
            SslCertResponse {
                key: "K".into(),
                cert: "C".into(),
            }
            .into_payload(),
        )
        .await;

        let outcome = harness.handle.wait().await;
        assert!(matches!(
            outcome,
            Err(RequesterError::Fatal(InstallError::NoTargetInstances { .. }))
        ));
        assert!(harness.resources.secret("proxy-tls-certs").is_some());
        assert!(!harness.handle.status().running);
        assert_eq!(harness.bus.subscriber_count("c2v.sslResp"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_messages_are_ignored() {
        let harness = start(InMemoryResourceManager::new()).await;
        let mut status = harness.handle.subscribe_status();

        harness
            .bus
            .publish("c2v.sslVizierConfigResp", Bytes::from_static(b"garbage"))
            .await
            .expect("publish");
        publish(
            &harness.bus,
            "c2v.sslResp",
            ClusterConfig::default().into_payload(),
        )
        .await;
        status
            .wait_for(|s| s.malformed_messages == 2)
            .await
            .expect("malformed observed");

        let current = harness.handle.status();
        assert!(current.running);
        assert_eq!(current.interval, Duration::from_secs(30));
        assert_eq!(current.mode, ClusterMode::Managed);
        assert_eq!(current.installs_completed, 0);
        harness.handle.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_subscriptions_promptly() {
        let mut harness = start(InMemoryResourceManager::new()).await;
        assert_eq!(harness.bus.subscriber_count("c2v.sslResp"), 1);
        assert_eq!(harness.bus.subscriber_count("c2v.sslVizierConfigResp"), 1);

        timeout(Duration::from_secs(1), harness.handle.stop())
            .await
            .expect("stops in bounded time")
            .expect("clean stop");

        assert_eq!(harness.bus.subscriber_count("c2v.sslResp"), 0);
        assert_eq!(harness.bus.subscriber_count("c2v.sslVizierConfigResp"), 0);
        assert!(
            timeout(Duration::from_secs(120), harness.requests.recv())
                .await
                .is_err(),
            "no requests after stop"
        );
    }

    /// Bus that refuses chosen subscriptions, fails the first publishes and
    /// hands out delivery channels the test can close.
    struct FlakyBus {
        inner: InMemoryBus,
        refused: Vec<&'static str>,
        failing_publishes: AtomicUsize,
        detached: Vec<&'static str>,
        senders: Mutex<HashMap<String, mpsc::Sender<Bytes>>>,
        released: Arc<Mutex<Vec<String>>>,
    }

    impl FlakyBus {
        fn new(inner: InMemoryBus) -> Self {
            Self {
                inner,
                refused: Vec::new(),
                failing_publishes: AtomicUsize::new(0),
                detached: Vec::new(),
                senders: Mutex::new(HashMap::new()),
                released: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn close(&self, topic: &str) {
            self.senders.lock().remove(topic);
        }

        fn released(&self) -> Vec<String> {
            self.released.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl MessageBus for FlakyBus {
        async fn publish(&self, topic: &str, payload: Bytes) -> certmgr_msg::Result<()> {
            let fail = self
                .failing_publishes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(MessagingError::Unavailable("broker unreachable".into()));
            }
            self.inner.publish(topic, payload).await
        }

        async fn subscribe(&self, topic: &str) -> certmgr_msg::Result<Subscription> {
            if self.refused.iter().any(|refused| *refused == topic) {
                return Err(MessagingError::Unavailable(format!("{topic} refused")));
            }
            if self.detached.iter().any(|detached| *detached == topic) {
                let (sender, receiver) = mpsc::channel(8);
                self.senders.lock().insert(topic.to_owned(), sender);
                let released = self.released.clone();
                let name = topic.to_owned();
                return Ok(Subscription::new(topic, receiver, move || {
                    released.lock().push(name);
                    Ok(())
                }));
            }
            self.inner.subscribe(topic).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn spawn_on(bus: Arc<FlakyBus>, resources: InMemoryResourceManager) -> CertRequesterHandle {
        let installer = CertInstaller::new(Arc::new(resources), &InstallConfig::default());
        CertRequester::new(
            Uuid::new_v4(),
            bus,
            installer,
            &BusConfig::default(),
            &RequesterConfig::default(),
        )
        .spawn()
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_fall_back_to_the_timer() {
        let inner = InMemoryBus::new();
        let mut requests = inner.subscribe("v2c.ssl").await.expect("subscribe");
        let mut bus = FlakyBus::new(inner.clone());
        bus.refused.push("c2v.sslResp");
        bus.failing_publishes.store(1, Ordering::SeqCst);

        let started = Instant::now();
        let handle = spawn_on(Arc::new(bus), InMemoryResourceManager::new());

        requests.recv().await.expect("timer request");
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        let current = handle.status();
        assert!(current.running);
        assert_eq!(current.requests_sent, 1);
        assert_eq!(inner.subscriber_count("c2v.sslResp"), 0);

        let mut status = handle.subscribe_status();
        publish(
            &inner,
            "c2v.sslVizierConfigResp",
            ClusterConfig {
                passthrough_enabled: true,
            }
            .into_payload(),
        )
        .await;
        status
            .wait_for(|s| s.mode == ClusterMode::Passthrough)
            .await
            .expect("config still handled");
        let current = handle.status();
        assert!(current.running);
        assert_eq!(current.interval, Duration::from_secs(3600));

        handle.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_is_dropped_without_stalling_the_loop() {
        let inner = InMemoryBus::new();
        let mut requests = inner.subscribe("v2c.ssl").await.expect("subscribe");
        let mut bus = FlakyBus::new(inner.clone());
        bus.detached.push("c2v.sslVizierConfigResp");
        let bus = Arc::new(bus);

        let started = Instant::now();
        let handle = spawn_on(
            bus.clone(),
            InMemoryResourceManager::new().with_instances("vizier-proxy-service", ["proxy-0"]),
        );
        requests.recv().await.expect("initial request");

        bus.close("c2v.sslVizierConfigResp");
        requests.recv().await.expect("timer request");
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(bus.released(), vec!["c2v.sslVizierConfigResp"]);
        assert!(handle.status().running);

        let mut status = handle.subscribe_status();
        publish(
            &inner,
            "c2v.sslResp",
            SslCertResponse {
                key: "k".into(),
                cert: "c".into(),
            }
            .into_payload(),
        )
        .await;
        status
            .wait_for(|s| s.installs_completed == 1)
            .await
            .expect("responses still handled");
        assert_eq!(handle.status().interval, Duration::from_secs(300));

        handle.stop().await.expect("stop");
        assert_eq!(bus.released(), vec!["c2v.sslVizierConfigResp"]);
    }

    #[test]
    fn status_serializes_interval_in_seconds() {
        let status = RequesterStatus::starting(Duration::from_secs(30));
        let value = serde_json::to_value(&status).expect("json");
        assert_eq!(value["interval_secs"], 30);
        assert_eq!(value["mode"], "managed");
    }
}
