//! Alert delivery and remote control over a chat transport.
//!
//! The channel runs on its own thread with a single-threaded tokio runtime.
//! [`NotificationChannel::submit`] hands alerts to that loop through an
//! unbounded queue and returns immediately; delivery happens concurrently and
//! failures are logged and dropped. Startup connects with exponential backoff
//! and publishes its progress as a [`ChannelState`].

pub mod commands;
pub mod telegram;

use std::{
    fmt, io,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

pub use commands::{CommandRouter, InboundCommand, StatusReporter};

use crate::monitor::{
    adjudicator::VerdictStatus, alert_gate::AlertSink, telemetry::spawn_thread,
};

/// A dispatched security alert.
#[derive(Clone, Debug)]
pub struct Alert {
    /// Evidence photo, when one could be saved.
    pub artifact: Option<PathBuf>,
    pub summary: String,
    pub severity: VerdictStatus,
    pub raised_at: DateTime<Local>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote API rejected the request: {0}")]
    Api(String),
    #[error("notification runtime could not start: {0}")]
    Runtime(#[source] io::Error),
}

/// Lifecycle of the notification channel as seen from other threads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    /// Not configured; alerts are dropped.
    Disabled,
    /// Connecting for the first time.
    Starting,
    Ready,
    /// The last connection attempt failed. Retrying unless attempts are exhausted.
    Failed { attempts: u32, last_error: String },
    Stopped,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Disabled => f.write_str("DISABLED"),
            ChannelState::Starting => f.write_str("STARTING"),
            ChannelState::Ready => f.write_str("READY"),
            ChannelState::Failed { attempts, .. } => write!(f, "FAILED ({attempts} attempts)"),
            ChannelState::Stopped => f.write_str("STOPPED"),
        }
    }
}

/// Inbound commands fetched by one poll.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandBatch {
    /// Offset acknowledging everything in this batch.
    pub next_offset: Option<i64>,
    pub commands: Vec<InboundCommand>,
}

/// Chat backend used by the channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Check credentials and reachability. Returns the remote account name.
    async fn connect(&self) -> Result<String, NotifyError>;

    async fn send_alert(&self, alert: &Alert) -> Result<(), NotifyError>;

    /// Long-poll for commands newer than `offset`.
    async fn poll_commands(&self, offset: Option<i64>) -> Result<CommandBatch, NotifyError>;

    async fn reply(&self, chat_id: i64, text: &str) -> Result<(), NotifyError>;
}

#[derive(Clone, Debug)]
pub struct ChannelSettings {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Give up connecting after this many attempts. `None` retries until stopped.
    pub max_attempts: Option<u32>,
    /// How long in-flight deliveries may run after a stop request.
    pub flush_timeout: Duration,
    /// Pause after a failed command poll.
    pub poll_error_backoff: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_attempts: None,
            flush_timeout: Duration::from_secs(5),
            poll_error_backoff: Duration::from_secs(5),
        }
    }
}

/// Read-only view of the channel state for other threads.
#[derive(Clone, Debug)]
pub struct ChannelStatus(watch::Receiver<ChannelState>);

impl ChannelStatus {
    pub fn current(&self) -> ChannelState {
        self.0.borrow().clone()
    }
}

pub struct NotificationChannel {
    state: Arc<watch::Sender<ChannelState>>,
    alerts: Option<mpsc::UnboundedSender<Alert>>,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl NotificationChannel {
    /// A channel that drops every alert, used when credentials are missing.
    pub fn disabled(reason: &str) -> Self {
        warn!("notifications disabled: {reason}");
        let (state, _) = watch::channel(ChannelState::Disabled);
        Self {
            state: Arc::new(state),
            alerts: None,
            shutdown: None,
            handle: None,
        }
    }

    /// Spawn the notification thread and begin connecting.
    pub fn start(
        transport: Arc<dyn Transport>,
        router: CommandRouter,
        settings: ChannelSettings,
    ) -> Result<Self, NotifyError> {
        let (state_tx, _) = watch::channel(ChannelState::Starting);
        let state = Arc::new(state_tx);
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(NotifyError::Runtime)?;

        let loop_state = state.clone();
        let handle = spawn_thread("notifier", move || {
            runtime.block_on(run_channel(
                transport,
                router,
                settings,
                alert_rx,
                shutdown_rx,
                loop_state,
            ));
        })
        .map_err(NotifyError::Runtime)?;

        Ok(Self {
            state,
            alerts: Some(alert_tx),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus(self.state.subscribe())
    }

    /// Queue `alert` for delivery. Never blocks; drops the alert unless READY.
    pub fn submit(&self, alert: Alert) {
        let state = self.state();
        match (&self.alerts, state) {
            (Some(alerts), ChannelState::Ready) => {
                if alerts.send(alert).is_err() {
                    warn!("notification loop has exited; alert dropped");
                    metrics::counter!("monitor_alerts_dropped_total").increment(1);
                }
            }
            (_, state) => {
                warn!(state = %state, "notification channel not ready; alert dropped");
                metrics::counter!("monitor_alerts_dropped_total").increment(1);
            }
        }
    }

    /// Stop polling, flush in-flight deliveries and join the thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.alerts.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("notification thread panicked");
            }
            self.state.send_replace(ChannelState::Stopped);
            info!("notification channel stopped");
        }
    }
}

impl AlertSink for NotificationChannel {
    fn submit(&self, alert: Alert) {
        NotificationChannel::submit(self, alert);
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_channel(
    transport: Arc<dyn Transport>,
    router: CommandRouter,
    settings: ChannelSettings,
    mut alerts: mpsc::UnboundedReceiver<Alert>,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<watch::Sender<ChannelState>>,
) {
    let Some(account) = connect_with_retry(transport.as_ref(), &settings, &mut shutdown, &state).await
    else {
        return;
    };
    info!(account = %account, "notification channel ready");
    state.send_replace(ChannelState::Ready);

    let poller = tokio::spawn(poll_commands(
        transport.clone(),
        router.for_account(&account),
        settings.poll_error_backoff,
        shutdown.clone(),
    ));

    let mut deliveries = JoinSet::new();
    loop {
        tokio::select! {
            received = alerts.recv() => match received {
                Some(alert) => {
                    deliveries.spawn(deliver(transport.clone(), alert));
                }
                None => break,
            },
            _ = shutdown.changed() => break,
            Some(joined) = deliveries.join_next(), if !deliveries.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        error!("alert delivery task panicked");
                    }
                }
            }
        }
    }

    state.send_replace(ChannelState::Stopped);
    // Alerts accepted before the stop request still get an attempt.
    while let Ok(alert) = alerts.try_recv() {
        deliveries.spawn(deliver(transport.clone(), alert));
    }
    if !deliveries.is_empty() {
        info!(pending = deliveries.len(), "flushing in-flight alert deliveries");
    }
    let flushed = tokio::time::timeout(settings.flush_timeout, async {
        while deliveries.join_next().await.is_some() {}
    })
    .await;
    if flushed.is_err() {
        warn!(
            abandoned = deliveries.len(),
            "flush window elapsed; aborting remaining deliveries"
        );
        deliveries.abort_all();
    }

    poller.abort();
    let _ = poller.await;
    debug!("notification loop closed");
}

async fn connect_with_retry(
    transport: &dyn Transport,
    settings: &ChannelSettings,
    shutdown: &mut watch::Receiver<bool>,
    state: &watch::Sender<ChannelState>,
) -> Option<String> {
    let mut attempts = 0u32;
    let mut delay = settings.initial_backoff;
    loop {
        attempts += 1;
        let result = tokio::select! {
            result = transport.connect() => result,
            _ = shutdown.changed() => {
                state.send_replace(ChannelState::Stopped);
                return None;
            }
        };

        let last_error = match result {
            Ok(account) => return Some(account),
            Err(err) => err.to_string(),
        };
        metrics::counter!("monitor_notifier_connect_failures_total").increment(1);
        state.send_replace(ChannelState::Failed {
            attempts,
            last_error: last_error.clone(),
        });
        if settings.max_attempts.is_some_and(|max| attempts >= max) {
            error!(attempts, "notification channel gave up connecting: {last_error}");
            return None;
        }
        warn!(
            attempts,
            retry_in_s = delay.as_secs_f32(),
            "notification channel connect failed: {last_error}"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                state.send_replace(ChannelState::Stopped);
                return None;
            }
        }
        delay = (delay * 2).min(settings.max_backoff);
    }
}

async fn deliver(transport: Arc<dyn Transport>, alert: Alert) {
    match transport.send_alert(&alert).await {
        Ok(()) => {
            info!(severity = alert.severity.as_str(), "alert delivered");
            metrics::counter!("monitor_alert_deliveries_total", "result" => "ok").increment(1);
        }
        Err(err) => {
            error!("alert delivery failed, dropping alert: {err}");
            metrics::counter!("monitor_alert_deliveries_total", "result" => "failed").increment(1);
        }
    }
}

async fn poll_commands(
    transport: Arc<dyn Transport>,
    router: CommandRouter,
    error_backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut offset = None;
    loop {
        let batch = tokio::select! {
            batch = transport.poll_commands(offset) => batch,
            _ = shutdown.changed() => break,
        };
        match batch {
            Ok(batch) => {
                if batch.next_offset.is_some() {
                    offset = batch.next_offset;
                }
                for command in batch.commands {
                    let outcome = router.handle(&command);
                    let Some(text) = outcome.reply() else {
                        continue;
                    };
                    if let Err(err) = transport.reply(command.chat_id, &text).await {
                        warn!("failed to reply to remote command: {err}");
                    }
                }
            }
            Err(err) => {
                warn!("command polling failed: {err}");
                tokio::select! {
                    _ = tokio::time::sleep(error_backoff) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
    debug!("command polling stopped");
}
