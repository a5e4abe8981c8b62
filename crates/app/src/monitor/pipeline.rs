//! Orchestrator tying together capture, adjudication, alert gating,
//! notification and the preview server.
//!
//! One tick reads at most one frame, classifies it, lets the gate decide on an
//! alert and publishes the annotated result. Ticks run on a fixed interval;
//! an empty mailbox just means the tick has nothing to do. Pose inference is
//! bounded by a deadline so a stalled model cannot hold up the loop.

use std::{
    sync::{
        Arc, Mutex, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{debug, info, warn};
use video_ingest::{FrameSource, SourceOptions, SourceStatsSnapshot};

use crate::monitor::{
    adjudicator::{AdjudicatorSettings, FrameAdjudicator, VerdictStatus},
    alert_gate::{AlertGate, GateOutcome},
    annotation,
    armed::ArmedState,
    backend,
    config::MonitorConfig,
    counters::Counters,
    data::{FramePacket, SharedFrame, VerdictSummary, status_report},
    evidence::{EvidenceStore, encode_jpeg},
    inference::DeadlineEstimator,
    notifier::{
        ChannelSettings, CommandRouter, NotificationChannel, StatusReporter,
        telegram::TelegramTransport,
    },
    roi::Roi,
    server::{PreviewServer, ServerState, spawn_preview_server},
    telemetry,
};

/// Long-poll window for inbound commands.
const COMMAND_POLL_TIMEOUT: Duration = Duration::from_secs(25);
/// Ticks between capture statistics updates.
const STATS_EVERY_TICKS: u64 = 500;

/// Run the monitor until Ctrl+C.
pub fn run(config: MonitorConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry_guard = telemetry::init_tracing(Some(&config.log_dir));
    let _ = telemetry::init_metrics_recorder();
    let monitor_span = tracing::info_span!(
        "monitor",
        source = %config.source,
        width = config.width,
        height = config.height,
        roi = %config.roi,
    );
    let _monitor_span_guard = monitor_span.enter();

    let estimator = backend::load_pose_estimator(&config)?;
    let device = backend::open_capture(&config)?;

    let armed = ArmedState::new(config.start_armed);
    let counters = Counters::default();
    let notifier = start_notifier(&config, &armed, &counters);

    let mut source = FrameSource::new(device, SourceOptions::default());
    source.start().context("Failed to start frame acquisition")?;

    let estimator = DeadlineEstimator::spawn(estimator, config.inference_timeout)
        .context("Failed to start pose inference worker")?;
    let adjudicator = FrameAdjudicator::new(
        Box::new(estimator),
        None,
        AdjudicatorSettings {
            confidence_threshold: config.confidence,
            identity_interval: config.identity_interval,
            identity_eviction_frames: config.identity_eviction_frames,
        },
    );
    let gate = AlertGate::new(
        config.cooldown,
        EvidenceStore::new(&config.evidence_dir, config.jpeg_quality),
    );

    let mut orchestrator = Orchestrator::new(
        source,
        adjudicator,
        gate,
        notifier,
        OrchestratorSettings {
            roi: config.roi.clone(),
            tick_interval: config.tick_interval,
            jpeg_quality: config.jpeg_quality,
            publish_frames: config.preview_addr.is_some(),
            armed,
            counters,
        },
    );

    if let Some(addr) = config.preview_addr {
        let server = spawn_preview_server(addr, orchestrator.server_state())
            .context("Failed to start preview server")?;
        orchestrator.attach_preview(server);
    }

    let running = Arc::new(AtomicBool::new(true));
    let handler_running = running.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_running.store(false, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    info!(
        mode = orchestrator.armed.label(),
        cooldown_s = config.cooldown.as_secs(),
        "monitoring started, press Ctrl+C to stop"
    );
    orchestrator.run(&running);
    orchestrator.shutdown();
    Ok(())
}

/// Build the Telegram channel, or a disabled one when it cannot be configured.
fn start_notifier(config: &MonitorConfig, armed: &ArmedState, counters: &Counters) -> NotificationChannel {
    let Some(credentials) = config.telegram.as_ref() else {
        return NotificationChannel::disabled("TELEGRAM_TOKEN or CHAT_ID not configured");
    };
    let transport = match TelegramTransport::new(credentials, COMMAND_POLL_TIMEOUT) {
        Ok(transport) => transport,
        Err(err) => return NotificationChannel::disabled(&format!("HTTP client unavailable: {err}")),
    };

    let reporter: StatusReporter = {
        let armed = armed.clone();
        let counters = counters.clone();
        Arc::new(move || status_report(&armed, &counters))
    };
    let router = CommandRouter::new(config.allowed_ids.clone(), armed.clone(), reporter);
    let settings = ChannelSettings {
        max_attempts: config.notifier_max_attempts,
        ..ChannelSettings::default()
    };
    match NotificationChannel::start(Arc::new(transport), router, settings) {
        Ok(channel) => channel,
        Err(err) => NotificationChannel::disabled(&err.to_string()),
    }
}

pub(crate) struct OrchestratorSettings {
    pub(crate) roi: Roi,
    pub(crate) tick_interval: Duration,
    pub(crate) jpeg_quality: u8,
    /// Encode annotated frames for the preview server.
    pub(crate) publish_frames: bool,
    pub(crate) armed: ArmedState,
    pub(crate) counters: Counters,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TickStats {
    pub(crate) ticks: u64,
    pub(crate) frames: u64,
    pub(crate) overruns: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// No new frame in the mailbox.
    Idle,
    Processed {
        status: VerdictStatus,
        gate: GateOutcome,
    },
}

pub(crate) struct Orchestrator {
    source: FrameSource,
    adjudicator: FrameAdjudicator,
    gate: AlertGate,
    notifier: NotificationChannel,
    preview: Option<PreviewServer>,
    roi: Roi,
    armed: ArmedState,
    counters: Counters,
    latest: SharedFrame,
    tick_interval: Duration,
    jpeg_quality: u8,
    publish_frames: bool,
    stats: TickStats,
    last_source_stats: SourceStatsSnapshot,
}

impl Orchestrator {
    pub(crate) fn new(
        source: FrameSource,
        adjudicator: FrameAdjudicator,
        gate: AlertGate,
        notifier: NotificationChannel,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            source,
            adjudicator,
            gate,
            notifier,
            preview: None,
            roi: settings.roi,
            armed: settings.armed,
            counters: settings.counters,
            latest: Arc::new(Mutex::new(None)),
            tick_interval: settings.tick_interval,
            jpeg_quality: settings.jpeg_quality,
            publish_frames: settings.publish_frames,
            stats: TickStats::default(),
            last_source_stats: SourceStatsSnapshot::default(),
        }
    }

    pub(crate) fn server_state(&self) -> ServerState {
        ServerState {
            latest: self.latest.clone(),
            armed: self.armed.clone(),
            counters: self.counters.clone(),
            notifier: self.notifier.status(),
        }
    }

    pub(crate) fn attach_preview(&mut self, server: PreviewServer) {
        self.preview = Some(server);
    }

    pub(crate) fn stats(&self) -> TickStats {
        self.stats
    }

    /// Tick until `running` is cleared. Ticks that take longer than the
    /// interval start the next one immediately and are counted as overruns.
    pub(crate) fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.tick();
            let elapsed = started.elapsed();

            metrics::histogram!("monitor_tick_seconds").record(elapsed.as_secs_f64());
            if elapsed > self.tick_interval {
                self.stats.overruns += 1;
                metrics::counter!("monitor_tick_overruns_total").increment(1);
                debug!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = self.tick_interval.as_millis() as u64,
                    overruns = self.stats.overruns,
                    "tick overran its interval"
                );
            } else {
                thread::sleep(self.tick_interval - elapsed);
            }
        }
        info!(
            ticks = self.stats.ticks,
            frames = self.stats.frames,
            overruns = self.stats.overruns,
            "tick loop stopped"
        );
    }

    /// Process at most one frame.
    pub(crate) fn tick(&mut self) -> TickOutcome {
        self.stats.ticks += 1;
        metrics::counter!("monitor_ticks_total").increment(1);
        if self.stats.ticks % STATS_EVERY_TICKS == 0 {
            self.record_source_stats();
        }

        let Some(frame) = self.source.read() else {
            return TickOutcome::Idle;
        };
        self.stats.frames += 1;
        let frame_span = tracing::debug_span!(
            "frame",
            frame = self.stats.frames,
            timestamp = frame.timestamp_ms
        );
        let _frame_guard = frame_span.enter();

        let adjudication = self.adjudicator.adjudicate(&frame, &self.roi);
        let verdict = adjudication.verdict;
        let mut image = adjudication.image;
        self.counters.record_verdict(&verdict);
        metrics::counter!("monitor_verdicts_total", "status" => verdict.status.as_str()).increment(1);

        let armed = self.armed.is_armed();
        let gate = self
            .gate
            .evaluate(&verdict, &image, armed, Instant::now(), &self.notifier);
        match &gate {
            GateOutcome::Escalated { .. } => {
                self.counters.record_alert();
                metrics::counter!("monitor_alerts_dispatched_total").increment(1);
            }
            GateOutcome::Cooldown { .. } => {
                metrics::counter!("monitor_alerts_suppressed_total", "reason" => "cooldown").increment(1);
            }
            GateOutcome::Disarmed => {
                metrics::counter!("monitor_alerts_suppressed_total", "reason" => "disarmed").increment(1);
            }
            GateOutcome::Safe => {}
        }

        if self.publish_frames {
            annotation::draw_status_overlay(&mut image, armed, Local::now());
            match encode_jpeg(&image, self.jpeg_quality) {
                Ok(jpeg) => {
                    let packet = FramePacket {
                        jpeg,
                        verdict: VerdictSummary::new(self.stats.frames, frame.timestamp_ms, &verdict),
                    };
                    if let Ok(mut guard) = self.latest.lock() {
                        *guard = Some(packet);
                    }
                }
                Err(err) => warn!("failed to encode preview frame: {err}"),
            }
        }

        TickOutcome::Processed {
            status: verdict.status,
            gate,
        }
    }

    fn record_source_stats(&mut self) {
        let stats = self.source.stats();
        let previous = self.last_source_stats;
        metrics::counter!("monitor_frames_captured_total")
            .increment(stats.acquired.saturating_sub(previous.acquired));
        metrics::counter!("monitor_frames_superseded_total")
            .increment(stats.superseded.saturating_sub(previous.superseded));
        metrics::counter!("monitor_capture_errors_total")
            .increment(stats.failures.saturating_sub(previous.failures));
        self.last_source_stats = stats;
    }

    /// Release the camera, then stop the notifier, then the preview server.
    pub(crate) fn shutdown(mut self) {
        info!("stopping monitor");
        self.record_source_stats();
        self.source.release();
        self.notifier.stop();
        if let Some(server) = self.preview.take() {
            server.stop();
        }
        let counters = self.counters.snapshot();
        info!(
            detections = counters.total_detections,
            intruders = counters.intruder_count,
            alerts = counters.alerts_sent,
            "monitor stopped"
        );
    }
}
