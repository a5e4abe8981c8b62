//! Restricted-zone monitor: watches one camera, flags people reaching into
//! the zone and sends throttled alerts with photo evidence.
//!
//! The module is split into focused submodules:
//! - `config`: CLI/env configuration parsing.
//! - `pipeline`: The fixed-interval tick loop and startup/shutdown ordering.
//! - `adjudicator`: Per-frame breach classification with identity caching.
//! - `inference`: Pose inference on a worker thread with a per-frame deadline.
//! - `alert_gate`: Cooldown-gated escalation and evidence capture.
//! - `notifier`: Telegram delivery and remote commands on their own runtime.
//! - `server`: Actix Web preview and local arm/disarm endpoints.
//! - `telemetry`: Tracing subscribers, log file and Prometheus recorder.
//! - `roi`, `identity`, `annotation`, `evidence`: helpers for the above.
//! - `armed`, `counters`, `data`: state shared between threads.

/// Re-export settings so callers can configure runs without reaching into
/// submodules.
pub use config::{MonitorCliArgs, MonitorConfig};
/// Launch the monitor with a ready-made configuration.
pub use pipeline::run;

mod adjudicator;
mod alert_gate;
mod annotation;
mod armed;
mod backend;
mod config;
mod counters;
mod data;
mod evidence;
mod identity;
mod inference;
mod notifier;
mod pipeline;
mod roi;
mod server;
mod telemetry;
