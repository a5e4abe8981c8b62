//! Actix Web preview and local control server.
//!
//! Runs on a dedicated thread so the tick loop never touches the HTTP runtime.
//! Serves the latest annotated frame, an MJPEG stream, a JSON status snapshot,
//! Prometheus metrics and the local arm/disarm switch.

use std::{net::SocketAddr, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::monitor::{
    armed::ArmedState,
    counters::Counters,
    data::{FramePacket, SharedFrame, StatusResponse},
    notifier::ChannelStatus,
    telemetry::{prometheus_handle, spawn_thread},
};

/// Shared state backing HTTP handlers.
#[derive(Clone)]
pub(crate) struct ServerState {
    pub(crate) latest: SharedFrame,
    pub(crate) armed: ArmedState,
    pub(crate) counters: Counters,
    pub(crate) notifier: ChannelStatus,
}

/// Handle for the preview server thread.
#[derive(Default)]
pub(crate) struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PreviewServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the preview server thread and return a handle that can stop it.
pub(crate) fn spawn_preview_server(addr: SocketAddr, state: ServerState) -> Result<PreviewServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = spawn_thread("preview-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(state.clone()))
                    .configure(routes)
            })
            .workers(1)
            .bind(addr)?
            .run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            info!("preview available at http://{addr}/stream.mjpg");
            server.await
        }) {
            error!("preview server error: {err}");
        }
    })
    .context("Failed to spawn preview server thread")?;
    Ok(PreviewServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/frame.jpg", web::get().to(frame_handler))
        .route("/stream.mjpg", web::get().to(stream_handler))
        .route("/status", web::get().to(status_handler))
        .route("/arm", web::post().to(arm_handler))
        .route("/disarm", web::post().to(disarm_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

fn latest_frame(shared: &SharedFrame) -> Option<FramePacket> {
    match shared.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    }
}

/// Return the latest annotated frame.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match latest_frame(&state.latest) {
        Some(packet) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .body(packet.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream the annotated feed as multipart MJPEG.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(33));
        let mut last_sent = None;
        loop {
            interval.tick().await;
            let Some(packet) = latest_frame(&state.latest) else {
                continue;
            };
            if last_sent == Some(packet.verdict.frame_number) {
                continue;
            }
            last_sent = Some(packet.verdict.frame_number);
            let mut payload = Vec::with_capacity(packet.jpeg.len() + 64);
            payload.extend_from_slice(b"--frame\r\n");
            payload.extend_from_slice(
                format!("X-Sequence: {}\r\n", packet.verdict.frame_number).as_bytes(),
            );
            payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
            payload.extend_from_slice(&packet.jpeg);
            payload.extend_from_slice(b"\r\n");
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

fn status_body(state: &ServerState) -> StatusResponse {
    StatusResponse {
        armed: state.armed.is_armed(),
        mode: state.armed.label(),
        notifier: state.notifier.current(),
        counters: state.counters.snapshot(),
        last_verdict: latest_frame(&state.latest).map(|packet| packet.verdict),
    }
}

/// Mode, notifier state, counters and the last verdict as JSON.
async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(status_body(&state))
}

async fn arm_handler(state: web::Data<ServerState>) -> HttpResponse {
    if !state.armed.arm() {
        info!("system armed locally");
    }
    HttpResponse::Ok().json(status_body(&state))
}

async fn disarm_handler(state: web::Data<ServerState>) -> HttpResponse {
    if state.armed.disarm() {
        info!("system disarmed locally");
    }
    HttpResponse::Ok().json(status_body(&state))
}

async fn metrics_handler() -> HttpResponse {
    match prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use actix_web::{http::StatusCode, test};
    use serde_json::Value;

    use super::*;
    use crate::monitor::{
        adjudicator::VerdictStatus,
        data::VerdictSummary,
        notifier::NotificationChannel,
    };

    fn state(armed: bool, channel: &NotificationChannel) -> ServerState {
        ServerState {
            latest: Arc::new(Mutex::new(None)),
            armed: ArmedState::new(armed),
            counters: Counters::default(),
            notifier: channel.status(),
        }
    }

    #[actix_web::test]
    async fn local_controls_toggle_armed_state() {
        let channel = NotificationChannel::disabled("test");
        let state = state(true, &channel);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::post().uri("/disarm").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["armed"], false);
        assert_eq!(body["mode"], "STANDBY");
        assert!(!state.armed.is_armed());

        let req = test::TestRequest::post().uri("/arm").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["armed"], true);
        assert_eq!(body["notifier"]["state"], "DISABLED");
    }

    #[actix_web::test]
    async fn frame_route_serves_latest_jpeg() {
        let channel = NotificationChannel::disabled("test");
        let state = state(true, &channel);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/frame.jpg").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        *state.latest.lock().unwrap() = Some(FramePacket {
            jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
            verdict: VerdictSummary {
                frame_number: 3,
                timestamp_ms: 0,
                status: VerdictStatus::Critical,
                subjects: 1,
                breaches: 1,
                identities: vec!["Unknown".into()],
            },
        });
        let req = test::TestRequest::get().uri("/frame.jpg").to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(body.as_ref(), &[0xFF, 0xD8, 0xFF, 0xD9]);

        let req = test::TestRequest::get().uri("/status").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["last_verdict"]["status"], "CRITICAL");
        assert_eq!(body["last_verdict"]["frame_number"], 3);
    }

    #[actix_web::test]
    async fn arm_requires_post() {
        let channel = NotificationChannel::disabled("test");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(false, &channel)))
                .configure(routes),
        )
        .await;
        let req = test::TestRequest::get().uri("/arm").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_client_error());
    }
}
