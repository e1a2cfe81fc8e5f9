// ===============================
// src/main.rs
// ===============================
/*
=============================================================================
Project : quote_pricer — asynchronous quotation line price coordinator
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Converts quantity slots between units and kilograms, enforces the
          minimum order weight, debounces and cancels remote tariff calls,
          keeps manually typed prices, exposes Prometheus metrics and
          records JSONL session events.
=============================================================================
*/
mod config;
mod convert;
mod coordinator;
mod domain;
mod metrics;
mod overrides;
mod recorder;
mod scheduler;
mod script;
mod tariff;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::coordinator::PricingSession;
use crate::domain::SessionEvent;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Load config ----
    let (args, tariff_cfg) = config::load();

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    info!(
        tariff_mode = tariff_cfg.mode.as_str(),
        tariff_url = %tariff_cfg.url,
        line_kind = ?args.line_kind,
        slots = args.line_kind.slot_count(),
        script = ?args.script_file,
        record = ?args.record_file,
        "startup config"
    );
    metrics::CONFIG_TARIFF_MODE
        .with_label_values(&[tariff_cfg.mode.as_str()])
        .set(1);

    // ---- Tariff backend ----
    let tariff = match tariff::build(&tariff_cfg) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "tariff backend init failed");
            return;
        }
    };

    // ---- Script ----
    let steps = match &args.script_file {
        Some(path) => match script::load(path).await {
            Ok(steps) => steps,
            Err(e) => {
                error!(error = %e, "script load failed");
                return;
            }
        },
        None => script::demo_script(),
    };

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<SessionEvent>(8192);
    let mut session = PricingSession::new(args.line_kind, tariff);
    let recorder = match args.record_file.clone() {
        Some(path) => {
            let note = format!("session start, kind={:?}", args.line_kind);
            let _ = rec_tx.try_send(SessionEvent::Note(note));
            session = session.with_events(rec_tx);
            Some(tokio::spawn(recorder::run(rec_rx, path)))
        }
        None => None,
    };

    // ---- Session ----
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (view_tx, view_rx) = watch::channel(session.view());
    let session_task = tokio::spawn(session.run(cmd_rx, view_tx));

    let added = script::replay(steps, cmd_tx, view_rx).await;

    // replay dropped the command sender; the session (and with it the
    // recorder sender) winds down on its own
    if let Err(e) = session_task.await {
        error!(?e, "session task failed");
    }
    if let Some(task) = recorder {
        let _ = task.await;
    }
    info!(lines_added = added, "script finished");
}
