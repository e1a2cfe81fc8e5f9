// ===============================
// src/script.rs
// ===============================
//
// Scripted edit sessions. Each JSONL line is a step:
//   {"after_ms": 120, "action": {"op": "quantity", "slot": 0, "raw": "2650"}}
// Blank lines and lines starting with '#' are ignored. Without a script
// file, `demo_script()` walks through a typical quotation.
//
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{sleep, Duration},
};
use tracing::{info, warn};

use crate::coordinator::{SessionCommand, SessionView};
use crate::domain::{DisplayMode, ProductConfig};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptAction {
    SelectProduct { product: ProductConfig },
    Quantity { slot: usize, raw: String },
    Mode { mode: DisplayMode },
    InkCount { id: u32 },
    Faces { id: u32 },
    ConversionFactor { factor: Option<Decimal> },
    ManualPrice { slot: usize, text: String },
    RestoreAutomatic { slot: usize },
    AddLine,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptStep {
    #[serde(default)]
    pub after_ms: u64,
    pub action: ScriptAction,
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("cannot read script {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("script line {line}: {msg}")]
    Parse { line: usize, msg: String },
}

pub fn parse(text: &str) -> Result<Vec<ScriptStep>, ScriptError> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .map(|(i, l)| {
            serde_json::from_str(l).map_err(|e| ScriptError::Parse {
                line: i + 1,
                msg: e.to_string(),
            })
        })
        .collect()
}

pub async fn load(path: &str) -> Result<Vec<ScriptStep>, ScriptError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ScriptError::Io { path: path.to_string(), source })?;
    parse(&text)
}

fn step(after_ms: u64, action: ScriptAction) -> ScriptStep {
    ScriptStep { after_ms, action }
}

fn qty(slot: usize, raw: &str) -> ScriptAction {
    ScriptAction::Quantity { slot, raw: raw.to_string() }
}

pub fn demo_script() -> Vec<ScriptStep> {
    let product = ProductConfig {
        conversion_factor: Some(Decimal::new(88_652, 3)),
        ink_count_id: 2,
        faces_id: 1,
    };
    vec![
        step(0, ScriptAction::SelectProduct { product }),
        // typed one keystroke at a time
        step(0, qty(0, "2")),
        step(90, qty(0, "26")),
        step(110, qty(0, "265")),
        step(80, qty(0, "2650")),
        step(900, ScriptAction::AddLine),
        step(50, qty(0, "2660")),
        step(100, qty(1, "10000")),
        step(100, qty(2, "50000")),
        step(300, ScriptAction::ManualPrice { slot: 1, text: "0.0900".into() }),
        step(100, qty(1, "12000")),
        step(900, ScriptAction::RestoreAutomatic { slot: 1 }),
        step(900, ScriptAction::AddLine),
        step(0, ScriptAction::SelectProduct {
            product: ProductConfig {
                conversion_factor: Some(Decimal::new(125, 1)),
                ink_count_id: 1,
                faces_id: 2,
            },
        }),
        step(0, ScriptAction::Mode { mode: DisplayMode::Weight }),
        step(50, qty(0, "45")),
        step(900, ScriptAction::AddLine),
    ]
}

fn log_view(v: &SessionView) {
    for s in v.slots.iter().filter(|s| s.unit_count > 0 || s.overridden) {
        info!(
            slot = s.slot,
            units = s.unit_count,
            kg = %s.weight_kg,
            price = %s.price_text,
            state = ?s.state,
            overridden = s.overridden,
            "slot"
        );
    }
    if let Some(e) = &v.batch_error {
        warn!(error = %e, "batch error");
    }
}

/// Replay `steps` against a running session. Returns the number of lines
/// the session accepted.
pub async fn replay(
    steps: Vec<ScriptStep>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    view_rx: watch::Receiver<SessionView>,
) -> usize {
    let mut added = 0;
    for s in steps {
        if s.after_ms > 0 {
            sleep(Duration::from_millis(s.after_ms)).await;
        }
        let cmd = match s.action {
            ScriptAction::AddLine => {
                log_view(&view_rx.borrow());
                let (tx, rx) = oneshot::channel();
                if cmd_tx.send(SessionCommand::AddLine { respond_to: tx }).await.is_err() {
                    break;
                }
                match rx.await {
                    Ok(Ok(line)) => {
                        added += 1;
                        info!(options = line.options.len(), mode = ?line.mode, "line accepted");
                    }
                    Ok(Err(e)) => warn!(error = %e, "line blocked"),
                    Err(_) => break,
                }
                continue;
            }
            ScriptAction::SelectProduct { product } => SessionCommand::SelectProduct(product),
            ScriptAction::Quantity { slot, raw } => SessionCommand::SetQuantity { slot, raw },
            ScriptAction::Mode { mode } => SessionCommand::SetMode(mode),
            ScriptAction::InkCount { id } => SessionCommand::SetInkCount(id),
            ScriptAction::Faces { id } => SessionCommand::SetFaces(id),
            ScriptAction::ConversionFactor { factor } => {
                SessionCommand::SetConversionFactor(factor)
            }
            ScriptAction::ManualPrice { slot, text } => {
                SessionCommand::SetManualPrice { slot, text }
            }
            ScriptAction::RestoreAutomatic { slot } => SessionCommand::RestoreAutomatic { slot },
            ScriptAction::Reset => SessionCommand::Reset,
        };
        if cmd_tx.send(cmd).await.is_err() {
            warn!("session stopped before script finished");
            break;
        }
    }
    added
}
