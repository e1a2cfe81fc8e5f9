// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : quote_pricer — asynchronous quotation line price coordinator
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Converts quantity slots between units and kilograms, enforces the
          minimum order weight, debounces and cancels remote tariff calls,
          keeps manually typed prices, exposes Prometheus metrics and
          records JSONL session events.
=============================================================================
*/
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use std::time::Duration;

use crate::domain::LineKind;

/// Backend used for tariff calculations
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TariffMode {
    Mock,
    Http,
}

impl TariffMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TariffMode::Mock => "mock",
            TariffMode::Http => "http",
        }
    }
}

fn parse_line_kind(s: &str) -> Result<LineKind, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "quotation" | "quote" | "q" => Ok(LineKind::Quotation),
        "order" | "o" => Ok(LineKind::Order),
        other => Err(format!("unknown line kind: {other}")),
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "quote_pricer", version, about = "Quotation line price coordinator")]
struct Cli {
    #[arg(long, env = "TARIFF_MODE", value_enum, default_value = "mock")]
    tariff_mode: TariffMode,
    #[arg(long, env = "TARIFF_URL", default_value = "http://127.0.0.1:8080/api/tariff")]
    tariff_url: String,
    #[arg(long, env = "TARIFF_TIMEOUT_MS", default_value_t = 10_000)]
    tariff_timeout_ms: u64,

    #[arg(long, env = "MOCK_LATENCY_MS", default_value_t = 150)]
    mock_latency_ms: u64,
    #[arg(long, env = "MOCK_FAIL_RATE", default_value_t = 0.0)]
    mock_fail_rate: f64,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9899)]
    metrics_port: u16,
    #[arg(long, env = "RECORD_FILE")]
    record_file: Option<String>,
    #[arg(long, env = "SCRIPT_FILE")]
    script_file: Option<String>,
    #[arg(long, env = "LINE_KIND", value_parser = parse_line_kind, default_value = "quotation")]
    line_kind: LineKind,
}

#[derive(Clone, Debug)]
pub struct Args {
    // files/metrics
    pub record_file: Option<String>,
    pub script_file: Option<String>,
    pub metrics_port: u16,

    pub line_kind: LineKind,
}

#[derive(Clone, Debug)]
pub struct TariffCfg {
    pub mode: TariffMode,
    pub url: String,
    /// Transport timeout, HTTP backend only.
    pub timeout: Duration,
    pub mock_latency: Duration,
    /// Probability in [0, 1] that the mock rejects a call.
    pub mock_fail_rate: f64,
}

pub fn load() -> (Args, TariffCfg) {
    // .env first so clap sees its values through `env = ...`
    let _ = dotenv();
    split(Cli::parse())
}

fn split(cli: Cli) -> (Args, TariffCfg) {
    let args = Args {
        record_file: cli.record_file,
        script_file: cli.script_file,
        metrics_port: cli.metrics_port,
        line_kind: cli.line_kind,
    };

    let mock_fail_rate = if cli.mock_fail_rate.is_finite() {
        cli.mock_fail_rate.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let tariff = TariffCfg {
        mode: cli.tariff_mode,
        url: cli.tariff_url,
        timeout: Duration::from_millis(cli.tariff_timeout_ms),
        mock_latency: Duration::from_millis(cli.mock_latency_ms),
        mock_fail_rate,
    };
    (args, tariff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_map_into_config() {
        let cli = Cli::try_parse_from([
            "quote_pricer",
            "--tariff-mode",
            "http",
            "--tariff-url",
            "http://pricing.local",
            "--mock-fail-rate",
            "3.5",
            "--line-kind",
            "order",
        ])
        .unwrap();
        let (args, tariff) = split(cli);
        assert_eq!(tariff.mode, TariffMode::Http);
        assert_eq!(tariff.url, "http://pricing.local");
        assert_eq!(tariff.mock_fail_rate, 1.0);
        assert_eq!(args.line_kind, LineKind::Order);
        assert_eq!(args.line_kind.slot_count(), 1);
    }

    #[test]
    fn unknown_line_kind_is_rejected() {
        assert!(parse_line_kind("invoice").is_err());
        assert_eq!(parse_line_kind(" Quotation "), Ok(LineKind::Quotation));
    }
}
