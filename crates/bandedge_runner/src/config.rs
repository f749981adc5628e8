use std::fs;
use std::path::{Path, PathBuf};

use core_types::EngineError;
use execution::ExecutionMode;
use gate_chain::GateConfig;
use risk_engine::RiskLimits;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Resolved runtime configuration. Everything here comes from the
/// environment (the enumerated variables below) or a validated default, and
/// is snapshotted to `<run_dir>/config.json` before the loop starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub mode: String,
    pub execution_enabled: bool,
    pub max_trades_per_run: u32,
    pub notional_per_trade: f64,
    pub edge_base: f64,
    pub edge_mid: f64,
    pub edge_high: f64,
    pub ask_cap: f64,
    pub spread_max: f64,
    pub core_lo_sec: u32,
    pub core_hi_sec: u32,
    pub pnl_floor: f64,
    pub cooldown_sec: u64,
    pub regime_mod_enabled: bool,
    pub max_consec_losses: u32,
    pub log_dir: PathBuf,
    pub run_id: String,
    pub book_staleness_ms: i64,
    pub tick_interval_ms: u64,
    pub share_granularity: f64,
    pub venue_min_notional: f64,
    pub paper_max_slip_ticks: u32,
    pub settle_grace_attempts: u32,
    pub settle_poll_interval_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: "paper".to_string(),
            execution_enabled: false,
            max_trades_per_run: 1,
            notional_per_trade: 5.0,
            edge_base: 0.64,
            edge_mid: 0.67,
            edge_high: 0.70,
            ask_cap: 0.68,
            spread_max: 0.02,
            core_lo_sec: 150,
            core_hi_sec: 225,
            pnl_floor: -50.0,
            cooldown_sec: 30,
            regime_mod_enabled: false,
            max_consec_losses: 999,
            log_dir: PathBuf::from("runs"),
            run_id: String::new(),
            book_staleness_ms: 1_000,
            tick_interval_ms: 250,
            share_granularity: 0.0001,
            venue_min_notional: 1.0,
            paper_max_slip_ticks: 0,
            settle_grace_attempts: 10,
            settle_poll_interval_ms: 500,
        }
    }
}

impl RunConfig {
    /// Reads the enumerated environment variables, failing fast on anything
    /// malformed or out of range. No network I/O happens before this passes.
    pub fn from_env() -> Result<Self, EngineError> {
        let mut cfg = Self::default();

        if let Some(raw) = env_trimmed("MODE") {
            let norm = raw.to_ascii_lowercase();
            if norm != "paper" && norm != "real" {
                return Err(config_err(format!(
                    "MODE must be `paper` or `real`, got `{raw}`"
                )));
            }
            cfg.mode = norm;
        }
        cfg.execution_enabled = env_bool("EXECUTION_ENABLED", cfg.execution_enabled)?;
        cfg.max_trades_per_run = env_u32("MAX_TRADES_PER_RUN", cfg.max_trades_per_run)?;
        cfg.notional_per_trade = env_f64("NOTIONAL_PER_TRADE", cfg.notional_per_trade)?;
        cfg.edge_base = env_f64("EDGE_BASE", cfg.edge_base)?;
        cfg.edge_mid = env_f64("EDGE_MID", cfg.edge_mid)?;
        cfg.edge_high = env_f64("EDGE_HIGH", cfg.edge_high)?;
        cfg.ask_cap = env_f64("ASK_CAP", cfg.ask_cap)?;
        cfg.spread_max = env_f64("SPREAD_MAX", cfg.spread_max)?;
        cfg.core_lo_sec = env_u32("CORE_LO", cfg.core_lo_sec)?;
        cfg.core_hi_sec = env_u32("CORE_HI", cfg.core_hi_sec)?;
        cfg.pnl_floor = env_f64("PNL_FLOOR", cfg.pnl_floor)?;
        cfg.cooldown_sec = env_u64("COOLDOWN_SEC", cfg.cooldown_sec)?;
        cfg.regime_mod_enabled = env_bool("REGIME_MOD_ENABLED", cfg.regime_mod_enabled)?;
        cfg.max_consec_losses = env_u32("MAX_CONSEC_LOSSES", cfg.max_consec_losses)?;
        if let Some(raw) = env_trimmed("LOG_DIR") {
            cfg.log_dir = PathBuf::from(raw);
        }
        cfg.run_id = match env_trimmed("RUN_ID") {
            Some(raw) => raw,
            None => core_types::new_id(),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.notional_per_trade <= 0.0 {
            return Err(config_err("NOTIONAL_PER_TRADE must be positive"));
        }
        if self.max_trades_per_run == 0 {
            return Err(config_err("MAX_TRADES_PER_RUN must be at least 1"));
        }
        for (name, v) in [
            ("EDGE_BASE", self.edge_base),
            ("EDGE_MID", self.edge_mid),
            ("EDGE_HIGH", self.edge_high),
            ("ASK_CAP", self.ask_cap),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(config_err(format!("{name} must be within [0, 1], got {v}")));
            }
        }
        if self.spread_max < 0.0 {
            return Err(config_err("SPREAD_MAX must be non-negative"));
        }
        if self.core_lo_sec >= self.core_hi_sec {
            return Err(config_err(format!(
                "CORE_LO ({}) must be below CORE_HI ({})",
                self.core_lo_sec, self.core_hi_sec
            )));
        }
        if self.core_hi_sec > 300 {
            return Err(config_err(format!(
                "CORE_HI ({}) must not exceed the 300 s dead-zone boundary",
                self.core_hi_sec
            )));
        }
        if self.run_id.is_empty() || self.run_id.contains(['/', '\\']) {
            return Err(config_err("RUN_ID must be a non-empty path-safe token"));
        }
        if self.share_granularity <= 0.0 {
            return Err(config_err("share granularity must be positive"));
        }
        Ok(())
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        if self.mode == "real" {
            ExecutionMode::Live
        } else {
            ExecutionMode::Paper
        }
    }

    /// Live orders require both switches: MODE=real and the independent
    /// EXECUTION_ENABLED safety lock.
    pub fn live_orders_armed(&self) -> bool {
        self.mode == "real" && self.execution_enabled
    }

    pub fn run_dir(&self) -> PathBuf {
        self.log_dir.join(&self.run_id)
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            edge_base: self.edge_base,
            edge_mid: self.edge_mid,
            edge_high: self.edge_high,
            ask_cap: self.ask_cap,
            spread_max: self.spread_max,
            regime_mod_enabled: self.regime_mod_enabled,
            ..GateConfig::default()
        }
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_trades_per_run: self.max_trades_per_run,
            pnl_floor: self.pnl_floor,
            max_consec_losses: self.max_consec_losses,
            cooldown_sec: self.cooldown_sec,
            ..RiskLimits::default()
        }
    }

    pub fn to_canonical_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self).map_err(|e| config_err(e.to_string()))
    }

    pub fn sha256(&self) -> Result<String, EngineError> {
        let raw = self.to_canonical_json()?;
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Deterministic paper-fill seed derived from the run id.
    pub fn paper_seed(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.run_id.as_bytes());
        let digest = hasher.finalize();
        u64::from_le_bytes(digest[..8].try_into().expect("sha256 is 32 bytes"))
    }

    pub fn persist_snapshot(&self, run_dir: &Path) -> Result<(), EngineError> {
        fs::create_dir_all(run_dir)?;
        fs::write(run_dir.join("config.json"), self.to_canonical_json()?)?;
        Ok(())
    }
}

fn config_err(msg: impl Into<String>) -> EngineError {
    EngineError::Config(msg.into())
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_f64(name: &str, default: f64) -> Result<f64, EngineError> {
    let Some(raw) = env_trimmed(name) else {
        return Ok(default);
    };
    raw.parse::<f64>()
        .map_err(|_| config_err(format!("{name} must be a number, got `{raw}`")))
}

fn env_u32(name: &str, default: u32) -> Result<u32, EngineError> {
    let Some(raw) = env_trimmed(name) else {
        return Ok(default);
    };
    raw.parse::<u32>()
        .map_err(|_| config_err(format!("{name} must be an integer, got `{raw}`")))
}

fn env_u64(name: &str, default: u64) -> Result<u64, EngineError> {
    let Some(raw) = env_trimmed(name) else {
        return Ok(default);
    };
    raw.parse::<u64>()
        .map_err(|_| config_err(format!("{name} must be an integer, got `{raw}`")))
}

fn env_bool(name: &str, default: bool) -> Result<bool, EngineError> {
    let Some(raw) = env_trimmed(name) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(config_err(format!(
            "{name} must be true or false, got `{raw}`"
        ))),
    }
}
