use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{QuantizerError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub quantizer: QuantizerConfig,
    pub session: SessionConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing fields fall back to their
    /// defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.quantizer.validate()?;
        self.session.validate()
    }
}

/// How the dispatch pass gets driven once the time base is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// A dedicated thread runs a pass every tick interval.
    #[default]
    Thread,
    /// The host calls [`crate::Quantizer::tick`] from its own frame loop.
    Manual,
}

/// Configuration specific to the quantizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizerConfig {
    pub tempo_bpm: f64,
    pub tick_interval_ms: u64,
    pub dispatch: DispatchMode,
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        Self {
            tempo_bpm: 120.0,
            tick_interval_ms: 1,
            dispatch: DispatchMode::Thread,
        }
    }
}

impl QuantizerConfig {
    /// Defaults for hosts that drive [`crate::Quantizer::tick`] themselves.
    pub fn manual() -> Self {
        Self {
            dispatch: DispatchMode::Manual,
            ..Self::default()
        }
    }

    pub fn with_tempo(mut self, tempo_bpm: f64) -> Self {
        self.tempo_bpm = tempo_bpm;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tempo_bpm.is_finite() && self.tempo_bpm > 0.0) {
            return Err(QuantizerError::InvalidTempo(self.tempo_bpm));
        }
        Ok(())
    }
}

/// Parameters of the beat-driven game session run by the command line driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Grid used for player moves, in steps per measure.
    pub player_move_division: u32,
    /// Grid used for enemy spawn triggers, in steps per measure.
    pub enemy_spawn_division: u32,
    /// Number of spawn triggers between two spawned rows.
    pub spawn_every: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            player_move_division: 4,
            enemy_spawn_division: 8,
            spawn_every: 10,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        for division in [self.player_move_division, self.enemy_spawn_division] {
            if division == 0 {
                return Err(QuantizerError::InvalidBeatDivision(division));
            }
        }
        if self.spawn_every == 0 {
            return Err(QuantizerError::config("spawn_every must be at least 1"));
        }
        Ok(())
    }
}
