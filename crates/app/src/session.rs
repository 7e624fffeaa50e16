use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use beat_quantizer_core::{
    BeatAction, BeatScheduler, DispatchMode, EventId, Quantizer, SessionConfig,
};

/// Counters updated by the beat-driven collaborators.
#[derive(Debug, Default)]
pub struct SessionStats {
    player_moves: AtomicU64,
    spawn_triggers: AtomicU64,
    rows_spawned: AtomicU64,
}

impl SessionStats {
    pub fn player_moves(&self) -> u64 {
        self.player_moves.load(Ordering::Relaxed)
    }

    pub fn spawn_triggers(&self) -> u64 {
        self.spawn_triggers.load(Ordering::Relaxed)
    }

    pub fn rows_spawned(&self) -> u64 {
        self.rows_spawned.load(Ordering::Relaxed)
    }
}

/// Game session wiring: the player advances on one grid, the enemy spawner
/// counts triggers on another and spawns a row every `spawn_every` triggers.
#[derive(Debug)]
pub struct GameSession {
    stats: Arc<SessionStats>,
    actions: Vec<EventId>,
}

impl GameSession {
    pub fn begin(
        scheduler: &dyn BeatScheduler,
        config: &SessionConfig,
    ) -> beat_quantizer_core::Result<Self> {
        config.validate()?;
        let stats = Arc::new(SessionStats::default());

        let player = Arc::clone(&stats);
        let player_move = BeatAction::new(config.player_move_division, move || {
            let position = player.player_moves.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(position, "player moved");
        });

        let spawner = Arc::clone(&stats);
        let spawn_every = u64::from(config.spawn_every);
        let enemy_spawn = BeatAction::new(config.enemy_spawn_division, move || {
            let trigger = spawner.spawn_triggers.fetch_add(1, Ordering::Relaxed) + 1;
            if trigger % spawn_every == 0 {
                let rows = spawner.rows_spawned.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(trigger, rows, "enemy row spawned");
            }
        });

        let mut actions = Vec::with_capacity(2);
        for action in [enemy_spawn, player_move] {
            match scheduler.schedule_repeating(action) {
                Ok(id) => actions.push(id),
                Err(err) => {
                    for id in actions {
                        if let Err(cancel_err) = scheduler.cancel(id) {
                            tracing::warn!(event = %id, %cancel_err, "failed to cancel action");
                        }
                    }
                    return Err(err);
                }
            }
        }

        Ok(Self { stats, actions })
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Cancels the session's repeating actions without stopping the quantizer.
    pub fn end(self, scheduler: &dyn BeatScheduler) -> beat_quantizer_core::Result<()> {
        for id in self.actions {
            scheduler.cancel(id)?;
        }
        Ok(())
    }
}

/// Keeps the quantizer playing for `duration`. With manual dispatch this is
/// the host frame loop, ticking once per configured interval.
pub fn play_for(quantizer: &Quantizer, duration: Duration) -> beat_quantizer_core::Result<()> {
    match quantizer.config().dispatch {
        DispatchMode::Thread => thread::sleep(duration),
        DispatchMode::Manual => {
            let interval = quantizer.config().tick_interval();
            let deadline = Instant::now() + duration;
            quantizer.tick()?;
            while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                if remaining.is_zero() {
                    break;
                }
                thread::sleep(remaining.min(interval));
                quantizer.tick()?;
            }
        }
    }
    Ok(())
}
