//! Time sources the quantizer reads musical time from.
//!
//! Two kinds of source exist. A [`Clock`] is the host's own monotonic clock
//! and is always available. A [`PlaybackSource`] reports the position of a
//! playing track and is preferred whenever it has a reading, because it stays
//! locked to the audio device instead of drifting with the wall clock.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

/// Monotonic host clock measured in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Live playback position of a track, in seconds from its start.
pub trait PlaybackSource: Send + Sync {
    /// Returns `None` while the track is not audibly playing.
    fn position(&self) -> Option<f64>;
}

/// Wall clock backed by [`Instant`], counting from its creation.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Lock-free `f64` cell shared between clones.
#[derive(Clone, Default)]
struct SharedSeconds(Arc<AtomicU64>);

impl SharedSeconds {
    fn new(seconds: f64) -> Self {
        Self(Arc::new(AtomicU64::new(seconds.to_bits())))
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn set(&self, seconds: f64) {
        self.0.store(seconds.to_bits(), Ordering::Release);
    }
}

/// Host clock that only moves when told to. Clones share the same reading.
#[derive(Clone, Default)]
pub struct ManualClock {
    seconds: SharedSeconds,
}

impl ManualClock {
    pub fn new(seconds: f64) -> Self {
        Self {
            seconds: SharedSeconds::new(seconds),
        }
    }

    pub fn set(&self, seconds: f64) {
        self.seconds.set(seconds);
    }

    pub fn advance(&self, delta: f64) {
        self.seconds.set((self.seconds.get() + delta).max(0.0));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.seconds.get()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("seconds", &self.seconds.get())
            .finish()
    }
}

/// Track stand-in whose position is set by hand. Starts paused at zero.
#[derive(Clone)]
pub struct ManualTrack {
    position: SharedSeconds,
    playing: Arc<AtomicBool>,
}

impl ManualTrack {
    pub fn new() -> Self {
        Self {
            position: SharedSeconds::new(0.0),
            playing: Arc::default(),
        }
    }

    pub fn play(&self) {
        self.playing.store(true, Ordering::Release);
    }

    pub fn pause(&self) {
        self.playing.store(false, Ordering::Release);
    }

    pub fn seek(&self, seconds: f64) {
        self.position.set(seconds.max(0.0));
    }

    pub fn advance(&self, delta: f64) {
        self.seek(self.position.get() + delta);
    }
}

impl Default for ManualTrack {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackSource for ManualTrack {
    fn position(&self) -> Option<f64> {
        self.playing
            .load(Ordering::Acquire)
            .then(|| self.position.get())
    }
}

impl fmt::Debug for ManualTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTrack")
            .field("position", &self.position())
            .finish()
    }
}
