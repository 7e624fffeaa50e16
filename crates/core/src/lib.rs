//! Core library for the beat quantizer.
//!
//! Game-rule code hands callbacks to a [`Quantizer`], which holds them until
//! the next line of a beat grid derived from the playing track's tempo and
//! then fires them from its dispatch loop. Each module owns one concern:
//! time sources, grid math, the pending-event store, and the quantizer that
//! ties them together.

pub mod clock;
pub mod config;
pub mod error;
pub mod quantizer;
pub mod scheduler;
pub mod timeline;

pub use clock::{Clock, ManualClock, ManualTrack, PlaybackSource, SystemClock};
pub use config::{AppConfig, DispatchMode, QuantizerConfig, SessionConfig};
pub use error::{QuantizerError, Result};
pub use quantizer::{BeatScheduler, Quantizer};
pub use scheduler::{BeatAction, Callback, EventId, ScheduledEvent};
pub use timeline::{quantize_unit, scheduled_time, TimeBase};
