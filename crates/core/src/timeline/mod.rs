use std::{fmt, sync::Arc};

use crate::{PlaybackSource, QuantizerError, Result};

/// Beats in one measure. Beat divisions are counted against this.
pub const BEATS_PER_MEASURE: f64 = 4.0;

/// Length in seconds of one grid step when a 4-beat measure is cut into
/// `beat_division` equal parts.
pub fn quantize_unit(tempo_bpm: f64, beat_division: u32) -> f64 {
    let beat_duration = 60.0 / tempo_bpm;
    beat_duration * BEATS_PER_MEASURE / f64::from(beat_division)
}

/// Tolerance, in grid steps, under which a time counts as sitting on a line.
const GRID_EPSILON: f64 = 1e-9;

/// Position of `time` on the grid in whole steps, snapped to the nearest
/// line when rounding error left it a hair off one.
fn snapped_steps(time: f64, unit: f64) -> Option<f64> {
    let steps = time / unit;
    let nearest = steps.round();
    ((steps - nearest).abs() < GRID_EPSILON).then_some(nearest)
}

/// First grid line at or after `now`. A time sitting exactly on a line maps
/// to that line.
pub fn next_boundary(now: f64, unit: f64) -> f64 {
    let steps = snapped_steps(now, unit).unwrap_or_else(|| (now / unit).ceil());
    (steps * unit).max(now)
}

/// First grid line strictly after `now`.
pub fn next_boundary_after(now: f64, unit: f64) -> f64 {
    let steps = snapped_steps(now, unit).unwrap_or_else(|| (now / unit).floor());
    let mut next = (steps + 1.0) * unit;
    while next <= now {
        next += unit;
    }
    next
}

/// Absolute musical time at which a request made at `now` fires.
pub fn scheduled_time(now: f64, tempo_bpm: f64, beat_division: u32, extra_delay: f64) -> f64 {
    next_boundary(now, quantize_unit(tempo_bpm, beat_division)) + extra_delay
}

pub fn validate_tempo(tempo_bpm: f64) -> Result<()> {
    if tempo_bpm.is_finite() && tempo_bpm > 0.0 {
        Ok(())
    } else {
        Err(QuantizerError::InvalidTempo(tempo_bpm))
    }
}

pub fn validate_request(beat_division: u32, extra_delay: f64) -> Result<()> {
    if beat_division == 0 {
        return Err(QuantizerError::InvalidBeatDivision(beat_division));
    }
    if !(extra_delay.is_finite() && extra_delay >= 0.0) {
        return Err(QuantizerError::InvalidDelay(extra_delay));
    }
    Ok(())
}

/// Musical time base: tempo plus the reference point playback started at.
///
/// `reference_start` is a host clock reading and is only set while playing,
/// so a playing time base always has a valid reference and a positive tempo.
#[derive(Clone)]
pub struct TimeBase {
    tempo_bpm: f64,
    reference_start: Option<f64>,
    source: Option<Arc<dyn PlaybackSource>>,
}

impl TimeBase {
    pub fn new(tempo_bpm: f64) -> Result<Self> {
        validate_tempo(tempo_bpm)?;
        Ok(Self {
            tempo_bpm,
            reference_start: None,
            source: None,
        })
    }

    pub fn tempo(&self) -> f64 {
        self.tempo_bpm
    }

    pub fn is_playing(&self) -> bool {
        self.reference_start.is_some()
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Binds the reference point to `now` and replaces the playback source.
    pub fn start(&mut self, now: f64, source: Option<Arc<dyn PlaybackSource>>) {
        self.reference_start = Some(now);
        self.source = source;
    }

    pub fn stop(&mut self) {
        self.reference_start = None;
        self.source = None;
    }

    pub fn set_tempo(&mut self, tempo_bpm: f64) -> Result<()> {
        validate_tempo(tempo_bpm)?;
        self.tempo_bpm = tempo_bpm;
        Ok(())
    }

    /// Elapsed musical seconds. The track position wins while the track is
    /// audibly playing; otherwise the host clock is measured against the
    /// reference point.
    pub fn music_time(&self, clock_now: f64) -> Option<f64> {
        let start = self.reference_start?;
        let from_track = self.source.as_ref().and_then(|source| source.position());
        Some(from_track.unwrap_or_else(|| (clock_now - start).max(0.0)))
    }

    /// Quantizes a request against the current tempo.
    pub fn schedule_at(&self, now: f64, beat_division: u32, extra_delay: f64) -> Result<f64> {
        validate_request(beat_division, extra_delay)?;
        Ok(scheduled_time(now, self.tempo_bpm, beat_division, extra_delay))
    }

    /// Next firing time for a repeating action whose last firing was on the
    /// grid line `fired_boundary`. The result is a line strictly after that
    /// one and never in the past.
    pub fn schedule_repeat(
        &self,
        now: f64,
        fired_boundary: f64,
        beat_division: u32,
        extra_delay: f64,
    ) -> f64 {
        let unit = quantize_unit(self.tempo_bpm, beat_division);
        next_boundary_after(fired_boundary.max(now - extra_delay), unit) + extra_delay
    }
}

impl fmt::Debug for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeBase")
            .field("tempo_bpm", &self.tempo_bpm)
            .field("reference_start", &self.reference_start)
            .field("has_source", &self.has_source())
            .finish()
    }
}
