//! Beat quantizer: the public scheduling contract and its dispatch loop.
//!
//! Lock discipline: `pending` and `time_base` are separate mutexes, each held
//! only for the duration of a read or mutation. The only nesting is
//! `pending` → `time_base` inside the dispatch pass and re-insertion, so the
//! two can never deadlock. No lock is held while a callback runs, which lets
//! callbacks call back into [`Quantizer::schedule`] or even
//! [`Quantizer::stop`].

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::{
    scheduler::{BeatAction, Callback, EventAction, EventId, FireOutcome, PendingSet},
    timeline::{validate_request, TimeBase},
    Clock, DispatchMode, PlaybackSource, QuantizerConfig, QuantizerError, Result, SystemClock,
};

/// Narrow scheduling capability handed to game-rule components so they never
/// need the whole quantizer.
pub trait BeatScheduler: Send + Sync {
    fn schedule_once(
        &self,
        beat_division: u32,
        extra_delay: f64,
        callback: Callback,
    ) -> Result<EventId>;

    fn schedule_repeating(&self, action: BeatAction) -> Result<EventId>;

    fn cancel(&self, id: EventId) -> Result<bool>;
}

/// Aligns callbacks to the beat grid of the playing track.
///
/// Cloning is cheap and every clone drives the same time base and pending
/// set. Dropping the last clone shuts the dispatch thread down.
#[derive(Clone)]
pub struct Quantizer {
    shared: Arc<Shared>,
}

struct Shared {
    config: QuantizerConfig,
    clock: Arc<dyn Clock>,
    time_base: Mutex<TimeBase>,
    pending: Mutex<PendingSet>,
    /// Bumped by every stop. Work started under an older generation is void.
    generation: AtomicU64,
    dispatcher: Mutex<Option<Dispatcher>>,
}

struct Dispatcher {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Quantizer {
    /// Creates a stopped quantizer that falls back to the wall clock.
    pub fn new(config: QuantizerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Creates a stopped quantizer reading host time from `clock`.
    pub fn with_clock(config: QuantizerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let time_base = TimeBase::new(config.tempo_bpm)?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                clock,
                time_base: Mutex::new(time_base),
                pending: Mutex::new(PendingSet::new()),
                generation: AtomicU64::new(0),
                dispatcher: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &QuantizerConfig {
        &self.shared.config
    }

    /// Starts the time base at the current host time.
    ///
    /// With a `source`, musical time follows the track position whenever the
    /// track reports one. Starting while already playing rebinds the
    /// reference point and keeps pending events.
    pub fn start(&self, source: Option<Arc<dyn PlaybackSource>>) -> Result<()> {
        let now = self.shared.clock.now();
        let with_source = source.is_some();
        let (rebind, tempo) = {
            let mut time_base = self.shared.lock_time_base()?;
            let rebind = time_base.is_playing();
            time_base.start(now, source);
            (rebind, time_base.tempo())
        };

        if self.shared.config.dispatch == DispatchMode::Thread {
            self.ensure_dispatcher()?;
        }

        tracing::info!(tempo, with_source, rebind, "quantizer started");
        Ok(())
    }

    /// Stops the time base, drops every pending event and ends the dispatch
    /// loop. Events already collected by an in-flight pass do not fire.
    pub fn stop(&self) -> Result<()> {
        self.shared.lock_time_base()?.stop();
        let dropped = {
            let mut pending = self.shared.lock_pending()?;
            self.shared.generation.fetch_add(1, Ordering::AcqRel);
            pending.clear()
        };
        self.stop_dispatcher()?;

        tracing::info!(dropped, "quantizer stopped");
        Ok(())
    }

    /// Changes the tempo for registrations made from now on. Pending events
    /// keep the time they were quantized to.
    pub fn set_tempo(&self, tempo_bpm: f64) -> Result<()> {
        if let Err(err) = self.shared.lock_time_base()?.set_tempo(tempo_bpm) {
            tracing::warn!(tempo_bpm, %err, "rejected tempo change");
            return Err(err);
        }
        tracing::info!(tempo_bpm, "tempo changed");
        Ok(())
    }

    /// Registers `callback` to run on the next `beat_division` grid line,
    /// plus `extra_delay` seconds.
    ///
    /// Registrations while stopped are rejected with
    /// [`QuantizerError::NotPlaying`]; the callback is dropped unrun.
    pub fn schedule<F>(
        &self,
        beat_division: u32,
        extra_delay: f64,
        callback: F,
    ) -> Result<EventId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(beat_division, extra_delay, EventAction::Once(Box::new(callback)))
    }

    /// Registers an action that fires on every grid line of its division
    /// until cancelled or the quantizer stops.
    pub fn schedule_repeating(&self, action: BeatAction) -> Result<EventId> {
        let (division, delay) = (action.beat_division(), action.extra_delay());
        self.register(division, delay, EventAction::Repeating(action))
    }

    /// Removes a pending event or repeating action. Returns whether it was
    /// still pending.
    pub fn cancel(&self, id: EventId) -> Result<bool> {
        let removed = self.shared.lock_pending()?.remove(id);
        tracing::debug!(event = %id, removed, "cancel requested");
        Ok(removed)
    }

    /// Runs one dispatch pass and returns how many callbacks were invoked.
    ///
    /// Hosts using [`DispatchMode::Manual`] call this once per frame. It is
    /// also safe to call alongside the dispatch thread.
    pub fn tick(&self) -> Result<usize> {
        self.shared.dispatch()
    }

    pub fn current_music_time(&self) -> Result<Option<f64>> {
        self.shared.music_time()
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.shared.lock_pending()?.len())
    }

    pub fn is_playing(&self) -> Result<bool> {
        Ok(self.shared.lock_time_base()?.is_playing())
    }

    pub fn current_tempo(&self) -> Result<f64> {
        Ok(self.shared.lock_time_base()?.tempo())
    }

    /// Earliest musical time at which a pending event fires.
    pub fn next_due_time(&self) -> Result<Option<f64>> {
        Ok(self.shared.lock_pending()?.next_due())
    }

    fn register(
        &self,
        beat_division: u32,
        extra_delay: f64,
        action: EventAction,
    ) -> Result<EventId> {
        let result = self.try_register(beat_division, extra_delay, action);
        if let Err(err) = &result {
            tracing::warn!(beat_division, extra_delay, %err, "rejected quantize request");
        }
        result
    }

    fn try_register(
        &self,
        beat_division: u32,
        extra_delay: f64,
        action: EventAction,
    ) -> Result<EventId> {
        validate_request(beat_division, extra_delay)?;

        let generation = self.shared.generation.load(Ordering::Acquire);
        let (now, scheduled_time) = {
            let time_base = self.shared.lock_time_base()?;
            let now = time_base
                .music_time(self.shared.clock.now())
                .ok_or(QuantizerError::NotPlaying)?;
            (now, time_base.schedule_at(now, beat_division, extra_delay)?)
        };

        let mut pending = self.shared.lock_pending()?;
        // A stop that slipped in after the time base was read voids this
        // registration.
        if self.shared.generation.load(Ordering::Acquire) != generation {
            return Err(QuantizerError::NotPlaying);
        }
        let id = pending.insert(scheduled_time, beat_division, extra_delay, action);
        drop(pending);

        tracing::debug!(event = %id, now, scheduled_time, beat_division, "event scheduled");
        Ok(id)
    }

    fn ensure_dispatcher(&self) -> Result<()> {
        let mut slot = self.shared.lock_dispatcher()?;
        if slot
            .as_ref()
            .is_some_and(|dispatcher| !dispatcher.handle.is_finished())
        {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded(1);
        let shared = Arc::downgrade(&self.shared);
        let interval = self.shared.config.tick_interval();
        let handle = thread::Builder::new()
            .name("beat-quantizer-dispatch".into())
            .spawn(move || run_dispatch_loop(shared, stop_rx, interval))?;

        *slot = Some(Dispatcher { stop_tx, handle });
        Ok(())
    }

    fn stop_dispatcher(&self) -> Result<()> {
        let Some(dispatcher) = self.shared.lock_dispatcher()?.take() else {
            return Ok(());
        };
        let _ = dispatcher.stop_tx.try_send(());

        // Stop may be called from a callback running on the dispatch thread
        // itself; that thread exits on its own once the pass returns.
        if dispatcher.handle.thread().id() != thread::current().id()
            && dispatcher.handle.join().is_err()
        {
            tracing::error!("dispatch thread panicked");
        }
        Ok(())
    }
}

impl BeatScheduler for Quantizer {
    fn schedule_once(
        &self,
        beat_division: u32,
        extra_delay: f64,
        callback: Callback,
    ) -> Result<EventId> {
        self.register(beat_division, extra_delay, EventAction::Once(callback))
    }

    fn schedule_repeating(&self, action: BeatAction) -> Result<EventId> {
        Quantizer::schedule_repeating(self, action)
    }

    fn cancel(&self, id: EventId) -> Result<bool> {
        Quantizer::cancel(self, id)
    }
}

impl std::fmt::Debug for Quantizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Quantizer")
            .field("config", &self.shared.config)
            .field("generation", &self.shared.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn music_time(&self) -> Result<Option<f64>> {
        Ok(self.lock_time_base()?.music_time(self.clock.now()))
    }

    fn dispatch(&self) -> Result<usize> {
        let (generation, due) = {
            let mut pending = self.lock_pending()?;
            let generation = self.generation.load(Ordering::Acquire);
            let Some(now) = self.music_time()? else {
                return Ok(0);
            };
            (generation, pending.drain_due(now))
        };
        if due.is_empty() {
            return Ok(0);
        }

        let mut fired = 0;
        for event in due {
            if self.generation.load(Ordering::Acquire) != generation {
                tracing::debug!("quantizer stopped mid-pass; dropping remaining due events");
                break;
            }

            let fired_at = event.scheduled_time();
            match event.fire() {
                FireOutcome::Done => {}
                FireOutcome::Repeat(id, action) => {
                    self.reinsert(generation, id, fired_at, action)?;
                }
                FireOutcome::Panicked(id, message) => {
                    tracing::error!(
                        event = %id,
                        panic = %message,
                        "callback panicked during dispatch"
                    );
                }
            }
            fired += 1;
        }

        tracing::debug!(fired, "dispatch pass complete");
        Ok(fired)
    }

    fn reinsert(
        &self,
        generation: u64,
        id: EventId,
        fired_at: f64,
        action: BeatAction,
    ) -> Result<()> {
        let mut pending = self.lock_pending()?;
        if self.generation.load(Ordering::Acquire) != generation {
            return Ok(());
        }

        let scheduled_time = {
            let time_base = self.lock_time_base()?;
            let Some(now) = time_base.music_time(self.clock.now()) else {
                return Ok(());
            };
            time_base.schedule_repeat(
                now,
                fired_at - action.extra_delay(),
                action.beat_division(),
                action.extra_delay(),
            )
        };
        pending.reinsert(id, scheduled_time, action);
        Ok(())
    }

    fn lock_time_base(&self) -> Result<MutexGuard<'_, TimeBase>> {
        self.time_base
            .lock()
            .map_err(|_| QuantizerError::Poisoned("time base"))
    }

    fn lock_pending(&self) -> Result<MutexGuard<'_, PendingSet>> {
        self.pending
            .lock()
            .map_err(|_| QuantizerError::Poisoned("pending event set"))
    }

    fn lock_dispatcher(&self) -> Result<MutexGuard<'_, Option<Dispatcher>>> {
        self.dispatcher
            .lock()
            .map_err(|_| QuantizerError::Poisoned("dispatcher slot"))
    }
}

/// Body of the dispatch thread: one pass per tick interval until stopped or
/// until the quantizer is dropped.
fn run_dispatch_loop(shared: Weak<Shared>, stop_rx: Receiver<()>, interval: Duration) {
    tracing::debug!(?interval, "dispatch loop running");
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let Some(shared) = shared.upgrade() else {
            break;
        };
        if let Err(err) = shared.dispatch() {
            tracing::error!(%err, "dispatch pass failed");
        }
    }
    tracing::debug!("dispatch loop exited");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        time::Instant,
    };

    use super::*;
    use crate::{ManualClock, ManualTrack};

    fn manual(tempo_bpm: f64) -> (Quantizer, ManualClock) {
        let clock = ManualClock::new(0.0);
        let quantizer = Quantizer::with_clock(
            QuantizerConfig::manual().with_tempo(tempo_bpm),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (quantizer, clock)
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn bump(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn count(counter: &Arc<AtomicUsize>) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn sixteenth_note_registration_waits_for_next_grid_line() {
        let (quantizer, clock) = manual(120.0);
        let fired = counter();
        quantizer.start(None).unwrap();

        clock.set(0.30);
        quantizer.schedule(16, 0.0, bump(&fired)).unwrap();
        assert!(approx(quantizer.next_due_time().unwrap().unwrap(), 0.375));

        clock.set(0.37);
        assert_eq!(quantizer.tick().unwrap(), 0);
        assert_eq!(count(&fired), 0);

        clock.set(0.375);
        assert_eq!(quantizer.tick().unwrap(), 1);
        assert_eq!(count(&fired), 1);
        assert_eq!(quantizer.pending_count().unwrap(), 0);
    }

    #[test]
    fn registration_on_a_grid_line_fires_at_that_line() {
        let (quantizer, clock) = manual(60.0);
        let fired = counter();
        quantizer.start(None).unwrap();

        clock.set(2.0);
        quantizer.schedule(4, 0.0, bump(&fired)).unwrap();
        assert!(approx(quantizer.next_due_time().unwrap().unwrap(), 2.0));

        assert_eq!(quantizer.tick().unwrap(), 1);
        assert_eq!(count(&fired), 1);
    }

    #[test]
    fn simultaneous_events_fire_in_one_pass() {
        let (quantizer, clock) = manual(120.0);
        let fired = counter();
        quantizer.start(None).unwrap();

        clock.set(0.30);
        quantizer.schedule(16, 0.0, bump(&fired)).unwrap();
        quantizer.schedule(16, 0.0, bump(&fired)).unwrap();
        assert_eq!(quantizer.pending_count().unwrap(), 2);

        clock.set(0.4);
        assert_eq!(quantizer.tick().unwrap(), 2);
        assert_eq!(count(&fired), 2);
        assert_eq!(quantizer.pending_count().unwrap(), 0);
    }

    #[test]
    fn tempo_change_does_not_move_pending_events() {
        let (quantizer, clock) = manual(120.0);
        quantizer.start(None).unwrap();

        clock.set(0.30);
        quantizer.schedule(16, 0.0, || {}).unwrap();
        quantizer.set_tempo(60.0).unwrap();

        assert_eq!(quantizer.current_tempo().unwrap(), 60.0);
        assert!(approx(quantizer.next_due_time().unwrap().unwrap(), 0.375));
    }

    #[test]
    fn stop_discards_pending_events() {
        let (quantizer, clock) = manual(120.0);
        let fired = counter();
        quantizer.start(None).unwrap();

        clock.set(0.1);
        for division in [4, 8, 16] {
            quantizer.schedule(division, 0.0, bump(&fired)).unwrap();
        }
        assert_eq!(quantizer.pending_count().unwrap(), 3);

        quantizer.stop().unwrap();
        assert_eq!(quantizer.pending_count().unwrap(), 0);
        assert!(!quantizer.is_playing().unwrap());

        quantizer.start(None).unwrap();
        assert!(quantizer.is_playing().unwrap());
        assert_eq!(quantizer.pending_count().unwrap(), 0);

        clock.advance(10.0);
        assert_eq!(quantizer.tick().unwrap(), 0);
        assert_eq!(count(&fired), 0);
    }

    #[test]
    fn extra_delay_lands_after_the_boundary() {
        let (quantizer, clock) = manual(120.0);
        let fired = counter();
        quantizer.start(None).unwrap();

        clock.set(0.30);
        quantizer.schedule(16, 0.05, bump(&fired)).unwrap();
        assert!(approx(quantizer.next_due_time().unwrap().unwrap(), 0.425));

        clock.set(0.4);
        quantizer.tick().unwrap();
        assert_eq!(count(&fired), 0);

        clock.set(0.425);
        quantizer.tick().unwrap();
        assert_eq!(count(&fired), 1);
    }

    #[test]
    fn music_time_is_measured_from_start() {
        let (quantizer, clock) = manual(120.0);
        clock.set(5.0);
        assert_eq!(quantizer.current_music_time().unwrap(), None);

        quantizer.start(None).unwrap();
        clock.set(5.3);
        assert!(approx(quantizer.current_music_time().unwrap().unwrap(), 0.3));

        quantizer.schedule(16, 0.0, || {}).unwrap();
        assert!(approx(quantizer.next_due_time().unwrap().unwrap(), 0.375));
    }

    #[test]
    fn rejects_registration_while_stopped() {
        let (quantizer, _clock) = manual(120.0);
        let fired = counter();

        let err = quantizer.schedule(16, 0.0, bump(&fired)).unwrap_err();
        assert!(matches!(err, QuantizerError::NotPlaying));
        assert_eq!(count(&fired), 0);
        assert_eq!(quantizer.pending_count().unwrap(), 0);
    }

    #[test]
    fn rejects_invalid_parameters_without_side_effects() {
        let (quantizer, _clock) = manual(120.0);
        quantizer.start(None).unwrap();

        assert!(matches!(
            quantizer.schedule(0, 0.0, || {}),
            Err(QuantizerError::InvalidBeatDivision(0))
        ));
        assert!(matches!(
            quantizer.schedule(4, -1.0, || {}),
            Err(QuantizerError::InvalidDelay(_))
        ));
        assert!(matches!(
            quantizer.set_tempo(0.0),
            Err(QuantizerError::InvalidTempo(_))
        ));
        assert!(matches!(
            quantizer.set_tempo(-120.0),
            Err(QuantizerError::InvalidTempo(_))
        ));

        assert_eq!(quantizer.pending_count().unwrap(), 0);
        assert_eq!(quantizer.current_tempo().unwrap(), 120.0);
    }

    #[test]
    fn rejects_invalid_initial_tempo() {
        let config = QuantizerConfig::manual().with_tempo(0.0);
        assert!(matches!(
            Quantizer::new(config),
            Err(QuantizerError::InvalidTempo(_))
        ));
    }

    #[test]
    fn queries_are_stable_without_mutation() {
        let (quantizer, clock) = manual(120.0);
        quantizer.start(None).unwrap();
        clock.set(0.2);
        quantizer.schedule(4, 0.0, || {}).unwrap();

        for _ in 0..3 {
            assert_eq!(quantizer.pending_count().unwrap(), 1);
            assert!(quantizer.is_playing().unwrap());
            assert_eq!(quantizer.current_tempo().unwrap(), 120.0);
        }
    }

    #[test]
    fn callbacks_can_reschedule_themselves() {
        fn rearm(quantizer: Quantizer, fired: Arc<AtomicUsize>) {
            let next = quantizer.clone();
            quantizer
                .schedule(8, 0.0, move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                    rearm(next, fired);
                })
                .unwrap();
        }

        let (quantizer, clock) = manual(120.0);
        let fired = counter();
        quantizer.start(None).unwrap();
        clock.set(0.1);
        rearm(quantizer.clone(), Arc::clone(&fired));

        for step in 1..=4 {
            clock.set(0.25 * f64::from(step) + 0.01);
            assert_eq!(quantizer.tick().unwrap(), 1);
            assert_eq!(quantizer.pending_count().unwrap(), 1);
        }
        assert_eq!(count(&fired), 4);

        quantizer.stop().unwrap();
    }

    #[test]
    fn repeating_action_fires_once_per_grid_line() {
        let (quantizer, clock) = manual(120.0);
        let fired = counter();
        let seen = Arc::clone(&fired);
        quantizer.start(None).unwrap();

        let id = quantizer
            .schedule_repeating(BeatAction::new(8, move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert_eq!(quantizer.tick().unwrap(), 1);
        assert!(approx(quantizer.next_due_time().unwrap().unwrap(), 0.25));
        // Same instant again: the line that just fired is not reused.
        assert_eq!(quantizer.tick().unwrap(), 0);

        clock.set(0.25);
        assert_eq!(quantizer.tick().unwrap(), 1);
        clock.set(0.6);
        assert_eq!(quantizer.tick().unwrap(), 1);
        assert!(approx(quantizer.next_due_time().unwrap().unwrap(), 0.75));
        assert_eq!(count(&fired), 3);

        assert!(quantizer.cancel(id).unwrap());
        clock.set(1.0);
        assert_eq!(quantizer.tick().unwrap(), 0);
        assert_eq!(count(&fired), 3);
    }

    #[test]
    fn repeating_action_fires_each_line_once_when_ticked_on_the_line() {
        for (tempo, division) in [(120.0, 6), (120.0, 12), (120.0, 3), (150.0, 5)] {
            let (quantizer, clock) = manual(tempo);
            let fired = counter();
            let seen = Arc::clone(&fired);
            quantizer.start(None).unwrap();
            quantizer
                .schedule_repeating(BeatAction::new(division, move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();

            let mut lines = Vec::new();
            for _ in 0..24 {
                let due = quantizer.next_due_time().unwrap().unwrap();
                if let Some(&last) = lines.last() {
                    assert!(due > last, "grid line {due} fired twice at {tempo} bpm / {division}");
                }
                lines.push(due);
                clock.set(due);
                assert_eq!(quantizer.tick().unwrap(), 1);
                assert_eq!(quantizer.tick().unwrap(), 0);
            }
            assert_eq!(count(&fired), 24);
        }
    }

    #[test]
    fn repeating_action_with_delay_keeps_advancing() {
        let (quantizer, clock) = manual(120.0);
        quantizer.start(None).unwrap();
        quantizer
            .schedule_repeating(BeatAction::new(6, || {}).with_delay(0.07))
            .unwrap();

        let mut last = f64::NEG_INFINITY;
        for _ in 0..16 {
            let due = quantizer.next_due_time().unwrap().unwrap();
            assert!(due > last);
            last = due;
            clock.set(due);
            assert_eq!(quantizer.tick().unwrap(), 1);
        }
    }

    #[test]
    fn repeating_action_picks_up_new_tempo_on_rearm() {
        let (quantizer, clock) = manual(120.0);
        quantizer.start(None).unwrap();
        quantizer
            .schedule_repeating(BeatAction::new(4, || {}).with_delay(0.1))
            .unwrap();
        assert!(approx(quantizer.next_due_time().unwrap().unwrap(), 0.1));

        quantizer.set_tempo(60.0).unwrap();
        clock.set(0.1);
        assert_eq!(quantizer.tick().unwrap(), 1);
        assert!(approx(quantizer.next_due_time().unwrap().unwrap(), 1.1));
    }

    #[test]
    fn panicking_callback_does_not_block_the_pass() {
        let (quantizer, clock) = manual(120.0);
        let fired = counter();
        quantizer.start(None).unwrap();

        quantizer.schedule(4, 0.0, bump(&fired)).unwrap();
        quantizer.schedule(4, 0.0, || panic!("spawner exploded")).unwrap();
        quantizer.schedule(4, 0.0, bump(&fired)).unwrap();

        assert_eq!(quantizer.tick().unwrap(), 3);
        assert_eq!(count(&fired), 2);
        assert_eq!(quantizer.pending_count().unwrap(), 0);

        clock.set(0.2);
        quantizer.schedule(4, 0.0, bump(&fired)).unwrap();
        clock.set(0.5);
        assert_eq!(quantizer.tick().unwrap(), 1);
        assert_eq!(count(&fired), 3);
    }

    #[test]
    fn stop_inside_a_callback_drops_the_rest_of_the_pass() {
        let (quantizer, _clock) = manual(120.0);
        let fired = counter();
        quantizer.start(None).unwrap();

        for _ in 0..3 {
            let handle = quantizer.clone();
            let fired = Arc::clone(&fired);
            quantizer
                .schedule(4, 0.0, move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                    handle.stop().unwrap();
                })
                .unwrap();
        }

        assert_eq!(quantizer.tick().unwrap(), 1);
        assert_eq!(count(&fired), 1);
        assert!(!quantizer.is_playing().unwrap());
        assert_eq!(quantizer.pending_count().unwrap(), 0);
    }

    #[test]
    fn follows_playing_track_position() {
        let (quantizer, clock) = manual(120.0);
        let track = ManualTrack::new();
        track.seek(10.0);
        track.play();
        quantizer.start(Some(Arc::new(track.clone()))).unwrap();

        clock.set(50.0);
        assert_eq!(quantizer.current_music_time().unwrap(), Some(10.0));

        track.seek(10.3);
        let fired = counter();
        quantizer.schedule(16, 0.0, bump(&fired)).unwrap();
        assert!(approx(quantizer.next_due_time().unwrap().unwrap(), 10.375));

        track.seek(10.375);
        assert_eq!(quantizer.tick().unwrap(), 1);
        assert_eq!(count(&fired), 1);
    }

    #[test]
    fn restart_while_playing_keeps_pending_events() {
        let (quantizer, clock) = manual(120.0);
        quantizer.start(None).unwrap();
        clock.set(0.3);
        quantizer.schedule(4, 0.0, || {}).unwrap();

        quantizer.start(None).unwrap();
        assert_eq!(quantizer.pending_count().unwrap(), 1);
        assert_eq!(quantizer.current_music_time().unwrap(), Some(0.0));
    }

    #[test]
    fn collaborators_schedule_through_the_capability_trait() {
        let (quantizer, clock) = manual(120.0);
        let fired = counter();
        quantizer.start(None).unwrap();

        let scheduler: Arc<dyn BeatScheduler> = Arc::new(quantizer.clone());
        scheduler
            .schedule_once(4, 0.0, Box::new(bump(&fired)))
            .unwrap();
        let id = scheduler
            .schedule_repeating(BeatAction::new(2, || {}))
            .unwrap();
        assert_eq!(quantizer.pending_count().unwrap(), 2);

        clock.set(0.01);
        assert_eq!(quantizer.tick().unwrap(), 2);
        assert_eq!(count(&fired), 1);
        assert!(scheduler.cancel(id).unwrap());
        assert_eq!(quantizer.pending_count().unwrap(), 0);
    }

    #[test]
    fn dispatch_thread_fires_due_events() {
        let clock = ManualClock::new(0.0);
        let quantizer =
            Quantizer::with_clock(QuantizerConfig::default(), Arc::new(clock.clone())).unwrap();
        let fired = counter();
        quantizer.start(None).unwrap();

        clock.set(0.3);
        quantizer.schedule(4, 0.0, bump(&fired)).unwrap();
        clock.set(0.5);

        let deadline = Instant::now() + Duration::from_secs(5);
        while count(&fired) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(count(&fired), 1);
        assert_eq!(quantizer.pending_count().unwrap(), 0);

        quantizer.stop().unwrap();
        assert!(!quantizer.is_playing().unwrap());
        assert!(quantizer.shared.lock_dispatcher().unwrap().is_none());
    }

    #[test]
    fn stop_interrupts_a_long_dispatch_wait() {
        let config = QuantizerConfig {
            tick_interval_ms: 10_000,
            ..QuantizerConfig::default()
        };
        let quantizer = Quantizer::with_clock(config, Arc::new(ManualClock::new(0.0))).unwrap();
        quantizer.start(None).unwrap();
        thread::sleep(Duration::from_millis(20));

        let begun = Instant::now();
        quantizer.stop().unwrap();
        assert!(
            begun.elapsed() < Duration::from_millis(500),
            "stop waited {:?} for the dispatch thread",
            begun.elapsed()
        );
        assert!(quantizer.shared.lock_dispatcher().unwrap().is_none());
    }

    #[test]
    fn concurrent_registrations_are_all_dispatched() {
        let clock = ManualClock::new(0.0);
        let quantizer =
            Quantizer::with_clock(QuantizerConfig::default(), Arc::new(clock.clone())).unwrap();
        let fired = counter();
        quantizer.start(None).unwrap();
        clock.set(0.1);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let quantizer = quantizer.clone();
                let fired = Arc::clone(&fired);
                thread::spawn(move || {
                    for _ in 0..25 {
                        quantizer.schedule(16, 0.0, bump(&fired)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        clock.set(1.0);
        let deadline = Instant::now() + Duration::from_secs(5);
        while count(&fired) < 100 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(count(&fired), 100);
        quantizer.stop().unwrap();
    }
}
