mod dial;

use std::sync::mpsc;
use std::time::{Duration, Instant};
use log::{info, warn};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::config::{NumberKind, PhoneConfig};
use crate::mp3::{PlaybackSink, SoundIndex, MAX_VOLUME, MIN_VOLUME};
use crate::numbers::{MatchResult, NumberTable, MAX_NUMBER_LENGTH};
use crate::phone::PhoneInputSignal;
use crate::volume::VolumeStore;

pub use self::dial::DialAccumulator;

/// Ring delay applied when a full number matches nothing, which only happens
/// when the table has no catch-all row.
const FALLBACK_RING_DELAY: Duration = Duration::from_millis(400);

/// Number of digits collected for a volume update.
const VOLUME_DIGIT_COUNT: usize = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PhoneState {
    /// The handset is on the hook.
    Idle,
    /// The handset is off the hook and digits are being collected.
    Dialing,
    /// A number matched; the caller hears ringing until the simulated pickup.
    AwaitingAnswer,
    /// The other side has picked up and its message is playing.
    InCall,
    /// Hold music is playing, periodically interrupted by the busy announcement.
    OnHold,
    /// The volume admin number was called; the next digits set a new volume.
    AdminVolumeEntry,
    /// The call has finished; the connection-lost tone plays until hangup.
    LineDead,
}

/// Drives the simulated phone line from keypad and hook signals.
///
/// Everything runs on the tick thread; pending events are plain deadlines
/// checked against the tick time, so cancelling them is just clearing an
/// `Option` and is safe to repeat.
pub struct CallEngine<P, V> {
    config: PhoneConfig,
    table: NumberTable,
    sink: P,
    volume_store: V,
    rng: Xoshiro256PlusPlus,
    /// The current state of the engine.
    state: PhoneState,
    /// Time when the current state started.
    state_start: Instant,
    /// The currently queued digits dialed by the user.
    dial: DialAccumulator,
    /// Table index of the matched entry. `None` during the unknown-number
    /// fallback and the volume-updated confirmation.
    active_entry: Option<usize>,
    /// Current playback volume.
    volume: u8,
    /// Channel for receiving input signals from the host phone.
    input: Option<mpsc::Receiver<PhoneInputSignal>>,
    /// Time when the ringing tone starts, held back so the last digit's
    /// confirmation tone gets its minimum playback.
    ring_tone_at: Option<Instant>,
    /// Time of the simulated pickup.
    pickup_at: Option<Instant>,
    /// Time when the active message finishes playing.
    playback_end_at: Option<Instant>,
    /// Time of the next busy announcement while on hold.
    hold_interrupt_at: Option<Instant>,
    /// Time when the running busy announcement ends.
    hold_resume_at: Option<Instant>,
    /// Time when the volume-updated confirmation starts, held back so the
    /// last digit's confirmation tone gets its minimum playback.
    admin_confirm_at: Option<Instant>,
    /// Time when the volume instructions replay after an invalid entry.
    admin_reprompt_at: Option<Instant>,
    min_tone_time: Duration,
    digit_timeout: Duration,
    hold_interval: Duration,
    advert_length: Duration,
}

/// Clears `deadline` and returns `true` if it has passed.
fn take_due(deadline: &mut Option<Instant>, now: Instant) -> bool {
    match *deadline {
        Some(at) if now >= at => {
            *deadline = None;
            true
        }
        _ => false,
    }
}

impl<P: PlaybackSink, V: VolumeStore> CallEngine<P, V> {
    pub fn new(config: PhoneConfig, table: NumberTable, sink: P, volume_store: V) -> Self {
        let now = Instant::now();
        let timing = &config.timing;
        let min_tone_time = Duration::from_millis(timing.min_button_playback_duration_ms);
        let digit_timeout = Duration::from_millis(timing.digit_timeout_ms);
        let hold_interval = Duration::from_millis(timing.waiting_music_interrupt_time_ms);
        let advert_length = Duration::from_millis(timing.please_hold_msg_length_ms);
        let dial = DialAccumulator::new(Duration::from_millis(timing.button_debounce_time_ms));

        let mut engine = Self {
            rng: Xoshiro256PlusPlus::from_entropy(),
            state: PhoneState::Idle,
            state_start: now,
            dial,
            active_entry: None,
            volume: config.volume,
            input: None,
            ring_tone_at: None,
            pickup_at: None,
            playback_end_at: None,
            hold_interrupt_at: None,
            hold_resume_at: None,
            admin_confirm_at: None,
            admin_reprompt_at: None,
            min_tone_time,
            digit_timeout,
            hold_interval,
            advert_length,
            config,
            table,
            sink,
            volume_store,
        };

        let volume = engine.volume_store.load().unwrap_or(engine.config.volume);
        engine.apply_volume(volume);
        engine
    }

    /// Attaches the channel delivering signals from the host phone.
    pub fn listen(&mut self, input: mpsc::Receiver<PhoneInputSignal>) {
        self.input = Some(input);
    }

    /// Plays the loud tone that signals the system booted.
    pub fn announce_ready(&mut self) {
        let sound = self.config.sounds.ready;
        self.sink.play(sound);
    }

    #[inline]
    pub fn state(&self) -> PhoneState {
        self.state
    }

    #[inline]
    pub fn volume(&self) -> u8 {
        self.volume
    }

    /// Processes pending inputs and advances any elapsed deadlines.
    pub fn tick(&mut self) {
        let now = Instant::now();
        self.process_input_signals(now);
        self.update_state(now);
    }

    pub fn shutdown(&mut self) {
        self.sink.stop();
    }

    fn process_input_signals(&mut self, now: Instant) {
        loop {
            let signal = match self.input.as_ref().map(|rx| rx.try_recv()) {
                Some(Ok(signal)) => signal,
                _ => break,
            };
            self.handle_signal(signal, now);
        }
    }

    fn handle_signal(&mut self, signal: PhoneInputSignal, now: Instant) {
        match signal {
            PhoneInputSignal::HookState(true) => self.handle_on_hook(now),
            PhoneInputSignal::HookState(false) => self.handle_off_hook(now),
            PhoneInputSignal::Digit(digit) => self.handle_digit(digit, now),
        }
    }

    /// Hanging up is the one way to end a call early: playback stops, every
    /// pending deadline is cancelled and the line returns to idle.
    fn handle_on_hook(&mut self, now: Instant) {
        if self.state == PhoneState::Idle {
            return;
        }
        info!("Handset on hook; line cleared");
        self.sink.stop();
        self.cancel_deadlines();
        self.dial.reset();
        self.active_entry = None;
        self.set_state(PhoneState::Idle, now);
    }

    fn handle_off_hook(&mut self, now: Instant) {
        if self.state != PhoneState::Idle {
            return;
        }
        self.dial.reset();
        self.set_state(PhoneState::Dialing, now);
        let sound = self.config.sounds.dial_tone;
        self.sink.play(sound);
    }

    fn handle_digit(&mut self, digit: u8, now: Instant) {
        debug_assert!(digit <= 9);
        match self.state {
            PhoneState::Dialing => {
                if !self.dial.accept(digit, now) {
                    return;
                }
                self.play_dtmf(digit);
                info!("Dialed digit {} (have {})", digit, self.dial.len());
                self.evaluate_dial(now);
            }
            PhoneState::AdminVolumeEntry => {
                // A valid level was just entered; ignore extra digits while
                // its confirmation waits to play.
                if self.admin_confirm_at.is_some() {
                    return;
                }
                if !self.dial.accept(digit, now) {
                    return;
                }
                self.play_dtmf(digit);
                self.evaluate_volume_entry(now);
            }
            // Digits while ringing, in a call, or on the hook do nothing.
            _ => {}
        }
    }

    fn play_dtmf(&mut self, digit: u8) {
        let sound = self.config.sounds.dtmf_base + digit as SoundIndex;
        self.sink.play(sound);
    }

    fn evaluate_dial(&mut self, now: Instant) {
        let dialed_len = self.dial.len();
        let matched = match self.table.lookup(self.dial.digits()) {
            MatchResult::Matched(index, entry) => {
                info!("Number {} matched (row {})", entry, index);
                Some((index, entry.pre_ring_delay, entry.ring_jitter))
            }
            MatchResult::Partial => None,
            // A dead-end prefix shorter than the longest number may still be
            // the start of a misdial the caller will finish; keep collecting
            // and let the full-length check below resolve it.
            MatchResult::NoMatch => None,
        };
        if let Some((index, mean, jitter)) = matched {
            let delay = self.sample_ring_delay(mean, jitter);
            self.begin_ring(Some(index), delay, now);
        } else if dialed_len == MAX_NUMBER_LENGTH {
            warn!("No entry matches the full number; playing the unknown-number message");
            self.begin_ring(None, FALLBACK_RING_DELAY, now);
        }
    }

    /// Samples the ring time uniformly from `mean ± jitter`, clamped at zero.
    fn sample_ring_delay(&mut self, mean: Duration, jitter: Duration) -> Duration {
        let mean = mean.as_millis() as i64;
        let jitter = jitter.as_millis() as i64;
        if jitter == 0 {
            return Duration::from_millis(mean.max(0) as u64);
        }
        let sample = self.rng.gen_range(mean - jitter..=mean + jitter);
        Duration::from_millis(sample.max(0) as u64)
    }

    /// Earliest time a response may start without cutting the last digit's
    /// confirmation tone short.
    fn after_tone_minimum(&self, now: Instant) -> Instant {
        match self.dial.last_accept().map(|at| at + self.min_tone_time) {
            Some(tone_end) if tone_end > now => tone_end,
            _ => now,
        }
    }

    /// Starts the ringing phase. The ringing tone must not cut the last
    /// digit's confirmation tone short, so it starts no earlier than that
    /// tone's minimum playback end.
    fn begin_ring(&mut self, entry: Option<usize>, delay: Duration, now: Instant) {
        self.active_entry = entry;
        let ring_start = self.after_tone_minimum(now);
        self.ring_tone_at = Some(ring_start);
        self.pickup_at = Some(ring_start + delay);
        self.dial.reset();
        self.set_state(PhoneState::AwaitingAnswer, now);
    }

    /// The simulated pickup: the other side answers and its message starts.
    fn answer(&mut self, now: Instant) {
        match self.active_entry {
            Some(index) => {
                let entry = self.table.get(index);
                let sound = entry.sound;
                let duration = entry.playback_duration;
                let kind = entry.kind;
                self.sink.play(sound);
                if kind == NumberKind::VolumeAdmin {
                    self.dial.reset();
                    self.set_state(PhoneState::AdminVolumeEntry, now);
                } else {
                    self.playback_end_at = Some(now + duration);
                    self.set_state(PhoneState::InCall, now);
                }
            }
            None => {
                let sound = self.config.sounds.number_unknown;
                let length = Duration::from_millis(self.config.sounds.number_unknown_length_ms);
                self.sink.play(sound);
                self.playback_end_at = Some(now + length);
                self.set_state(PhoneState::InCall, now);
            }
        }
    }

    /// The active message has played out; either put the caller on hold or
    /// let the line go dead until they hang up.
    fn finish_call(&mut self, now: Instant) {
        let hold = self
            .active_entry
            .map(|index| self.table.get(index).hold_after_playback)
            .unwrap_or(false);
        self.active_entry = None;
        if hold {
            info!("Call finished; putting the caller on hold");
            let sound = self.config.sounds.hold_music;
            self.sink.play(sound);
            self.hold_interrupt_at = Some(now + self.hold_interval);
            self.set_state(PhoneState::OnHold, now);
        } else {
            let sound = self.config.sounds.connection_lost;
            self.sink.play(sound);
            self.set_state(PhoneState::LineDead, now);
        }
    }

    fn evaluate_volume_entry(&mut self, now: Instant) {
        if self.dial.len() < VOLUME_DIGIT_COUNT {
            return;
        }
        let digits = self.dial.digits();
        let level = digits[0] * 10 + digits[1];
        // The response must not cut the second digit's tone short, so both
        // the confirmation and the re-prompt wait for its minimum playback.
        let respond_at = self.after_tone_minimum(now);
        self.dial.reset();
        if (MIN_VOLUME..=MAX_VOLUME).contains(&level) {
            info!("Volume updated to {}", level);
            self.apply_volume(level);
            if let Err(err) = self.volume_store.save(level) {
                warn!("Failed to persist volume: {}", err);
            }
            self.admin_confirm_at = Some(respond_at);
        } else {
            info!("Rejected volume level {}; repeating the instructions", level);
            self.admin_reprompt_at = Some(respond_at);
        }
    }

    fn replay_admin_prompt(&mut self) {
        self.dial.reset();
        if let Some(index) = self.active_entry {
            let sound = self.table.get(index).sound;
            self.sink.play(sound);
        }
    }

    fn apply_volume(&mut self, level: u8) {
        let level = level.clamp(MIN_VOLUME, MAX_VOLUME);
        self.volume = level;
        self.sink.set_volume(level);
    }

    /// Checks every scheduled deadline against the tick time.
    fn update_state(&mut self, now: Instant) {
        match self.state {
            PhoneState::Dialing => {
                if self.dial_timed_out(now) {
                    info!("Dial timed out after {} digits; back to dial tone", self.dial.len());
                    self.dial.reset();
                    let sound = self.config.sounds.dial_tone;
                    self.sink.play(sound);
                }
            }
            PhoneState::AwaitingAnswer => {
                if take_due(&mut self.ring_tone_at, now) {
                    let sound = self.config.sounds.ringing;
                    self.sink.play(sound);
                }
                if take_due(&mut self.pickup_at, now) {
                    self.answer(now);
                }
            }
            PhoneState::InCall => {
                if take_due(&mut self.playback_end_at, now) {
                    self.finish_call(now);
                }
            }
            PhoneState::OnHold => {
                if take_due(&mut self.hold_resume_at, now) {
                    // The module resumes the hold music by itself once the
                    // advert ends; only the next interruption needs scheduling.
                    self.hold_interrupt_at = Some(now + self.hold_interval);
                }
                if take_due(&mut self.hold_interrupt_at, now) {
                    info!("Interrupting hold music with the busy announcement");
                    let sound = self.config.sounds.please_hold_advert;
                    self.sink.advert(sound);
                    self.hold_resume_at = Some(now + self.advert_length);
                }
            }
            PhoneState::AdminVolumeEntry => {
                if take_due(&mut self.admin_confirm_at, now) {
                    let sound = self.config.sounds.volume_updated;
                    let length =
                        Duration::from_millis(self.config.sounds.volume_updated_length_ms);
                    self.sink.play(sound);
                    self.active_entry = None;
                    self.playback_end_at = Some(now + length);
                    self.set_state(PhoneState::InCall, now);
                } else if take_due(&mut self.admin_reprompt_at, now) {
                    self.replay_admin_prompt();
                } else if self.dial_timed_out(now) {
                    info!("Volume entry timed out; repeating the instructions");
                    self.replay_admin_prompt();
                }
            }
            PhoneState::Idle | PhoneState::LineDead => {}
        }
    }

    fn dial_timed_out(&self, now: Instant) -> bool {
        match self.dial.last_accept() {
            Some(last) if !self.dial.is_empty() => {
                now.saturating_duration_since(last) >= self.digit_timeout
            }
            _ => false,
        }
    }

    /// Cancels every scheduled event. Safe to call with nothing pending.
    fn cancel_deadlines(&mut self) {
        self.ring_tone_at = None;
        self.pickup_at = None;
        self.playback_end_at = None;
        self.hold_interrupt_at = None;
        self.hold_resume_at = None;
        self.admin_confirm_at = None;
        self.admin_reprompt_at = None;
    }

    fn set_state(&mut self, state: PhoneState, now: Instant) {
        if self.state == state {
            return;
        }
        let prev_state = self.state;
        self.state = state;
        let state_time = now.saturating_duration_since(self.state_start);
        self.state_start = now;
        info!("{:?} ({:?}) --> {:?}", prev_state, state_time, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io;
    use std::path::PathBuf;
    use std::rc::Rc;
    use crate::config::{NumberConfig, SoundsConfig, TimingConfig};

    const DTMF_BASE: SoundIndex = 1;
    const SND_CONNECTION_LOST: SoundIndex = 11;
    const SND_RINGING: SoundIndex = 12;
    const SND_DIAL_TONE: SoundIndex = 13;
    const SND_UNKNOWN: SoundIndex = 15;
    const SND_HOLD_MUSIC: SoundIndex = 22;
    const SND_PLEASE_HOLD: SoundIndex = 1;
    const SND_VOLUME_UPDATED: SoundIndex = 25;
    const SND_ADMIN_PROMPT: SoundIndex = 24;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum SinkCmd {
        Play(SoundIndex),
        Advert(SoundIndex),
        Stop,
        Volume(u8),
    }

    #[derive(Clone, Default)]
    struct FakeSink(Rc<RefCell<Vec<SinkCmd>>>);

    impl FakeSink {
        fn commands(&self) -> Vec<SinkCmd> {
            self.0.borrow().clone()
        }

        fn clear(&self) {
            self.0.borrow_mut().clear();
        }

        fn count(&self, cmd: SinkCmd) -> usize {
            self.0.borrow().iter().filter(|&&c| c == cmd).count()
        }
    }

    impl PlaybackSink for FakeSink {
        fn play(&mut self, sound: SoundIndex) {
            self.0.borrow_mut().push(SinkCmd::Play(sound));
        }

        fn advert(&mut self, sound: SoundIndex) {
            self.0.borrow_mut().push(SinkCmd::Advert(sound));
        }

        fn stop(&mut self) {
            self.0.borrow_mut().push(SinkCmd::Stop);
        }

        fn set_volume(&mut self, level: u8) {
            self.0.borrow_mut().push(SinkCmd::Volume(level));
        }
    }

    #[derive(Clone, Default)]
    struct MemStore(Rc<RefCell<Option<u8>>>);

    impl VolumeStore for MemStore {
        fn load(&self) -> Option<u8> {
            *self.0.borrow()
        }

        fn save(&mut self, level: u8) -> io::Result<()> {
            *self.0.borrow_mut() = Some(level);
            Ok(())
        }
    }

    fn test_config() -> PhoneConfig {
        PhoneConfig {
            tick_rate: 60.0,
            volume: 15,
            volume_file: PathBuf::from("volume"),
            timing: TimingConfig {
                min_button_playback_duration_ms: 300,
                delay_after_mp3_send_ms: 0,
                button_debounce_time_ms: 10,
                digit_timeout_ms: 6000,
                waiting_music_interrupt_time_ms: 20000,
                please_hold_msg_length_ms: 2000,
            },
            sounds: SoundsConfig {
                dtmf_base: DTMF_BASE,
                connection_lost: SND_CONNECTION_LOST,
                ringing: SND_RINGING,
                dial_tone: SND_DIAL_TONE,
                ready: 14,
                number_unknown: SND_UNKNOWN,
                number_unknown_length_ms: 4000,
                hold_music: SND_HOLD_MUSIC,
                please_hold_advert: SND_PLEASE_HOLD,
                volume_updated: SND_VOLUME_UPDATED,
                volume_updated_length_ms: 1000,
            },
            gpio: None,
            numbers: vec![],
        }
    }

    fn row(digits: &str, sound: SoundIndex) -> NumberConfig {
        NumberConfig {
            digits: digits.to_string(),
            sound,
            playback_duration_ms: 5000,
            pre_ring_delay_ms: 700,
            ring_jitter_ms: 100,
            kind: NumberKind::Call,
            hold_after_playback: false,
        }
    }

    fn engine_with(rows: Vec<NumberConfig>) -> (CallEngine<FakeSink, MemStore>, FakeSink, MemStore) {
        let mut config = test_config();
        config.numbers = rows;
        let table = NumberTable::from_config(&config.numbers).unwrap();
        let sink = FakeSink::default();
        let store = MemStore::default();
        let engine = CallEngine::new(config, table, sink.clone(), store.clone());
        (engine, sink, store)
    }

    const STEP: Duration = Duration::from_millis(500);

    /// Dials digits half a second apart; returns the time after the last one.
    fn dial(engine: &mut CallEngine<FakeSink, MemStore>, digits: &[u8], mut t: Instant) -> Instant {
        for &d in digits {
            engine.handle_signal(PhoneInputSignal::Digit(d), t);
            t += STEP;
        }
        t
    }

    #[test]
    fn off_hook_plays_dial_tone() {
        let (mut engine, sink, _) = engine_with(vec![row("112", 17)]);
        let t0 = Instant::now();
        engine.handle_signal(PhoneInputSignal::HookState(false), t0);
        assert_eq!(engine.state(), PhoneState::Dialing);
        assert!(sink.commands().contains(&SinkCmd::Play(SND_DIAL_TONE)));
    }

    #[test]
    fn short_number_answers_with_its_own_message() {
        let (mut engine, sink, _) = engine_with(vec![row("112", 17), row("??????????", SND_UNKNOWN)]);
        let t0 = Instant::now();
        engine.handle_signal(PhoneInputSignal::HookState(false), t0);
        let t = dial(&mut engine, &[1, 1, 2], t0 + STEP);
        assert_eq!(engine.state(), PhoneState::AwaitingAnswer);
        // Mean 700ms + jitter 100ms + tone minimum is comfortably under 5s.
        engine.update_state(t + Duration::from_secs(5));
        assert_eq!(engine.state(), PhoneState::InCall);
        assert!(sink.commands().contains(&SinkCmd::Play(SND_RINGING)));
        assert!(sink.commands().contains(&SinkCmd::Play(17)));
        assert!(!sink.commands().contains(&SinkCmd::Play(SND_UNKNOWN)));
    }

    #[test]
    fn wildcard_row_answers_unmatched_positions() {
        let (mut engine, sink, _) = engine_with(vec![
            row("0711135642", 19),
            row("07111356?2", 20),
            row("??????????", SND_UNKNOWN),
        ]);
        let t0 = Instant::now();
        engine.handle_signal(PhoneInputSignal::HookState(false), t0);
        let t = dial(&mut engine, &[0, 7, 1, 1, 1, 3, 5, 6, 9, 2], t0 + STEP);
        engine.update_state(t + Duration::from_secs(5));
        assert!(sink.commands().contains(&SinkCmd::Play(20)));
        assert!(!sink.commands().contains(&SinkCmd::Play(19)));
    }

    #[test]
    fn unknown_full_number_reaches_catch_all() {
        let (mut engine, sink, _) = engine_with(vec![
            row("0711135642", 19),
            row("??????????", SND_UNKNOWN),
        ]);
        let t0 = Instant::now();
        engine.handle_signal(PhoneInputSignal::HookState(false), t0);
        let t = dial(&mut engine, &[9, 9, 9, 9, 9, 9, 9, 9, 9, 9], t0 + STEP);
        engine.update_state(t + Duration::from_secs(5));
        assert!(sink.commands().contains(&SinkCmd::Play(SND_UNKNOWN)));
    }

    #[test]
    fn full_number_without_catch_all_falls_back_to_unknown_message() {
        let (mut engine, sink, _) = engine_with(vec![row("1111111111", 19)]);
        let t0 = Instant::now();
        engine.handle_signal(PhoneInputSignal::HookState(false), t0);
        let t = dial(&mut engine, &[2, 2, 2, 2, 2, 2, 2, 2, 2, 2], t0 + STEP);
        assert_eq!(engine.state(), PhoneState::AwaitingAnswer);
        engine.update_state(t + Duration::from_secs(2));
        assert_eq!(engine.state(), PhoneState::InCall);
        assert!(sink.commands().contains(&SinkCmd::Play(SND_UNKNOWN)));
    }

    #[test]
    fn bounced_digit_plays_one_confirmation_tone() {
        let (mut engine, sink, _) = engine_with(vec![row("112", 17)]);
        let t0 = Instant::now();
        engine.handle_signal(PhoneInputSignal::HookState(false), t0);
        let t1 = t0 + STEP;
        engine.handle_signal(PhoneInputSignal::Digit(5), t1);
        engine.handle_signal(PhoneInputSignal::Digit(5), t1 + Duration::from_millis(5));
        assert_eq!(sink.count(SinkCmd::Play(DTMF_BASE + 5)), 1);
    }

    #[test]
    fn ringing_waits_for_the_last_tone_minimum() {
        let (mut engine, sink, _) = engine_with(vec![row("112", 17)]);
        let t0 = Instant::now();
        engine.handle_signal(PhoneInputSignal::HookState(false), t0);
        let t = dial(&mut engine, &[1, 1], t0 + STEP);
        engine.handle_signal(PhoneInputSignal::Digit(2), t);
        assert_eq!(engine.state(), PhoneState::AwaitingAnswer);
        // The last digit's tone gets its minimum playback before ringing.
        engine.update_state(t + Duration::from_millis(200));
        assert!(!sink.commands().contains(&SinkCmd::Play(SND_RINGING)));
        engine.update_state(t + Duration::from_millis(301));
        assert!(sink.commands().contains(&SinkCmd::Play(SND_RINGING)));
        // The pickup delay runs from the ring start; nobody answered yet.
        assert_eq!(engine.state(), PhoneState::AwaitingAnswer);
    }

    #[test]
    fn ring_delay_varies_and_stays_in_bounds() {
        let (mut engine, _, _) = engine_with(vec![row("112", 17)]);
        let mean = Duration::from_millis(5000);
        let jitter = Duration::from_millis(1000);
        let samples: Vec<u64> = (0..300)
            .map(|_| engine.sample_ring_delay(mean, jitter).as_millis() as u64)
            .collect();
        assert!(samples.iter().all(|&s| (4000..=6000).contains(&s)));
        assert!(samples.iter().any(|&s| s != samples[0]), "samples never varied");
        let avg = samples.iter().sum::<u64>() / samples.len() as u64;
        assert!((4600..=5400).contains(&avg), "sample mean drifted to {}", avg);
    }

    #[test]
    fn jitter_never_goes_negative() {
        let (mut engine, _, _) = engine_with(vec![row("112", 17)]);
        let mean = Duration::from_millis(100);
        let jitter = Duration::from_millis(2000);
        for _ in 0..200 {
            // Just exercising the clamp; Duration can't go below zero.
            let _ = engine.sample_ring_delay(mean, jitter);
        }
    }

    #[test]
    fn on_hook_cancels_pending_pickup() {
        let (mut engine, sink, _) = engine_with(vec![row("112", 17)]);
        let t0 = Instant::now();
        engine.handle_signal(PhoneInputSignal::HookState(false), t0);
        let t = dial(&mut engine, &[1, 1, 2], t0 + STEP);
        assert_eq!(engine.state(), PhoneState::AwaitingAnswer);
        engine.handle_signal(PhoneInputSignal::HookState(true), t);
        assert_eq!(engine.state(), PhoneState::Idle);
        assert!(engine.dial.is_empty());
        sink.clear();
        // Well past the would-be pickup; nothing may fire.
        engine.update_state(t + Duration::from_secs(30));
        assert!(sink.commands().is_empty());
        assert_eq!(engine.state(), PhoneState::Idle);
    }

    #[test]
    fn dial_timeout_clears_digits_and_replays_dial_tone() {
        let (mut engine, sink, _) = engine_with(vec![row("112", 17)]);
        let t0 = Instant::now();
        engine.handle_signal(PhoneInputSignal::HookState(false), t0);
        let t1 = t0 + STEP;
        engine.handle_signal(PhoneInputSignal::Digit(1), t1);
        sink.clear();
        engine.update_state(t1 + Duration::from_secs(7));
        assert!(engine.dial.is_empty());
        assert_eq!(engine.state(), PhoneState::Dialing);
        assert!(sink.commands().contains(&SinkCmd::Play(SND_DIAL_TONE)));
    }

    fn hold_row() -> NumberConfig {
        let mut r = row("1", 20);
        r.pre_ring_delay_ms = 0;
        r.ring_jitter_ms = 0;
        r.hold_after_playback = true;
        r
    }

    #[test]
    fn hold_music_is_interrupted_on_schedule_and_resumes() {
        let (mut engine, sink, _) = engine_with(vec![hold_row()]);
        let t0 = Instant::now();
        engine.handle_signal(PhoneInputSignal::HookState(false), t0);
        let t1 = t0 + Duration::from_secs(1);
        engine.handle_signal(PhoneInputSignal::Digit(1), t1);
        // Pickup happens right after the confirmation tone minimum.
        let t2 = t1 + Duration::from_millis(400);
        engine.update_state(t2);
        assert_eq!(engine.state(), PhoneState::InCall);
        // Message plays out; the caller lands on hold.
        let t3 = t2 + Duration::from_millis(5001);
        engine.update_state(t3);
        assert_eq!(engine.state(), PhoneState::OnHold);
        assert!(sink.commands().contains(&SinkCmd::Play(SND_HOLD_MUSIC)));
        assert_eq!(sink.count(SinkCmd::Advert(SND_PLEASE_HOLD)), 0);
        // First interruption after the configured interval.
        let t4 = t3 + Duration::from_millis(20001);
        engine.update_state(t4);
        assert_eq!(sink.count(SinkCmd::Advert(SND_PLEASE_HOLD)), 1);
        // The music resumes by itself; no replay command is issued.
        let t5 = t4 + Duration::from_millis(2001);
        engine.update_state(t5);
        assert_eq!(sink.count(SinkCmd::Play(SND_HOLD_MUSIC)), 1);
        // And the cycle repeats.
        let t6 = t5 + Duration::from_millis(20001);
        engine.update_state(t6);
        assert_eq!(sink.count(SinkCmd::Advert(SND_PLEASE_HOLD)), 2);
    }

    #[test]
    fn leaving_hold_cancels_the_pending_interrupt() {
        let (mut engine, sink, _) = engine_with(vec![hold_row()]);
        let t0 = Instant::now();
        engine.handle_signal(PhoneInputSignal::HookState(false), t0);
        let t1 = t0 + Duration::from_secs(1);
        engine.handle_signal(PhoneInputSignal::Digit(1), t1);
        engine.update_state(t1 + Duration::from_millis(400));
        engine.update_state(t1 + Duration::from_millis(5500));
        assert_eq!(engine.state(), PhoneState::OnHold);
        engine.handle_signal(PhoneInputSignal::HookState(true), t1 + Duration::from_secs(10));
        sink.clear();
        // The old interrupt deadline comes and goes; nothing may fire.
        engine.update_state(t1 + Duration::from_secs(60));
        assert_eq!(sink.count(SinkCmd::Advert(SND_PLEASE_HOLD)), 0);
        assert!(sink.commands().is_empty());
    }

    fn admin_row() -> NumberConfig {
        let mut r = row("0800865863", SND_ADMIN_PROMPT);
        r.pre_ring_delay_ms = 0;
        r.ring_jitter_ms = 0;
        r.kind = NumberKind::VolumeAdmin;
        r
    }

    fn enter_admin(engine: &mut CallEngine<FakeSink, MemStore>, t0: Instant) -> Instant {
        engine.handle_signal(PhoneInputSignal::HookState(false), t0);
        let t = dial(engine, &[0, 8, 0, 0, 8, 6, 5, 8, 6, 3], t0 + STEP);
        let t = t + Duration::from_millis(400);
        engine.update_state(t);
        assert_eq!(engine.state(), PhoneState::AdminVolumeEntry);
        t
    }

    #[test]
    fn admin_flow_accepts_valid_volume() {
        let (mut engine, sink, store) = engine_with(vec![admin_row(), row("??????????", SND_UNKNOWN)]);
        let t0 = Instant::now();
        let t = enter_admin(&mut engine, t0);
        assert!(sink.commands().contains(&SinkCmd::Play(SND_ADMIN_PROMPT)));
        sink.clear();
        engine.handle_signal(PhoneInputSignal::Digit(2), t + STEP);
        engine.handle_signal(PhoneInputSignal::Digit(5), t + STEP * 2);
        assert_eq!(engine.volume(), 25);
        assert_eq!(store.load(), Some(25));
        assert!(sink.commands().contains(&SinkCmd::Volume(25)));
        // The confirmation plays once the second digit's tone has had its
        // minimum playback.
        engine.update_state(t + STEP * 2 + Duration::from_millis(301));
        assert!(sink.commands().contains(&SinkCmd::Play(SND_VOLUME_UPDATED)));
        assert_eq!(engine.state(), PhoneState::InCall);
        // After the confirmation the line goes dead like any finished call.
        engine.update_state(t + STEP * 2 + Duration::from_secs(2));
        assert_eq!(engine.state(), PhoneState::LineDead);
    }

    #[test]
    fn admin_flow_rejects_out_of_range_volume_and_reprompts() {
        let (mut engine, sink, store) = engine_with(vec![admin_row()]);
        let t0 = Instant::now();
        let t = enter_admin(&mut engine, t0);
        sink.clear();
        engine.handle_signal(PhoneInputSignal::Digit(9), t + STEP);
        engine.handle_signal(PhoneInputSignal::Digit(9), t + STEP * 2);
        assert_eq!(engine.volume(), 15);
        assert_eq!(store.load(), None);
        engine.update_state(t + STEP * 2 + Duration::from_millis(301));
        assert_eq!(sink.count(SinkCmd::Play(SND_ADMIN_PROMPT)), 1);
        assert!(!sink.commands().iter().any(|c| matches!(c, SinkCmd::Volume(_))));
        assert_eq!(engine.state(), PhoneState::AdminVolumeEntry);
        // A valid retry still works.
        sink.clear();
        engine.handle_signal(PhoneInputSignal::Digit(3), t + STEP * 3);
        engine.handle_signal(PhoneInputSignal::Digit(0), t + STEP * 4);
        assert_eq!(engine.volume(), 30);
        assert_eq!(store.load(), Some(30));
    }

    #[test]
    fn admin_feedback_waits_for_the_last_tone_minimum() {
        let (mut engine, sink, _) = engine_with(vec![admin_row()]);
        let t0 = Instant::now();
        let t = enter_admin(&mut engine, t0);
        sink.clear();
        engine.handle_signal(PhoneInputSignal::Digit(2), t + STEP);
        let t_last = t + STEP * 2;
        engine.handle_signal(PhoneInputSignal::Digit(5), t_last);
        // The level takes effect right away, but the confirmation message
        // must not cut the digit's tone short.
        assert_eq!(engine.volume(), 25);
        assert!(!sink.commands().contains(&SinkCmd::Play(SND_VOLUME_UPDATED)));
        engine.update_state(t_last + Duration::from_millis(200));
        assert!(!sink.commands().contains(&SinkCmd::Play(SND_VOLUME_UPDATED)));
        assert_eq!(engine.state(), PhoneState::AdminVolumeEntry);
        engine.update_state(t_last + Duration::from_millis(301));
        assert!(sink.commands().contains(&SinkCmd::Play(SND_VOLUME_UPDATED)));
        assert_eq!(engine.state(), PhoneState::InCall);
    }

    #[test]
    fn admin_reprompt_waits_for_the_last_tone_minimum() {
        let (mut engine, sink, _) = engine_with(vec![admin_row()]);
        let t0 = Instant::now();
        let t = enter_admin(&mut engine, t0);
        sink.clear();
        engine.handle_signal(PhoneInputSignal::Digit(9), t + STEP);
        let t_last = t + STEP * 2;
        engine.handle_signal(PhoneInputSignal::Digit(9), t_last);
        engine.update_state(t_last + Duration::from_millis(200));
        assert_eq!(sink.count(SinkCmd::Play(SND_ADMIN_PROMPT)), 0);
        engine.update_state(t_last + Duration::from_millis(301));
        assert_eq!(sink.count(SinkCmd::Play(SND_ADMIN_PROMPT)), 1);
        assert_eq!(engine.state(), PhoneState::AdminVolumeEntry);
    }

    #[test]
    fn persisted_volume_is_applied_at_startup() {
        let mut config = test_config();
        config.numbers = vec![row("112", 17)];
        let table = NumberTable::from_config(&config.numbers).unwrap();
        let sink = FakeSink::default();
        let store = MemStore::default();
        store.clone().save(22).unwrap();
        let engine = CallEngine::new(config, table, sink.clone(), store);
        assert_eq!(engine.volume(), 22);
        assert!(sink.commands().contains(&SinkCmd::Volume(22)));
    }

    #[test]
    fn finished_call_plays_connection_lost_until_hangup() {
        let (mut engine, sink, _) = engine_with(vec![row("112", 17)]);
        let t0 = Instant::now();
        engine.handle_signal(PhoneInputSignal::HookState(false), t0);
        let t = dial(&mut engine, &[1, 1, 2], t0 + STEP);
        engine.update_state(t + Duration::from_secs(5));
        assert_eq!(engine.state(), PhoneState::InCall);
        engine.update_state(t + Duration::from_secs(60));
        assert_eq!(engine.state(), PhoneState::LineDead);
        assert!(sink.commands().contains(&SinkCmd::Play(SND_CONNECTION_LOST)));
        // Digits on a dead line do nothing.
        sink.clear();
        engine.handle_signal(PhoneInputSignal::Digit(1), t + Duration::from_secs(61));
        assert!(sink.commands().is_empty());
        engine.handle_signal(PhoneInputSignal::HookState(true), t + Duration::from_secs(62));
        assert_eq!(engine.state(), PhoneState::Idle);
    }
}
