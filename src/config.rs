use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use serde::Deserialize;
use thiserror::Error;

use crate::mp3::{SoundIndex, MAX_VOLUME, MIN_VOLUME};

#[allow(non_camel_case_types)]
pub type ms = u64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("unable to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct PhoneConfig {
    /// Number of times per second to update the phone state.
    /// Higher is better, but will also consume more CPU cycles.
    pub tick_rate: f64,

    /// Playback volume (1-30) used when no persisted volume exists.
    pub volume: u8,

    /// Path of the file used to persist volume updates across restarts.
    pub volume_file: PathBuf,

    /// Timing tunables.
    #[serde(default)]
    pub timing: TimingConfig,

    /// File indices of the sounds on the MP3 module.
    pub sounds: SoundsConfig,

    /// GPIO configuration. Only required on Raspberry Pi builds.
    pub gpio: Option<GpioConfig>,

    /// Recognized phone numbers, in precedence order.
    ///
    /// Numbers are matched top to bottom and the first matching row wins,
    /// so rows with wildcards must come after any rows they overlap with.
    /// The all-wildcard catch-all goes last.
    pub numbers: Vec<NumberConfig>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case", default)]
pub struct TimingConfig {
    /// Minimum time (ms) a digit's confirmation tone plays.
    /// Only the next accepted digit may cut it short.
    pub min_button_playback_duration_ms: ms,

    /// Pause (ms) after every command sent to the MP3 module.
    /// Increase this if starting/stopping files sometimes does not register.
    pub delay_after_mp3_send_ms: ms,

    /// Digits arriving closer together than this (ms) count as switch bounce
    /// and are dropped.
    pub button_debounce_time_ms: ms,

    /// Abandon a partially dialed number after this long (ms) without a digit.
    pub digit_timeout_ms: ms,

    /// Interval (ms) between busy announcements while hold music plays.
    pub waiting_music_interrupt_time_ms: ms,

    /// Length (ms) of the busy announcement file.
    pub please_hold_msg_length_ms: ms,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_button_playback_duration_ms: 300,
            delay_after_mp3_send_ms: 30,
            button_debounce_time_ms: 10,
            digit_timeout_ms: 6000,
            waiting_music_interrupt_time_ms: 20000,
            please_hold_msg_length_ms: 2000,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct SoundsConfig {
    /// Index of the DTMF tone for digit 0. The tones for digits 1-9 must
    /// follow on the next nine indices.
    pub dtmf_base: SoundIndex,

    /// 425Hz sound/no-sound tone played once a call has wound down.
    pub connection_lost: SoundIndex,

    /// Ringing tone heard while waiting for the other side to pick up.
    pub ringing: SoundIndex,

    /// Constant tone signalling the phone is ready to dial.
    pub dial_tone: SoundIndex,

    /// Loud tone played once at startup.
    pub ready: SoundIndex,

    /// Operator message saying the number is unknown.
    pub number_unknown: SoundIndex,

    /// Length (ms) of the unknown-number message.
    pub number_unknown_length_ms: ms,

    /// Hold music played after calls flagged `hold-after-playback`.
    pub hold_music: SoundIndex,

    /// Advert-folder index of the "all operators busy" announcement.
    pub please_hold_advert: SoundIndex,

    /// Confirmation message played after a successful volume update.
    pub volume_updated: SoundIndex,

    /// Length (ms) of the volume-updated message.
    pub volume_updated_length_ms: ms,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct GpioConfig {
    /// Wiring variant of the phone.
    pub wiring: WiringVariant,

    /// BCM pin numbers of the keypad column outputs.
    pub keypad_col_pins: [u8; 3],

    /// BCM pin numbers of the keypad row inputs, in fixed-wiring order.
    pub keypad_row_pins: [u8; 4],

    /// BCM pin number of the hook switch input. High means on-hook.
    pub hook_pin: u8,

    /// Bounce time (ms) of the hook switch.
    #[serde(default = "default_hook_bounce_ms")]
    pub hook_bounce_ms: ms,
}

fn default_hook_bounce_ms() -> ms {
    20
}

/// The two supported wiring schemes. They differ only in which pins the last
/// two keypad rows connect to.
#[derive(Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WiringVariant {
    /// Wiring of the fixed installation phone.
    EscapeRoom,
    /// Wiring of the portable phone.
    Portable,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct NumberConfig {
    /// Digits of the number. `?` matches any single digit.
    pub digits: String,

    /// Index of the MP3 file played when the call is answered.
    pub sound: SoundIndex,

    /// How long the file plays (ms) before the call winds down.
    pub playback_duration_ms: ms,

    /// Mean delay (ms) before the other side picks up.
    pub pre_ring_delay_ms: ms,

    /// Spread (ms) applied to the pickup delay so the ringing time varies
    /// call to call.
    #[serde(default)]
    pub ring_jitter_ms: ms,

    /// What dialing this number does.
    #[serde(default)]
    pub kind: NumberKind,

    /// Play hold music with busy interruptions after the file finishes,
    /// instead of the connection-lost tone.
    #[serde(default)]
    pub hold_after_playback: bool,
}

#[derive(Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NumberKind {
    /// Normal simulated call.
    Call,
    /// Calling this number starts the volume update flow.
    VolumeAdmin,
}

impl Default for NumberKind {
    fn default() -> Self {
        NumberKind::Call
    }
}

pub fn load_config(path: &Path) -> Result<PhoneConfig, ConfigError> {
    let config_str = fs::read_to_string(path)?;
    let config: PhoneConfig = toml::from_str(&config_str)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &PhoneConfig) -> Result<(), ConfigError> {
    if !(config.tick_rate > 0.0) {
        return Err(ConfigError::Invalid(format!(
            "tick-rate must be positive, got {}",
            config.tick_rate
        )));
    }
    if !(MIN_VOLUME..=MAX_VOLUME).contains(&config.volume) {
        return Err(ConfigError::Invalid(format!(
            "volume must be between {} and {}, got {}",
            MIN_VOLUME, MAX_VOLUME, config.volume
        )));
    }
    if config.numbers.is_empty() {
        return Err(ConfigError::Invalid(
            "at least one number must be configured".to_string(),
        ));
    }
    Ok(())
}
