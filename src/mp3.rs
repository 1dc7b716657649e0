use std::time::Duration;
use log::info;

/// 1-based index of a file on the MP3 module's storage.
pub type SoundIndex = u16;

pub const MIN_VOLUME: u8 = 1;
pub const MAX_VOLUME: u8 = 30;

/// Narrow interface to the MP3 playback module.
///
/// The module reports no completion events; callers time playback from the
/// configured file durations. A duration that disagrees with the actual file
/// length desynchronizes the call simulation.
pub trait PlaybackSink {
    /// Starts playing the given file, replacing whatever is playing.
    fn play(&mut self, sound: SoundIndex);

    /// Interrupts the current file with a file from the advert folder.
    /// The interrupted file resumes where it left off once the advert ends.
    fn advert(&mut self, sound: SoundIndex);

    /// Stops all playback.
    fn stop(&mut self);

    /// Sets the playback volume (1-30).
    fn set_volume(&mut self, level: u8);
}

/// Wraps a sink and pauses after every command.
///
/// The module drops commands that arrive while it is still processing the
/// previous one, so every command must be followed by a short settle pause
/// even though it briefly blocks the tick loop.
pub struct SettlingSink<P> {
    inner: P,
    settle: Duration,
}

impl<P> SettlingSink<P> {
    pub fn new(inner: P, settle: Duration) -> Self {
        Self { inner, settle }
    }

    fn pause(&self) {
        if !self.settle.is_zero() {
            spin_sleep::sleep(self.settle);
        }
    }
}

impl<P: PlaybackSink> PlaybackSink for SettlingSink<P> {
    fn play(&mut self, sound: SoundIndex) {
        self.inner.play(sound);
        self.pause();
    }

    fn advert(&mut self, sound: SoundIndex) {
        self.inner.advert(sound);
        self.pause();
    }

    fn stop(&mut self) {
        self.inner.stop();
        self.pause();
    }

    fn set_volume(&mut self, level: u8) {
        self.inner.set_volume(level);
        self.pause();
    }
}

/// Sink for development machines without the module; logs commands instead
/// of sending them.
pub struct ConsoleMp3;

impl PlaybackSink for ConsoleMp3 {
    fn play(&mut self, sound: SoundIndex) {
        info!("mp3: play {}", sound);
    }

    fn advert(&mut self, sound: SoundIndex) {
        info!("mp3: advert {}", sound);
    }

    fn stop(&mut self) {
        info!("mp3: stop");
    }

    fn set_volume(&mut self, level: u8) {
        info!("mp3: volume {}", level);
    }
}

#[cfg_attr(not(feature = "rpi"), allow(dead_code))]
mod cmd {
    pub const CMD_PLAY_TRACK: u8 = 0x03;
    pub const CMD_SET_VOLUME: u8 = 0x06;
    pub const CMD_PLAY_ADVERT: u8 = 0x13;
    pub const CMD_STOP: u8 = 0x16;
}

/// Builds one DFPlayer command frame: start byte, version, length, command,
/// no-feedback flag, argument, two's-complement checksum, end byte.
#[cfg_attr(not(feature = "rpi"), allow(dead_code))]
fn build_frame(cmd: u8, arg: u16) -> [u8; 10] {
    let mut frame = [
        0x7E,
        0xFF,
        0x06,
        cmd,
        0x00,
        (arg >> 8) as u8,
        arg as u8,
        0x00,
        0x00,
        0xEF,
    ];
    let sum: u16 = frame[1..7].iter().map(|&b| b as u16).sum();
    let checksum = 0u16.wrapping_sub(sum);
    frame[7] = (checksum >> 8) as u8;
    frame[8] = checksum as u8;
    frame
}

#[cfg(feature = "rpi")]
mod serial {
    use log::warn;
    use rppal::uart::{Parity, Uart};

    use super::cmd::*;
    use super::{build_frame, PlaybackSink, SoundIndex};

    /// DFPlayer-style MP3 module on the primary UART.
    pub struct SerialMp3 {
        uart: Uart,
    }

    impl SerialMp3 {
        pub fn open() -> Result<Self, rppal::uart::Error> {
            let uart = Uart::new(9600, Parity::None, 8, 1)?;
            Ok(Self { uart })
        }

        fn send(&mut self, cmd: u8, arg: u16) {
            let frame = build_frame(cmd, arg);
            // The module acknowledges nothing useful; a failed write only
            // means a missed sound, not a reason to abort.
            if let Err(err) = self.uart.write(&frame) {
                warn!("MP3 command 0x{:02X} failed: {}", cmd, err);
            }
        }
    }

    impl PlaybackSink for SerialMp3 {
        fn play(&mut self, sound: SoundIndex) {
            self.send(CMD_PLAY_TRACK, sound);
        }

        fn advert(&mut self, sound: SoundIndex) {
            self.send(CMD_PLAY_ADVERT, sound);
        }

        fn stop(&mut self) {
            self.send(CMD_STOP, 0);
        }

        fn set_volume(&mut self, level: u8) {
            self.send(CMD_SET_VOLUME, level as u16);
        }
    }
}

#[cfg(feature = "rpi")]
pub use serial::SerialMp3;
