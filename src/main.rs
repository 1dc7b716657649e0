mod config;
mod engine;
#[cfg(feature = "rpi")]
mod gpio;
mod mp3;
mod numbers;
mod phone;
mod volume;

use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use log::{error, info, warn};
use simplelog::{ColorChoice, LevelFilter, TermLogger, TerminalMode};
use thread_priority::ThreadPriority;

use crate::config::{load_config, PhoneConfig};
use crate::engine::CallEngine;
use crate::mp3::SettlingSink;
use crate::numbers::NumberTable;
use crate::phone::PhoneInputSignal;
use crate::volume::FileVolumeStore;

const DEFAULT_CONFIG_PATH: &str = "./res/phone.toml";

fn main() {
    TermLogger::init(
        LevelFilter::Info,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .expect("failed to initialize logger");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = match load_config(Path::new(&config_path)) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    };
    info!("Config loaded from {}", config_path);

    let table = match NumberTable::from_config(&config.numbers) {
        Ok(table) => table,
        Err(err) => {
            error!("Invalid number table: {}", err);
            process::exit(1);
        }
    };
    info!("Number table loaded ({} numbers)", table.len());

    let input = open_input(&config);
    let settle = Duration::from_millis(config.timing.delay_after_mp3_send_ms);
    let sink = SettlingSink::new(open_sink(), settle);
    let store = FileVolumeStore::new(config.volume_file.clone());
    let tick_interval = Duration::from_secs_f64(1.0 / config.tick_rate);

    let mut engine = CallEngine::new(config, table, sink, store);
    engine.listen(input);
    engine.announce_ready();

    let running = Arc::new(AtomicBool::new(true));
    let running_ctrlc = Arc::clone(&running);
    ctrlc::set_handler(move || running_ctrlc.store(false, Ordering::SeqCst))
        .expect("failed to register shutdown handler");

    if let Err(err) = thread_priority::set_current_thread_priority(ThreadPriority::Max) {
        warn!("Unable to raise main thread priority: {:?}", err);
    }

    info!("Phone ready; entering main loop");
    while running.load(Ordering::SeqCst) {
        engine.tick();
        spin_sleep::sleep(tick_interval);
    }

    info!("Shutting down");
    engine.shutdown();
}

#[cfg(feature = "rpi")]
fn open_input(config: &PhoneConfig) -> std::sync::mpsc::Receiver<PhoneInputSignal> {
    let gpio_config = match &config.gpio {
        Some(gpio_config) => gpio_config,
        None => {
            error!("Config is missing the [gpio] section required on this platform");
            process::exit(1);
        }
    };
    match gpio::spawn_phone_input(gpio_config) {
        Ok(input) => input,
        Err(err) => {
            error!("Unable to initialize GPIO: {}", err);
            process::exit(1);
        }
    }
}

#[cfg(not(feature = "rpi"))]
fn open_input(_config: &PhoneConfig) -> std::sync::mpsc::Receiver<PhoneInputSignal> {
    info!("No keypad hardware; reading from stdin ('0'-'9' dial, 'h' toggles the hook)");
    phone::spawn_console_input()
}

#[cfg(feature = "rpi")]
fn open_sink() -> mp3::SerialMp3 {
    match mp3::SerialMp3::open() {
        Ok(sink) => sink,
        Err(err) => {
            error!("Unable to open MP3 module UART: {}", err);
            process::exit(1);
        }
    }
}

#[cfg(not(feature = "rpi"))]
fn open_sink() -> mp3::ConsoleMp3 {
    mp3::ConsoleMp3
}
