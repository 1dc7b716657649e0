#![cfg(feature = "rpi")]

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use log::info;
use rppal::gpio::{Gpio, InputPin, OutputPin};

use crate::config::{GpioConfig, WiringVariant};
use crate::phone::PhoneInputSignal;

const KEYPAD_COL_COUNT: usize = 3;
const KEYPAD_ROW_COUNT: usize = 4;
const KEYPAD_SCAN_INTERVAL: Duration = Duration::from_millis(1);
const KEYPAD_STROBE_SETTLE: Duration = Duration::from_micros(100);

/// Key at each row/column crossing. `*` and `#` exist on the pad but the
/// phone ignores them.
const KEYPAD_KEYS: [[Option<u8>; KEYPAD_COL_COUNT]; KEYPAD_ROW_COUNT] = [
    [Some(1), Some(2), Some(3)],
    [Some(4), Some(5), Some(6)],
    [Some(7), Some(8), Some(9)],
    [None, Some(0), None],
];

/// Sets up the keypad matrix and hook switch and spawns the scanner thread.
///
/// Columns are strobed high one at a time while the rows are read back; a
/// row going high names the pressed key. The engine's own debounce is
/// authoritative for digits, so the scanner only reports press edges.
pub fn spawn_phone_input(
    config: &GpioConfig,
) -> Result<mpsc::Receiver<PhoneInputSignal>, rppal::gpio::Error> {
    let gpio = Gpio::new()?;

    let cols = {
        let mut cols = Vec::with_capacity(KEYPAD_COL_COUNT);
        for &pin in &config.keypad_col_pins {
            cols.push(gpio.get(pin)?.into_output_low());
        }
        cols
    };

    // The portable phone's last two keypad rows are wired the other way around.
    let mut row_pins = config.keypad_row_pins;
    if config.wiring == WiringVariant::Portable {
        row_pins.swap(2, 3);
    }
    let rows = {
        let mut rows = Vec::with_capacity(KEYPAD_ROW_COUNT);
        for &pin in &row_pins {
            rows.push(gpio.get(pin)?.into_input_pulldown());
        }
        rows
    };

    let hook = gpio.get(config.hook_pin)?.into_input_pullup();
    let hook_bounce = Duration::from_millis(config.hook_bounce_ms);

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || scan_loop(tx, cols, rows, hook, hook_bounce));
    Ok(rx)
}

fn scan_loop(
    tx: mpsc::Sender<PhoneInputSignal>,
    mut cols: Vec<OutputPin>,
    rows: Vec<InputPin>,
    hook: InputPin,
    hook_bounce: Duration,
) {
    let mut pressed = [[false; KEYPAD_COL_COUNT]; KEYPAD_ROW_COUNT];
    let mut hook_state = hook.is_high();
    let mut hook_reading = hook_state;
    let mut hook_reading_since = Instant::now();

    info!("Keypad scanner started (hook is {})", if hook_state { "ON" } else { "OFF" });
    if !hook_state {
        // The handset was already lifted when we came up.
        if tx.send(PhoneInputSignal::HookState(false)).is_err() {
            return;
        }
    }

    loop {
        for (col, col_pin) in cols.iter_mut().enumerate() {
            col_pin.set_high();
            spin_sleep::sleep(KEYPAD_STROBE_SETTLE);
            for (row, row_pin) in rows.iter().enumerate() {
                let is_down = row_pin.is_high();
                if is_down && !pressed[row][col] {
                    if let Some(digit) = KEYPAD_KEYS[row][col] {
                        if tx.send(PhoneInputSignal::Digit(digit)).is_err() {
                            return;
                        }
                    }
                }
                pressed[row][col] = is_down;
            }
            col_pin.set_low();
        }

        // Hook switch, reported once the reading has been stable for the
        // bounce time.
        let reading = hook.is_high();
        if reading != hook_reading {
            hook_reading = reading;
            hook_reading_since = Instant::now();
        } else if reading != hook_state && hook_reading_since.elapsed() >= hook_bounce {
            hook_state = reading;
            if tx.send(PhoneInputSignal::HookState(hook_state)).is_err() {
                return;
            }
        }

        spin_sleep::sleep(KEYPAD_SCAN_INTERVAL);
    }
}
