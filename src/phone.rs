use std::io::BufRead;
use std::sync::mpsc;
use std::thread;
use log::info;

/// Input signals sent from the host phone hardware to the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PhoneInputSignal {
    /// A keypad digit (0-9) was pressed.
    Digit(u8),
    /// The handset was placed on (`true`) or lifted off (`false`) the hook.
    HookState(bool),
}

/// Spawns a reader that turns stdin into phone input signals, for
/// development machines without the keypad hardware.
///
/// Digits dial; `h` toggles the hook.
pub fn spawn_console_input() -> mpsc::Receiver<PhoneInputSignal> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut on_hook = true;
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            for ch in line.chars() {
                match ch {
                    '0'..='9' => {
                        if tx.send(PhoneInputSignal::Digit(ch as u8 - b'0')).is_err() {
                            return;
                        }
                    }
                    'h' | 'H' => {
                        on_hook = !on_hook;
                        info!("Console hook is now {}", if on_hook { "ON" } else { "OFF" });
                        if tx.send(PhoneInputSignal::HookState(on_hook)).is_err() {
                            return;
                        }
                    }
                    _ => {}
                }
            }
        }
    });
    rx
}
