//! Raw-mode TTY frontend
//!
//! Translates single keystrokes into the same command surface the network
//! client drives. Runs on a blocking thread; canonical mode is restored when
//! the loop exits, including on panic.

use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::{debug, warn};

use crate::error::{AppError, ErrorSlot};
use crate::server::{CommandSink, Param};
use crate::utils::Shutdown;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Option<Self> {
        match enable_raw_mode() {
            Ok(()) => Some(Self),
            Err(e) => {
                warn!("cannot enable raw terminal mode: {}", e);
                None
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Spawn the keystroke loop. Returns immediately when stdin is not a TTY.
pub fn spawn(
    sink: Arc<dyn CommandSink>,
    shutdown: Shutdown,
    errors: Arc<ErrorSlot>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || run(sink.as_ref(), &shutdown, &errors))
}

fn run(sink: &dyn CommandSink, shutdown: &Shutdown, errors: &ErrorSlot) {
    let Some(_guard) = RawModeGuard::enable() else {
        return;
    };

    while !shutdown.is_triggered() {
        match event::poll(POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                warn!("tty poll failed: {}", e);
                return;
            }
        }
        let Ok(Event::Key(key)) = event::read() else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        // Ctrl-C in raw mode arrives as a key event; treat it as an
        // interrupt rather than a clean quit.
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            errors.record(AppError::Interrupt);
            shutdown.trigger();
            return;
        }
        match key.code {
            KeyCode::Char('q') => {
                shutdown.trigger();
                return;
            }
            KeyCode::Char('s') => sink.output_status(),
            KeyCode::Char('c') => sink.output_config(),
            KeyCode::Char('m') => sink.cycle_mode(),
            KeyCode::Char('p') => sink.next_page(),
            KeyCode::Char('d') => sink.debug_trigger(),
            KeyCode::Char('[') => sink.adjust_param(Param::Primary, false),
            KeyCode::Char(']') => sink.adjust_param(Param::Primary, true),
            KeyCode::Char('{') => sink.adjust_param(Param::Secondary, false),
            KeyCode::Char('}') => sink.adjust_param(Param::Secondary, true),
            other => debug!("unmapped key {:?}", other),
        }
    }
}
