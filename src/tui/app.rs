//! Call screen state and event loop

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossterm::event::{Event, EventStream, KeyCode, KeyEventKind, KeyModifiers};
use futures::{FutureExt, StreamExt};
use ratatui::DefaultTerminal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;

use super::log_capture::LogBuffer;
use super::log_pane::LogPane;
use super::ui;
use crate::calling::{CallSession, CallView};

/// Target frame rate for UI updates (~30 fps)
const FRAME_DURATION_MS: u64 = 33;

/// How long a toggle error stays in the status bar
const FLASH_DURATION: Duration = Duration::from_secs(4);

/// What a key press asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    ToggleMute,
    ToggleCamera,
    ToggleSpeaker,
    ToggleScreenShare,
    ToggleLog,
    ScrollLogBack,
    ScrollLogForward,
    HangUp,
}

pub fn key_intent(code: KeyCode, modifiers: KeyModifiers) -> Option<Intent> {
    match code {
        KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => Some(Intent::HangUp),
        KeyCode::Char('m') => Some(Intent::ToggleMute),
        KeyCode::Char('c') => Some(Intent::ToggleCamera),
        KeyCode::Char('s') => Some(Intent::ToggleSpeaker),
        KeyCode::Char('v') => Some(Intent::ToggleScreenShare),
        KeyCode::Char('l') => Some(Intent::ToggleLog),
        KeyCode::Up | KeyCode::PageUp => Some(Intent::ScrollLogBack),
        KeyCode::Down | KeyCode::PageDown => Some(Intent::ScrollLogForward),
        KeyCode::Char('q') | KeyCode::Esc => Some(Intent::HangUp),
        _ => None,
    }
}

/// A failed start shown until the screen closes
pub struct Failure {
    pub message: String,
    pub close_at: Instant,
}

/// Call screen state
pub struct App {
    /// Latest view published by the session
    pub view: CallView,
    /// Short-lived message from the last toggle
    pub flash: Option<String>,
    flash_until: Option<Instant>,
    pub failure: Option<Failure>,
    logs: Option<LogPane>,
    /// Results of background toggles, shown as flashes.
    flash_tx: mpsc::UnboundedSender<String>,
    flashes: mpsc::UnboundedReceiver<String>,
    screen_share: Option<JoinHandle<()>>,
    pub should_exit: bool,
}

impl App {
    pub fn new(view: CallView, logs: Option<LogBuffer>) -> Self {
        let (flash_tx, flashes) = mpsc::unbounded_channel();
        Self {
            view,
            flash: None,
            flash_until: None,
            failure: None,
            logs: logs.map(LogPane::new),
            flash_tx,
            flashes,
            screen_share: None,
            should_exit: false,
        }
    }

    pub fn log_pane(&self) -> Option<&LogPane> {
        self.logs.as_ref()
    }

    pub fn logs_visible(&self) -> bool {
        self.logs.as_ref().map_or(false, |p| p.visible)
    }

    /// Show `message` and close after `delay`.
    pub fn fail(&mut self, message: String, delay: Duration) {
        self.failure = Some(Failure {
            message,
            close_at: Instant::now() + delay,
        });
    }

    pub fn failure_seconds_left(&self) -> u64 {
        self.failure.as_ref().map_or(0, |f| {
            let left = f.close_at.saturating_duration_since(Instant::now());
            left.as_secs() + u64::from(left.subsec_nanos() > 0)
        })
    }

    fn set_flash(&mut self, message: String) {
        self.flash = Some(message);
        self.flash_until = Some(Instant::now() + FLASH_DURATION);
    }

    fn set_view(&mut self, view: CallView) {
        self.view = view;
        if self.view.ended && self.failure.is_none() {
            self.should_exit = true;
        }
    }

    /// Per-frame housekeeping.
    fn on_frame(&mut self, now: Instant) {
        if let Some(pane) = self.logs.as_mut() {
            pane.refresh();
        }
        if self.flash_until.map_or(false, |t| now >= t) {
            self.flash = None;
            self.flash_until = None;
        }
        if self.failure.as_ref().map_or(false, |f| now >= f.close_at) {
            self.should_exit = true;
        }
    }

    async fn apply(&mut self, session: &CallSession, intent: Intent) {
        match intent {
            Intent::ToggleMute => {
                session.toggle_mute();
            }
            Intent::ToggleCamera => {
                session.toggle_camera();
            }
            Intent::ToggleSpeaker => {
                session.toggle_speaker();
            }
            Intent::ToggleScreenShare => {
                // Capture can wait on a permission prompt; keep drawing.
                if self.screen_share.as_ref().map_or(false, |t| !t.is_finished()) {
                    return;
                }
                let session = session.clone();
                let flashes = self.flash_tx.clone();
                self.screen_share = Some(tokio::spawn(async move {
                    if let Err(e) = session.toggle_screen_share().await {
                        // Nobody to tell once the screen has closed.
                        let _ = flashes.send(e.user_message());
                    }
                }));
            }
            Intent::ToggleLog => {
                if let Some(pane) = self.logs.as_mut() {
                    pane.toggle();
                }
            }
            Intent::ScrollLogBack => {
                if let Some(pane) = self.logs.as_mut() {
                    pane.scroll_back(3);
                }
            }
            Intent::ScrollLogForward => {
                if let Some(pane) = self.logs.as_mut() {
                    pane.scroll_forward(3);
                }
            }
            Intent::HangUp => {
                session.end().await;
                self.should_exit = true;
            }
        }
    }
}

/// Call screen options
#[derive(Debug, Clone, Copy)]
pub struct ScreenOptions {
    /// How long a failed start stays on screen
    pub failure_close_delay: Duration,
}

/// Start `session` and show it until the call ends, with panic-safe
/// terminal restore.
pub async fn run(session: CallSession, logs: Option<LogBuffer>, options: ScreenOptions) -> Result<()> {
    let mut terminal = ratatui::init();
    let result = AssertUnwindSafe(run_app(&mut terminal, &session, logs.clone(), options))
        .catch_unwind()
        .await;
    ratatui::restore();
    session.end().await;
    if let Some(logs) = logs {
        logs.dump_to_stderr();
    }

    match result {
        Ok(r) => r,
        Err(e) => std::panic::resume_unwind(e),
    }
}

async fn run_app(
    terminal: &mut DefaultTerminal,
    session: &CallSession,
    logs: Option<LogBuffer>,
    options: ScreenOptions,
) -> Result<()> {
    let mut app = App::new(session.view(), logs);
    let mut views = WatchStream::new(session.subscribe());
    let mut keys = EventStream::new();
    let mut frame = tokio::time::interval(Duration::from_millis(FRAME_DURATION_MS));
    frame.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut start = {
        let session = session.clone();
        tokio::spawn(async move { session.start().await })
    };
    let mut starting = true;

    while !app.should_exit {
        terminal.draw(|f| ui::render(f, &app))?;

        tokio::select! {
            Some(view) = views.next() => app.set_view(view),
            Some(message) = app.flashes.recv() => app.set_flash(message),
            res = &mut start, if starting => {
                starting = false;
                let message = match res {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.user_message()),
                    Err(e) => Some(format!("Call setup crashed: {}", e)),
                };
                if let Some(message) = message {
                    app.fail(message, options.failure_close_delay);
                }
            }
            ev = keys.next() => match ev {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                    if let Some(intent) = key_intent(key.code, key.modifiers) {
                        app.apply(session, intent).await;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(anyhow!("terminal input failed: {}", e)),
                None => break,
            },
            _ = frame.tick() => app.on_frame(Instant::now()),
        }
    }

    if starting {
        start.abort();
    }
    if let Some(task) = app.screen_share.take() {
        task.abort();
    }
    Ok(())
}
