//! Terminal call screen
//!
//! Renders a [`crate::calling::CallView`] with Ratatui and turns key presses
//! into session intents.

mod app;
pub mod log_capture;
mod log_pane;
mod ui;

pub use app::{run, ScreenOptions};
pub use log_capture::LogBuffer;
