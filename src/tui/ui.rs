//! Call screen rendering

use ratatui::{
    buffer::Buffer,
    layout::{Alignment, Constraint, Flex, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Widget, Wrap},
    Frame,
};
use unicode_width::UnicodeWidthStr;

use super::app::App;
use super::log_pane;
use crate::calling::{CallView, ConnectionState, MediaKind};

/// Indicator symbol and color for a connection state
fn state_indicator(state: ConnectionState) -> (&'static str, Color) {
    match state {
        ConnectionState::New | ConnectionState::Connecting => ("~", Color::Yellow),
        ConnectionState::Connected => ("*", Color::Green),
        ConnectionState::Disconnected => ("!", Color::Yellow),
        ConnectionState::Failed => ("x", Color::Red),
        ConnectionState::Closed => ("o", Color::DarkGray),
    }
}

fn state_label(view: &CallView) -> &'static str {
    match view.state {
        ConnectionState::New => "Calling",
        ConnectionState::Connecting => "Connecting",
        ConnectionState::Connected => "Connected",
        ConnectionState::Disconnected => "Reconnecting",
        ConnectionState::Failed => "Connection failed",
        ConnectionState::Closed => "Call ended",
    }
}

pub fn render(frame: &mut Frame, app: &App) {
    let area = frame.area();
    let log_height = if app.logs_visible() {
        log_pane::PANE_HEIGHT
    } else {
        0
    };

    let [header_area, body_area, status_area, log_area, legend_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Fill(1),
        Constraint::Length(1),
        Constraint::Length(log_height),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(header_area, frame.buffer_mut(), &app.view);
    render_body(body_area, frame.buffer_mut(), &app.view);
    render_status(status_area, frame.buffer_mut(), app);
    if let Some(pane) = app.log_pane() {
        if pane.visible {
            log_pane::render(log_area, frame.buffer_mut(), pane);
        }
    }
    render_legend(legend_area, frame.buffer_mut(), &app.view);

    if let Some(failure) = &app.failure {
        render_failure(frame, &failure.message, app.failure_seconds_left());
    }
}

fn render_header(area: Rect, buf: &mut Buffer, view: &CallView) {
    let kind = match view.media {
        MediaKind::Audio => "Voice call",
        MediaKind::AudioVideo => "Video call",
    };
    let left = format!(" {} with {}", kind, view.peer_label);
    let right = format!("{} ", view.role);
    let padding = (area.width as usize).saturating_sub(left.width() + right.width());

    let line = Line::from(vec![
        Span::styled(
            left,
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        ),
        Span::raw(" ".repeat(padding)),
        Span::styled(right, Style::default().fg(Color::Gray)),
    ]);
    Paragraph::new(line)
        .style(Style::default().bg(Color::DarkGray))
        .render(area, buf);
}

fn flag(label: &str, on: bool, on_text: &str, off_text: &str) -> Line<'static> {
    let (text, color) = if on {
        (on_text, Color::Green)
    } else {
        (off_text, Color::DarkGray)
    };
    Line::from(vec![
        Span::styled(format!("{:<12}", label), Style::default().fg(Color::Gray)),
        Span::styled(text.to_string(), Style::default().fg(color)),
    ])
}

fn render_body(area: Rect, buf: &mut Buffer, view: &CallView) {
    let [local_area, remote_area] =
        Layout::horizontal([Constraint::Fill(1), Constraint::Fill(1)]).areas(area);

    let mut local = vec![flag("Microphone", !view.muted, "on", "muted")];
    if view.media.has_video() {
        local.push(flag("Camera", view.camera_enabled, "on", "off"));
        local.push(flag("Screen", view.screen_sharing, "sharing", "not shared"));
    }
    Paragraph::new(local)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray))
                .title(" You "),
        )
        .render(local_area, buf);

    let mut remote = vec![flag("Audio", view.remote_audio, "receiving", "waiting")];
    if view.media.has_video() {
        remote.push(flag("Video", view.remote_video, "receiving", "none"));
    }
    remote.push(flag("Speaker", view.speaker_enabled, "on", "off"));
    Paragraph::new(remote)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray))
                .title(format!(" {} ", view.peer_label)),
        )
        .render(remote_area, buf);
}

fn render_status(area: Rect, buf: &mut Buffer, app: &App) {
    let view = &app.view;
    let (symbol, color) = state_indicator(view.state);
    let mut spans = vec![
        Span::styled(
            format!(" {} {} ", symbol, state_label(view)),
            Style::default().fg(color),
        ),
        Span::styled(" | ", Style::default().fg(Color::DarkGray)),
        Span::styled(view.duration_label(), Style::default().fg(Color::Cyan)),
    ];
    let notice = app.flash.as_ref().or(view.notice.as_ref());
    if let Some(notice) = notice {
        spans.push(Span::styled(" | ", Style::default().fg(Color::DarkGray)));
        spans.push(Span::styled(notice.clone(), Style::default().fg(Color::Yellow)));
    }
    Paragraph::new(Line::from(spans))
        .style(Style::default().bg(Color::DarkGray))
        .render(area, buf);
}

fn render_legend(area: Rect, buf: &mut Buffer, view: &CallView) {
    let key = Style::default().fg(Color::Cyan);
    let text = Style::default().fg(Color::Gray);
    let mut spans = vec![
        Span::styled(" m", key),
        Span::styled(" mute  ", text),
    ];
    if view.media.has_video() {
        spans.extend([
            Span::styled("c", key),
            Span::styled(" camera  ", text),
            Span::styled("v", key),
            Span::styled(" share screen  ", text),
        ]);
    }
    spans.extend([
        Span::styled("s", key),
        Span::styled(" speaker  ", text),
        Span::styled("l", key),
        Span::styled(" log  ", text),
        Span::styled("q/Esc", key),
        Span::styled(" hang up", text),
    ]);
    Paragraph::new(Line::from(spans)).render(area, buf);
}

fn render_failure(frame: &mut Frame, message: &str, seconds_left: u64) {
    let [popup] = Layout::horizontal([Constraint::Percentage(60)])
        .flex(Flex::Center)
        .areas(frame.area());
    let [popup] = Layout::vertical([Constraint::Length(6)])
        .flex(Flex::Center)
        .areas(popup);

    frame.render_widget(Clear, popup);
    let body = vec![
        Line::from(Span::styled(message.to_string(), Style::default().fg(Color::White))),
        Line::from(""),
        Line::from(Span::styled(
            format!("Closing in {}s", seconds_left),
            Style::default().fg(Color::Gray),
        )),
    ];
    let widget = Paragraph::new(body)
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: true })
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Red))
                .title(Span::styled(
                    " Call failed ",
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
                )),
        );
    frame.render_widget(widget, popup);
}
