//! Log pane: recent tracing output under the call view.

use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Widget},
};

use super::log_capture::LogBuffer;

/// Scrollback kept by the pane.
const HISTORY: usize = 1000;

pub const PANE_HEIGHT: u16 = 8;

pub struct LogPane {
    source: LogBuffer,
    lines: Vec<String>,
    pub visible: bool,
    /// Lines scrolled back from the newest one.
    offset: usize,
}

impl LogPane {
    pub fn new(source: LogBuffer) -> Self {
        Self {
            source,
            lines: Vec::new(),
            visible: false,
            offset: 0,
        }
    }

    /// Pull newly captured lines. Call once per frame.
    pub fn refresh(&mut self) {
        let fresh = self.source.drain();
        if fresh.is_empty() {
            return;
        }
        self.lines.extend(fresh);
        if self.lines.len() > HISTORY {
            let excess = self.lines.len() - HISTORY;
            self.lines.drain(..excess);
            self.offset = self.offset.saturating_sub(excess);
        }
    }

    pub fn toggle(&mut self) {
        self.visible = !self.visible;
        if self.visible {
            self.offset = 0;
        }
    }

    pub fn scroll_back(&mut self, n: usize) {
        let max = self.lines.len().saturating_sub(1);
        self.offset = (self.offset + n).min(max);
    }

    pub fn scroll_forward(&mut self, n: usize) {
        self.offset = self.offset.saturating_sub(n);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }
}

fn level_color(line: &str) -> Color {
    if line.contains("ERROR") {
        Color::Red
    } else if line.contains(" WARN ") {
        Color::Yellow
    } else if line.contains(" INFO ") {
        Color::Green
    } else if line.contains("DEBUG") || line.contains("TRACE") {
        Color::DarkGray
    } else {
        Color::White
    }
}

pub fn render(area: Rect, buf: &mut Buffer, pane: &LogPane) {
    let block = Block::default()
        .borders(Borders::TOP)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(Span::styled(
            " Log ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ));
    let inner = block.inner(area);
    block.render(area, buf);
    if inner.height == 0 {
        return;
    }

    let end = pane.lines.len().saturating_sub(pane.offset);
    let start = end.saturating_sub(inner.height as usize);
    let shown: Vec<Line> = pane.lines[start..end]
        .iter()
        .map(|l| Line::from(Span::styled(l.clone(), Style::default().fg(level_color(l)))))
        .collect();
    Paragraph::new(shown).render(inner, buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pane_with(n: usize) -> LogPane {
        let source = LogBuffer::new();
        for i in 0..n {
            source.push(format!("line {}", i));
        }
        let mut pane = LogPane::new(source);
        pane.refresh();
        pane
    }

    #[test]
    fn test_refresh_accumulates() {
        let source = LogBuffer::new();
        let mut pane = LogPane::new(source.clone());
        source.push("a".into());
        pane.refresh();
        source.push("b".into());
        pane.refresh();
        assert_eq!(pane.len(), 2);
    }

    #[test]
    fn test_scrolling_is_clamped() {
        let mut pane = pane_with(5);
        pane.scroll_back(100);
        assert_eq!(pane.offset, 4);
        pane.scroll_forward(1);
        assert_eq!(pane.offset, 3);
        pane.toggle();
        assert!(pane.visible);
        assert_eq!(pane.offset, 0);
    }

    #[test]
    fn test_render_shows_newest_lines() {
        let pane = pane_with(20);
        let area = Rect::new(0, 0, 30, 4);
        let mut buf = Buffer::empty(area);
        render(area, &mut buf, &pane);

        let text: String = (0..area.height)
            .map(|y| {
                (0..area.width)
                    .map(|x| buf[(x, y)].symbol().to_string())
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n");
        assert!(text.contains("line 19"));
        assert!(text.contains("line 17"));
        assert!(!text.contains("line 16"));
    }
}
