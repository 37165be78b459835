use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};

use crate::app::{App, InputMode};
use bridgeit_chat::chat::{HistoryState, Message, SessionState};

pub fn draw(f: &mut Frame<'_>, app: &App) {
    let size = f.size();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Title bar
            Constraint::Min(0),    // Main content
            Constraint::Length(3), // Input area
        ])
        .split(size);

    draw_title_bar(f, app, chunks[0]);

    let main_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(70), // Conversation
            Constraint::Percentage(30), // Session info + status log
        ])
        .split(chunks[1]);

    draw_chat_area(f, app, main_chunks[0]);
    draw_info_panel(f, app, main_chunks[1]);

    draw_input_area(f, app, chunks[2]);
}

fn state_color(app: &App) -> Color {
    if app.blocking_error.is_some() {
        return Color::Red;
    }
    match app.session.as_ref() {
        Some(session) if session.is_reconnecting() => Color::Yellow,
        Some(session) => match session.state() {
            SessionState::Connected => Color::Green,
            SessionState::Connecting => Color::Yellow,
            SessionState::Idle | SessionState::Failed(_) => Color::Red,
        },
        None => Color::Gray,
    }
}

fn draw_title_bar(f: &mut Frame, app: &App, area: Rect) {
    let peer = app
        .session
        .as_ref()
        .map(|s| s.key().remote_user_id.as_str())
        .unwrap_or("nobody");
    let title = format!(
        " BridgeIT chat | {} -> {} | {} ",
        app.settings.user_id,
        peer,
        app.status_label()
    );

    let title_block = Block::default()
        .borders(Borders::ALL)
        .style(Style::default().fg(state_color(app)))
        .title(" BridgeIT ");

    let title_paragraph = Paragraph::new(title)
        .block(title_block)
        .alignment(Alignment::Center);

    f.render_widget(title_paragraph, area);
}

fn draw_chat_area(f: &mut Frame, app: &App, area: Rect) {
    let title = match app.session.as_ref() {
        Some(session) => format!(" Chat with {} ", session.key().remote_user_id),
        None => " Chat ".to_string(),
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .title(title)
        .style(Style::default().fg(Color::Cyan));

    let inner = block.inner(area);
    f.render_widget(block, area);

    let rows = if app.get_visible_messages().is_empty() && !app.history_loading() {
        let hint_text = match (&app.blocking_error, app.session.is_some()) {
            (Some(_), _) => "Chat unavailable. See the status pane for details.",
            (None, true) => "No messages yet. Press i, type a message and press Enter to send.",
            (None, false) => "No conversation open. Use /chat <userId>, or /help for commands.",
        };
        wrap_line(
            Line::from(Span::styled(
                hint_text,
                Style::default().fg(Color::Gray).add_modifier(Modifier::ITALIC),
            )),
            inner.width as usize,
        )
    } else {
        conversation_rows(
            app.get_visible_messages(),
            &app.settings.user_id,
            app.history_loading(),
            inner.width as usize,
            inner.height as usize,
        )
    };

    f.render_widget(Paragraph::new(rows), inner);
}

/// The newest `height` screen rows of the conversation, already wrapped to `width`.
fn conversation_rows(
    messages: &[Message],
    own_user_id: &str,
    loading: bool,
    width: usize,
    height: usize,
) -> Vec<Line<'static>> {
    let mut rows = Vec::new();

    if loading {
        rows.extend(wrap_line(
            Line::from(Span::styled(
                "Loading earlier messages...",
                Style::default().fg(Color::Gray).add_modifier(Modifier::ITALIC),
            )),
            width,
        ));
    }

    for message in messages {
        let timestamp = message
            .time_sent
            .with_timezone(&chrono::Local)
            .format("%H:%M:%S");
        let nick_color = if message.is_from(own_user_id) {
            Color::Green
        } else {
            Color::Magenta
        };

        let line = Line::from(vec![
            Span::styled(format!("[{}] ", timestamp), Style::default().fg(Color::Gray)),
            Span::styled(format!("<{}> ", message.sender_id), Style::default().fg(nick_color)),
            Span::raw(message.content.as_str()),
        ]);
        rows.extend(wrap_line(line, width));
    }

    let skip = rows.len().saturating_sub(height);
    rows.split_off(skip)
}

fn char_width(c: char) -> usize {
    let mut buf = [0u8; 4];
    Span::raw(&*c.encode_utf8(&mut buf)).width()
}

/// Break `line` into rows no wider than `width` columns, keeping span styles.
fn wrap_line(line: Line<'_>, width: usize) -> Vec<Line<'static>> {
    let width = width.max(1);
    let mut rows = Vec::new();
    let mut row: Vec<Span<'static>> = Vec::new();
    let mut used = 0;

    for span in line.spans {
        let style = span.style;
        let mut chunk = String::new();
        for c in span.content.chars() {
            if c == '\n' {
                if !chunk.is_empty() {
                    row.push(Span::styled(std::mem::take(&mut chunk), style));
                }
                rows.push(Line::from(std::mem::take(&mut row)));
                used = 0;
                continue;
            }

            let w = char_width(c);
            if used + w > width && used > 0 {
                if !chunk.is_empty() {
                    row.push(Span::styled(std::mem::take(&mut chunk), style));
                }
                rows.push(Line::from(std::mem::take(&mut row)));
                used = 0;
            }
            chunk.push(c);
            used += w;
        }
        if !chunk.is_empty() {
            row.push(Span::styled(chunk, style));
        }
    }

    if !row.is_empty() || rows.is_empty() {
        rows.push(Line::from(row));
    }
    rows
}

fn draw_info_panel(f: &mut Frame<'_>, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6), // Session info
            Constraint::Min(0),    // Status log
        ])
        .split(area);

    let session_block = Block::default()
        .borders(Borders::ALL)
        .title(" Session ")
        .style(Style::default().fg(Color::Blue));

    let session_text = match app.session.as_ref() {
        Some(session) => {
            let history = match session.history_state() {
                HistoryState::NotRequested => "not requested".to_string(),
                HistoryState::Loading => "loading".to_string(),
                HistoryState::Loaded(count) => format!("{} loaded", count),
                HistoryState::Unavailable => "unavailable".to_string(),
            };
            vec![
                Line::from(vec![
                    Span::raw("Pair: "),
                    Span::styled(session.key().to_string(), Style::default().fg(Color::Green)),
                ]),
                Line::from(vec![
                    Span::raw("Messages: "),
                    Span::styled(
                        session.transcript().len().to_string(),
                        Style::default().fg(Color::Cyan),
                    ),
                ]),
                Line::from(vec![
                    Span::raw("History: "),
                    Span::styled(history, Style::default().fg(Color::Gray)),
                ]),
                Line::from(vec![
                    Span::raw("Status: "),
                    Span::styled(app.status_label(), Style::default().fg(state_color(app))),
                ]),
            ]
        }
        None => vec![Line::from(Span::styled(
            "No conversation",
            Style::default().fg(Color::Gray),
        ))],
    };

    f.render_widget(Paragraph::new(session_text).block(session_block), chunks[0]);

    let status_block = Block::default()
        .borders(Borders::ALL)
        .title(" Status ")
        .style(Style::default().fg(Color::Blue));
    let status_inner = status_block.inner(chunks[1]);
    f.render_widget(status_block, chunks[1]);

    let height = status_inner.height as usize;
    let mut status_rows: Vec<Line> = app
        .get_visible_status_messages(height)
        .into_iter()
        .flat_map(|line| {
            wrap_line(
                Line::from(Span::styled(line.as_str(), Style::default().fg(Color::White))),
                status_inner.width as usize,
            )
        })
        .collect();
    let skip = status_rows.len().saturating_sub(height);
    f.render_widget(Paragraph::new(status_rows.split_off(skip)), status_inner);
}

fn draw_input_area(f: &mut Frame, app: &App, area: Rect) {
    let input_style = match app.input_mode {
        InputMode::Normal => Style::default().fg(Color::White),
        InputMode::Editing if app.can_send() => Style::default().fg(Color::Green),
        InputMode::Editing => Style::default().fg(Color::DarkGray),
    };

    let mode_indicator = match app.input_mode {
        InputMode::Normal => "[NORMAL] Press 'i' to enter input mode",
        InputMode::Editing if app.can_send() => "[INPUT] ESC=normal, ENTER=send",
        InputMode::Editing => "[INPUT] not connected - commands only",
    };

    let input_block = Block::default()
        .borders(Borders::ALL)
        .title(mode_indicator)
        .style(input_style);

    let input_text = if app.input_mode == InputMode::Editing {
        app.input.as_str()
    } else {
        ""
    };

    let input_paragraph = Paragraph::new(input_text)
        .block(input_block)
        .wrap(Wrap { trim: false });

    f.render_widget(input_paragraph, area);

    if app.input_mode == InputMode::Editing {
        f.set_cursor(area.x + app.cursor_position as u16 + 1, area.y + 1);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use ratatui::{backend::TestBackend, Terminal};

    use super::*;

    fn message(sender: &str, content: &str) -> Message {
        Message::local(
            sender,
            if sender == "S1" { "E1" } else { "S1" },
            content,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
        )
    }

    fn render(messages: &[Message], loading: bool) -> Vec<String> {
        let mut terminal = Terminal::new(TestBackend::new(80, 24)).unwrap();
        terminal
            .draw(|f| {
                let area = f.size();
                let rows = conversation_rows(messages, "S1", loading, area.width as usize, area.height as usize);
                f.render_widget(Paragraph::new(rows), area);
            })
            .unwrap();

        let buffer = terminal.backend().buffer();
        (0..buffer.area.height)
            .map(|y| (0..buffer.area.width).map(|x| buffer.get(x, y).symbol()).collect::<String>())
            .collect()
    }

    #[test]
    fn newest_message_stays_on_screen_when_older_ones_wrap() {
        let long = "x".repeat(1200);
        let messages = vec![message("E1", &long), message("E1", &long), message("S1", "NEWEST")];

        let screen = render(&messages, true);

        assert!(screen[23].contains("NEWEST"), "last row was {:?}", screen[23]);
    }

    #[test]
    fn loading_hint_sits_above_short_conversations() {
        let messages = vec![message("E1", "Hi"), message("S1", "Hello")];

        let screen = render(&messages, true);

        assert!(screen[0].contains("Loading earlier messages..."));
        assert!(screen[1].contains("<E1> Hi"));
        assert!(screen[2].contains("<S1> Hello"));
    }

    #[test]
    fn wrapped_rows_never_exceed_width() {
        let line = Line::from(vec![Span::raw("<E1> "), Span::raw("y".repeat(25))]);

        let rows = wrap_line(line, 10);

        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.width() <= 10));
        assert_eq!(rows[0].spans[0].content, "<E1> ");
    }

    #[test]
    fn embedded_newlines_start_new_rows() {
        let rows = wrap_line(Line::from("one\ntwo"), 80);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].width(), 3);
    }
}
