//! Terminal User Interface (TUI) rendering and management.
//!
//! This module handles initializing the terminal in raw mode, restoring it on exit,
//! and drawing the application state using `ratatui`.

use std::io::{self, Stdout};

use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{
    Block, BorderType, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap,
};
use ratatui::{Frame, Terminal};

use crate::app::{App, StatusLevel};
use crate::output::{sanitize_text, LineKind};
use crate::supervisor::RunState;

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

const HELP_HINT: &str = concat!(
    "s start | x stop | Up/Down select arg | Space toggle | w save | r reload | ",
    "p preview | c copy | o open | l clear | f follow | ? help | q quit"
);

/// Initializes the terminal for TUI mode.
///
/// Enables raw mode, enters the alternate screen, and creates a `ratatui` Terminal instance.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restores the terminal to its original state.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Draws the current application state to the terminal.
pub fn draw(app: &mut App, terminal: &mut TuiTerminal) -> io::Result<()> {
    let title = format!("llamarack · {}", app.run_state.label());
    execute!(terminal.backend_mut(), SetTitle(title))?;
    terminal.draw(|frame| render(app, frame))?;
    Ok(())
}

fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.size();
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(1), Constraint::Length(4)])
        .split(area);
    let main = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(32), Constraint::Percentage(68)])
        .split(vertical[0]);
    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(9), Constraint::Min(3)])
        .split(main[0]);

    let border_style = Style::default().fg(Color::DarkGray);

    let profile = Paragraph::new(profile_lines(app))
        .block(panel("Profile", border_style))
        .wrap(Wrap { trim: false });
    frame.render_widget(profile, left[0]);

    render_custom_args(app, frame, left[1], border_style);

    let log_block = panel(&log_title(app), border_style);
    let log_area = log_block.inner(main[1]);
    app.set_log_view_height(log_area.height as usize);
    let log_lines = visible_log_lines(app, log_area.height as usize, log_area.width as usize);
    frame.render_widget(Paragraph::new(log_lines).block(log_block), main[1]);
    if app.logs.is_empty() {
        let hint = Paragraph::new("No output yet. Press s to start the server.")
            .style(Style::default().fg(Color::DarkGray));
        frame.render_widget(hint, log_area);
    }

    let help_line = match app.status_message() {
        Some((text, StatusLevel::Warning)) => {
            Span::styled(text.to_string(), Style::default().fg(Color::Yellow))
        }
        Some((text, StatusLevel::Info)) => Span::raw(text.to_string()),
        None => Span::styled(HELP_HINT, Style::default().fg(Color::DarkGray)),
    };
    let status = Paragraph::new(Text::from(vec![
        Line::from(Span::styled(app.status_line(), state_style(app.run_state))),
        Line::from(help_line),
    ]))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(border_style),
    );
    frame.render_widget(status, vertical[1]);

    if app.show_preview {
        render_preview(app, frame, area);
    }
    if app.show_help {
        render_help(frame, area);
    }
}

fn panel(title: &str, border_style: Style) -> Block<'static> {
    Block::default()
        .title(title.to_string())
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(border_style)
}

fn profile_lines(app: &App) -> Text<'static> {
    let settings = &app.profile.settings;
    let label = Style::default().fg(Color::DarkGray);
    let model = if settings.model_path.trim().is_empty() {
        Span::styled("(not set)", Style::default().fg(Color::Red))
    } else {
        Span::raw(settings.model_path.clone())
    };
    let reasoning = settings
        .reasoning_effort
        .map(|effort| effort.as_str())
        .unwrap_or("-");
    let field = |name: &'static str, value: String| {
        Line::from(vec![Span::styled(name, label), Span::raw(value)])
    };
    Text::from(vec![
        Line::from(vec![Span::styled("model     ", label), model]),
        field("url       ", app.server_url()),
        field("ctx       ", settings.ctx_size().to_string()),
        field("ngl       ", settings.gpu_layers().to_string()),
        field("flash     ", settings.flash_attn.as_str().to_string()),
        field("reasoning ", reasoning.to_string()),
        field("config    ", app.config_path.display().to_string()),
    ])
}

fn render_custom_args(app: &App, frame: &mut Frame, area: Rect, border_style: Style) {
    let items: Vec<ListItem> = app
        .profile
        .custom_args
        .iter()
        .map(|arg| {
            let (marker, style) = if arg.enabled {
                ("[x] ", Style::default())
            } else {
                ("[ ] ", Style::default().fg(Color::DarkGray))
            };
            ListItem::new(Line::from(vec![
                Span::styled(marker, style),
                Span::styled(arg.value.clone(), style),
            ]))
        })
        .collect();
    let count = items.len();
    let title = format!("Custom arguments ({})", count);
    if count == 0 {
        let empty = Paragraph::new("none; add with `llamarack args add`")
            .style(Style::default().fg(Color::DarkGray))
            .block(panel(&title, border_style));
        frame.render_widget(empty, area);
        return;
    }
    let list = List::new(items)
        .block(panel(&title, border_style))
        .highlight_style(Style::default().add_modifier(Modifier::BOLD).fg(Color::Cyan))
        .highlight_symbol("▶ ");
    let mut state = ListState::default();
    state.select(Some(app.selected_arg.min(count - 1)));
    frame.render_stateful_widget(list, area, &mut state);
}

fn log_title(app: &App) -> String {
    match app.run_state {
        RunState::Running if app.ready => "Server log (ready)".to_string(),
        RunState::Idle => "Server log".to_string(),
        state => format!("Server log ({})", state.label()),
    }
}

fn visible_log_lines(app: &App, height: usize, width: usize) -> Vec<Line<'static>> {
    if height == 0 {
        return Vec::new();
    }
    let total = app.logs.len();
    let start = if app.follow {
        total.saturating_sub(height)
    } else {
        app.scroll.min(total.saturating_sub(height))
    };
    app.logs
        .iter()
        .skip(start)
        .take(height)
        .map(|line| {
            let text = truncate(&sanitize_text(&line.text), width);
            match line.kind {
                LineKind::Server => Line::from(Span::raw(text)),
                LineKind::Notice => {
                    Line::from(Span::styled(text, Style::default().fg(Color::Cyan)))
                }
            }
        })
        .collect()
}

fn render_preview(app: &App, frame: &mut Frame, area: Rect) {
    let popup_area = centered_rect(70, 40, area);
    let (body, style) = match app.command_preview() {
        Ok(preview) => (preview, Style::default().fg(Color::White)),
        Err(err) => (format!("Cannot build command: {}", err), Style::default().fg(Color::Red)),
    };
    let popup = Paragraph::new(body)
        .wrap(Wrap { trim: false })
        .style(style.bg(Color::DarkGray))
        .block(
            Block::default()
                .title("Command (c copy, Esc close)")
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded),
        );
    frame.render_widget(Clear, popup_area);
    frame.render_widget(popup, popup_area);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let popup_area = centered_rect(60, 60, area);
    let help_text = [
        "Server:",
        "  s          Start the server",
        "  x          Stop the server",
        "  o          Open the server in a browser",
        "",
        "Profile:",
        "  Up/Down    Select custom argument",
        "  Space      Enable/disable custom argument",
        "  w          Save profile",
        "  r          Reload profile from disk",
        "  p          Show command preview",
        "  c          Copy command to clipboard",
        "",
        "Log:",
        "  PageUp/Dn  Scroll",
        "  Home/End   Scroll to top/bottom",
        "  f          Toggle auto-follow",
        "  l          Clear",
        "",
        "General:",
        "  ?          Toggle this help",
        "  q          Quit (stops the server)",
    ]
    .join("\n");

    let help_block = Paragraph::new(help_text)
        .block(
            Block::default()
                .title("Help")
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded),
        )
        .style(Style::default().bg(Color::DarkGray).fg(Color::White));
    frame.render_widget(Clear, popup_area);
    frame.render_widget(help_block, popup_area);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn state_style(state: RunState) -> Style {
    match state {
        RunState::Idle => Style::default().fg(Color::Gray),
        RunState::Starting | RunState::Stopping => Style::default().fg(Color::Yellow),
        RunState::Running => Style::default().fg(Color::Green),
        RunState::Stopped => Style::default().fg(Color::Red),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('~');
    out
}
