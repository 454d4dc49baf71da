//! Terminal UI for driving and watching an analysis session.
//!
//! The TUI runs on a dedicated thread so all blocking terminal I/O stays out
//! of the Tokio runtime; the driver runs on the runtime and the two sides talk
//! over unbounded channels only.

use crate::api::SessionClient;
use crate::cli::{build_config, Cli};
use crate::driver::{self, UiCommand};
use crate::model::SessionEvent;
use crate::render::{project, RenderModel};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Terminal,
};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputMode {
    Normal,
    EditTask,
    EditPrompt,
}

struct UiState {
    model: RenderModel,
    task_input: String,
    prompt_input: String,
    mode: InputMode,
    info: String,
    starting: bool,
    started: bool,
    complete: bool,
    selected: usize,
    detail_scroll: u16,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            model: RenderModel::default(),
            task_input: String::new(),
            prompt_input: String::new(),
            mode: InputMode::Normal,
            info: String::new(),
            starting: false,
            started: false,
            complete: false,
            selected: 0,
            detail_scroll: 0,
        }
    }
}

pub async fn run(args: Cli) -> Result<()> {
    // Unbounded channels avoid backpressure between the UI thread and driver.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let cfg = build_config(&args);
    let client = SessionClient::new(&cfg).context("failed to build HTTP client")?;

    if let Some(task) = args.task.clone() {
        let _ = cmd_tx.send(UiCommand::Start(task));
    }

    // TUI runs in a dedicated thread to keep all blocking I/O out of the
    // Tokio runtime.
    let ui_args = args.clone();
    let ui_handle = std::thread::spawn(move || run_threaded(ui_args, event_rx, cmd_tx));

    let res = driver::run_driver(client, cfg, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    args: Cli,
    mut event_rx: UnboundedReceiver<SessionEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let mut state = UiState::default();
    match args.task {
        Some(task) => {
            state.task_input = task;
            state.starting = true;
            state.info = "Starting session…".into();
        }
        None => {
            state.mode = InputMode::EditTask;
            state.info = "Type the analysis task, then press Enter to start".into();
        }
    }

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep the UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            apply_event(&mut state, ev);
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if k.modifiers == KeyModifiers::CONTROL && k.code == KeyCode::Char('c') {
                    let _ = cmd_tx.send(UiCommand::Quit);
                    break Ok(());
                }
                match state.mode {
                    InputMode::EditTask => handle_task_input(&mut state, &cmd_tx, k.code),
                    InputMode::EditPrompt => handle_prompt_input(&mut state, &cmd_tx, k.code),
                    InputMode::Normal => {
                        if !handle_normal_key(&mut state, &cmd_tx, k.code) {
                            break Ok(());
                        }
                    }
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn handle_task_input(state: &mut UiState, cmd_tx: &UnboundedSender<UiCommand>, code: KeyCode) {
    match code {
        KeyCode::Enter => {
            if state.task_input.trim().is_empty() {
                state.info = "Task text is empty".into();
            } else {
                state.starting = true;
                state.info = "Starting session…".into();
                let _ = cmd_tx.send(UiCommand::Start(state.task_input.clone()));
                state.mode = InputMode::Normal;
            }
        }
        KeyCode::Esc => {
            state.mode = InputMode::Normal;
        }
        KeyCode::Backspace => {
            state.task_input.pop();
        }
        KeyCode::Char(c) => {
            state.task_input.push(c);
        }
        _ => {}
    }
}

fn handle_prompt_input(state: &mut UiState, cmd_tx: &UnboundedSender<UiCommand>, code: KeyCode) {
    match code {
        KeyCode::Enter => {
            if state.prompt_input.trim().is_empty() {
                state.info = "Prompt text is empty".into();
            } else {
                state.info = "Updating system prompt…".into();
                let _ = cmd_tx.send(UiCommand::UpdatePrompt(state.prompt_input.clone()));
                state.prompt_input.clear();
                state.mode = InputMode::Normal;
            }
        }
        KeyCode::Esc => {
            state.prompt_input.clear();
            state.mode = InputMode::Normal;
        }
        KeyCode::Backspace => {
            state.prompt_input.pop();
        }
        KeyCode::Char(c) => {
            state.prompt_input.push(c);
        }
        _ => {}
    }
}

/// Returns false when the UI should quit.
fn handle_normal_key(
    state: &mut UiState,
    cmd_tx: &UnboundedSender<UiCommand>,
    code: KeyCode,
) -> bool {
    match code {
        KeyCode::Char('q') => {
            let _ = cmd_tx.send(UiCommand::Quit);
            return false;
        }
        KeyCode::Char('e') => {
            if !state.started && !state.starting {
                state.mode = InputMode::EditTask;
            }
        }
        KeyCode::Char('s') | KeyCode::Enter => {
            if !state.started && !state.starting {
                if state.task_input.trim().is_empty() {
                    state.info = "No task text; press 'e' to edit".into();
                } else {
                    state.starting = true;
                    state.info = "Starting session…".into();
                    let _ = cmd_tx.send(UiCommand::Start(state.task_input.clone()));
                }
            }
        }
        KeyCode::Char('p') => {
            if state.started {
                state.mode = InputMode::EditPrompt;
            }
        }
        KeyCode::Up | KeyCode::Char('k') => {
            if state.selected > 0 {
                state.selected -= 1;
                state.detail_scroll = 0;
            }
        }
        KeyCode::Down | KeyCode::Char('j') => {
            if state.selected + 1 < state.model.entries.len() {
                state.selected += 1;
                state.detail_scroll = 0;
            }
        }
        KeyCode::Home => {
            state.selected = 0;
            state.detail_scroll = 0;
        }
        KeyCode::End => {
            state.selected = state.model.entries.len().saturating_sub(1);
            state.detail_scroll = 0;
        }
        KeyCode::PageUp => {
            state.detail_scroll = state.detail_scroll.saturating_sub(10);
        }
        KeyCode::PageDown => {
            state.detail_scroll = state.detail_scroll.saturating_add(10);
        }
        _ => {}
    }
    true
}

fn apply_event(state: &mut UiState, ev: SessionEvent) {
    match ev {
        SessionEvent::SessionStarted { session_id } => {
            state.starting = false;
            state.started = true;
            state.info = format!("Session {session_id} started");
        }
        SessionEvent::StartFailed { error } => {
            state.starting = false;
            state.info = format!("Start failed: {error}");
        }
        SessionEvent::Snapshot(snapshot) => {
            let was_on_last = state.selected + 1 >= state.model.entries.len();
            state.model = project(Some(&snapshot));
            let len = state.model.entries.len();
            if len == 0 {
                state.selected = 0;
            } else if was_on_last || state.selected >= len {
                // Follow the tail unless the user scrolled back.
                state.selected = len - 1;
            }
        }
        SessionEvent::PollFailed { error } => {
            state.info = format!("Status poll failed (will retry): {error}");
        }
        SessionEvent::IterationFailed { error } => {
            state.info = format!("Iteration failed (loop continues): {error}");
        }
        SessionEvent::SessionComplete { session_id } => {
            state.complete = true;
            state.info = format!("Session {session_id} reported a terminal status");
        }
        SessionEvent::Info(msg) => {
            state.info = msg;
        }
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6),
            Constraint::Min(5),
            Constraint::Length(1),
        ])
        .split(area);

    draw_header(rows[0], f, state);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(rows[1]);
    draw_iteration_list(body[0], f, state);
    draw_detail(body[1], f, state);

    draw_footer(rows[2], f, state);
}

fn draw_header(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let label = Style::default().fg(Color::Gray);
    let mut lines: Vec<Line> = Vec::new();

    let session = state.model.session_id.as_deref().unwrap_or("-");
    let status = state.model.status.as_deref().unwrap_or(if state.starting {
        "starting…"
    } else {
        "no session"
    });
    lines.push(Line::from(vec![
        Span::styled("Session: ", label),
        Span::raw(session.to_string()),
        Span::raw("   "),
        Span::styled("Status: ", label),
        Span::styled(
            status.to_string(),
            if state.complete {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            },
        ),
    ]));

    match state.mode {
        InputMode::EditTask => {
            lines.push(Line::from(vec![
                Span::styled("Task: ", label),
                Span::raw(state.task_input.clone()),
                Span::styled("█", Style::default().add_modifier(Modifier::SLOW_BLINK)),
            ]));
        }
        InputMode::EditPrompt => {
            lines.push(Line::from(vec![
                Span::styled("New prompt: ", label),
                Span::raw(state.prompt_input.clone()),
                Span::styled("█", Style::default().add_modifier(Modifier::SLOW_BLINK)),
            ]));
        }
        InputMode::Normal => {
            lines.push(Line::from(vec![
                Span::styled("Task: ", label),
                Span::raw(state.task_input.clone()),
            ]));
        }
    }

    if !state.info.is_empty() {
        lines.push(Line::from(vec![
            Span::styled("Info: ", label),
            Span::raw(state.info.clone()),
        ]));
    }

    let block = Block::default().borders(Borders::ALL).title("Analysis");
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_iteration_list(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let entries = &state.model.entries;
    let visible = area.height.saturating_sub(2).max(1) as usize;
    // Keep the selected entry in view without tracking a scroll offset.
    let offset = state
        .selected
        .saturating_sub(visible / 2)
        .min(entries.len().saturating_sub(visible));

    let lines: Vec<Line> = entries
        .iter()
        .enumerate()
        .skip(offset)
        .take(visible)
        .map(|(i, e)| {
            let marker = if i == state.selected { "> " } else { "  " };
            let style = if i == state.selected {
                Style::default().add_modifier(Modifier::REVERSED)
            } else {
                Style::default()
            };
            Line::from(Span::styled(
                format!("{marker}{}  {}", e.timestamp, e.kind),
                style,
            ))
        })
        .collect();

    let title = format!("Iterations ({})", entries.len());
    let block = Block::default().borders(Borders::ALL).title(title);
    if lines.is_empty() {
        let placeholder = Paragraph::new("No iterations yet")
            .style(Style::default().fg(Color::DarkGray))
            .block(block);
        f.render_widget(placeholder, area);
    } else {
        f.render_widget(Paragraph::new(lines).block(block), area);
    }
}

fn draw_detail(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let (title, content) = match state.model.entries.get(state.selected) {
        Some(e) => (format!("{}  {}", e.timestamp, e.kind), e.content.as_str()),
        None => ("Detail".to_string(), ""),
    };
    let block = Block::default().borders(Borders::ALL).title(title);
    let paragraph = Paragraph::new(content)
        .wrap(Wrap { trim: false })
        .scroll((state.detail_scroll, 0))
        .block(block);
    f.render_widget(paragraph, area);
}

fn draw_footer(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let hint = match state.mode {
        InputMode::EditTask | InputMode::EditPrompt => "Enter confirm · Esc cancel · Ctrl-C quit",
        InputMode::Normal if !state.started => "e edit task · s start · q quit",
        InputMode::Normal => "↑/↓ select · PgUp/PgDn scroll · p update prompt · q quit",
    };
    let line = Paragraph::new(hint).style(Style::default().fg(Color::DarkGray));
    f.render_widget(line, area);
}
