//! The interactive terminal UI.
//!
//! A thin consumer of the supervisor facade: it re-reads the service
//! snapshot whenever an event arrives (or on the next tick) and issues
//! control calls for key presses. All orchestration state stays in the
//! supervisor.

use crate::supervisor::{Event, ProcessHandle, ProxyHandle, ServiceView, Supervisor};
use anyhow::{Context, Result};
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const TICK_RATE: Duration = Duration::from_millis(250);

/// Run the UI until the user quits. Blocking; call from a dedicated
/// blocking task with the runtime handle for control calls.
pub fn run<P: ProcessHandle, X: ProxyHandle>(
    supervisor: Arc<Supervisor<P, X>>,
    events: mpsc::Receiver<Event>,
    runtime: tokio::runtime::Handle,
) -> Result<()> {
    enable_raw_mode().context("entering raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("entering the alternate screen")?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("initializing the terminal backend")?;

    let result = run_app(&mut terminal, App::new(supervisor, events, runtime));

    // Whatever happened, hand the terminal back in a usable state.
    disable_raw_mode().ok();
    let _ = terminal.show_cursor();
    drop(terminal);
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();

    result
}

struct App<P, X> {
    supervisor: Arc<Supervisor<P, X>>,
    events: mpsc::Receiver<Event>,
    runtime: tokio::runtime::Handle,
    services: Vec<ServiceView>,
    selected: usize,
    logs: Vec<String>,
    show_logs: bool,
    show_help: bool,
    status: String,
}

impl<P: ProcessHandle, X: ProxyHandle> App<P, X> {
    fn new(
        supervisor: Arc<Supervisor<P, X>>,
        events: mpsc::Receiver<Event>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let mut app = Self {
            supervisor,
            events,
            runtime,
            services: Vec::new(),
            selected: 0,
            logs: Vec::new(),
            show_logs: false,
            show_help: false,
            status: String::new(),
        };
        app.refresh();
        app
    }

    fn selected_service(&self) -> Option<&ServiceView> {
        self.services.get(self.selected)
    }

    fn refresh(&mut self) {
        self.services = self.supervisor.services();
        if self.selected >= self.services.len() {
            self.selected = self.services.len().saturating_sub(1);
        }
        if self.show_logs
            && let Some(name) = self.selected_service().map(|s| s.name.clone())
        {
            self.logs = self.supervisor.logs(&name);
        }
    }

    /// Drain pending notifications; any of them invalidates the snapshot.
    fn drain_events(&mut self) -> bool {
        let mut dirty = false;
        while self.events.try_recv().is_ok() {
            dirty = true;
        }
        dirty
    }

    fn control<T>(
        &mut self,
        action: impl Future<Output = Result<T>>,
        verb: &str,
        service: &str,
    ) {
        match self.runtime.block_on(action) {
            Ok(_) => self.status = format!("{verb} {service}"),
            Err(err) => self.status = format!("{verb} {service} failed: {err:#}"),
        }
    }
}

fn run_app<B: ratatui::backend::Backend, P: ProcessHandle, X: ProxyHandle>(
    terminal: &mut Terminal<B>,
    mut app: App<P, X>,
) -> Result<()> {
    loop {
        terminal
            .draw(|frame| draw_ui(frame, &app))
            .context("drawing the next frame")?;

        if event::poll(TICK_RATE)? {
            if let CEvent::Key(key) = event::read()? {
                if handle_key(&mut app, key) {
                    break;
                }
            }
        }

        app.drain_events();
        app.refresh();
    }

    Ok(())
}

/// Returns true when the app should exit.
fn handle_key<P: ProcessHandle, X: ProxyHandle>(app: &mut App<P, X>, key: KeyEvent) -> bool {
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        return true;
    }

    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => return true,
        KeyCode::Down | KeyCode::Char('j') => {
            if app.selected + 1 < app.services.len() {
                app.selected += 1;
            }
        }
        KeyCode::Up | KeyCode::Char('k') => {
            app.selected = app.selected.saturating_sub(1);
        }
        KeyCode::Char('s') => {
            if let Some(name) = app.selected_service().map(|s| s.name.clone()) {
                let supervisor = app.supervisor.clone();
                app.control(supervisor.start_service(&name), "started", &name);
            }
        }
        KeyCode::Char('x') => {
            if let Some(name) = app.selected_service().map(|s| s.name.clone()) {
                let supervisor = app.supervisor.clone();
                app.control(supervisor.stop_service(&name), "stopped", &name);
            }
        }
        KeyCode::Char('r') => {
            if let Some(name) = app.selected_service().map(|s| s.name.clone()) {
                let supervisor = app.supervisor.clone();
                app.control(supervisor.restart_service(&name), "restarted", &name);
            }
        }
        KeyCode::Char('p') => {
            if let Some(name) = app.selected_service().map(|s| s.name.clone()) {
                match app.supervisor.toggle_proxy(&name) {
                    Ok(true) => app.status = format!("{name}: proxy local"),
                    Ok(false) => app.status = format!("{name}: proxy remote"),
                    Err(err) => app.status = format!("toggle {name} failed: {err:#}"),
                }
            }
        }
        KeyCode::Char('l') => {
            app.show_logs = !app.show_logs;
        }
        KeyCode::Char('?') => {
            app.show_help = !app.show_help;
        }
        _ => {}
    }

    false
}

fn draw_ui<P: ProcessHandle, X: ProxyHandle>(frame: &mut ratatui::Frame<'_>, app: &App<P, X>) {
    let area = frame.area();

    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(area);

    let panes = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(if app.show_logs {
            [Constraint::Percentage(40), Constraint::Percentage(60)]
        } else {
            [Constraint::Percentage(100), Constraint::Percentage(0)]
        })
        .split(layout[0]);

    let items: Vec<ListItem> = if app.services.is_empty() {
        vec![ListItem::new("No services configured")]
    } else {
        app.services.iter().map(service_item).collect()
    };

    let mut list_state = ListState::default();
    if !app.services.is_empty() {
        list_state.select(Some(app.selected));
    }

    let title = format!("{} - services", app.supervisor.project_name());
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol("▶ ");
    frame.render_stateful_widget(list, panes[0], &mut list_state);

    if app.show_logs {
        let lines: Vec<Line> = if app.logs.is_empty() {
            vec![Line::from(Span::raw("No output yet"))]
        } else {
            let height = panes[1].height.saturating_sub(2) as usize;
            let skip = app.logs.len().saturating_sub(height);
            app.logs[skip..]
                .iter()
                .map(|line| Line::from(Span::raw(line.as_str())))
                .collect()
        };
        let name = app
            .selected_service()
            .map(|s| s.name.as_str())
            .unwrap_or("-");
        let logs = Paragraph::new(lines)
            .block(Block::default().borders(Borders::ALL).title(format!("logs: {name}")));
        frame.render_widget(logs, panes[1]);
    }

    let help = if app.show_help {
        "j/k select • s start • x stop • r restart • p toggle local/remote • l logs • ? help • q quit"
    } else {
        "? help • q quit"
    };
    let footer = Paragraph::new(Line::from(vec![
        Span::styled(
            if app.status.is_empty() {
                "ready"
            } else {
                app.status.as_str()
            },
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw("  |  "),
        Span::raw(help),
    ]))
    .block(Block::default().borders(Borders::ALL))
    .wrap(Wrap { trim: true });
    frame.render_widget(footer, layout[1]);
}

fn service_item(service: &ServiceView) -> ListItem<'_> {
    let (marker, style) = if !service.running {
        ("○", Style::default().fg(Color::DarkGray))
    } else if service.healthy {
        ("●", Style::default().fg(Color::Green))
    } else {
        ("●", Style::default().fg(Color::Yellow))
    };

    let mut spans = vec![
        Span::styled(marker, style),
        Span::raw(" "),
        Span::raw(service.name.clone()),
    ];

    if let Some(domain) = &service.domain {
        let mode = match service.proxy_enabled {
            Some(true) => "local",
            Some(false) => "remote",
            None => "-",
        };
        spans.push(Span::styled(
            format!("  https://{domain} [{mode}]"),
            Style::default().fg(Color::Cyan),
        ));
    } else if let Some(port) = service.port {
        spans.push(Span::styled(
            format!("  :{port}"),
            Style::default().fg(Color::DarkGray),
        ));
    }

    ListItem::new(Line::from(spans))
}
