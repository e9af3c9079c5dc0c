use crate::archive::{Direction as ArchiveDirection, LocalArchive};
use crate::backend::{EventSink, MediaBackend, PlaybackBackend};
use crate::credentials::{UrlCredentialCodec, is_url_local};
use crate::gesture::{GestureEvent, GestureKind, GestureOutcome, GesturePipeline, TapDimmer, ZoomPan};
use crate::layout::{DEFAULT_ASPECT_RATIO, GridLayout, Letterbox, compute_layout, terminal_units};
use crate::network::{
    ConnectivitySource, InterfaceConnectivity, NetworkMonitor, NetworkSubscription,
};
use crate::prefs::{SharedPreferences, ViewerPreferences};
use crate::session::{
    ArchiveStep, Envelope, PlaybackMode, PlaybackRate, PlaybackSession, PlaybackState,
    SessionError, SessionId, SessionView,
};
use crate::store::{self, StreamConfig};
use anyhow::{Context, Result};
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, MouseButton,
    MouseEvent, MouseEventKind,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PROBE_INTERVAL: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const SEEK_STEP_MS: i64 = 10_000;

pub struct ViewerHost<B: PlaybackBackend> {
    sessions: Vec<PlaybackSession<B>>,
    prefs: SharedPreferences,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    subscriptions: Vec<NetworkSubscription>,
}

impl<B: PlaybackBackend> ViewerHost<B> {
    #[must_use]
    pub fn new(prefs: SharedPreferences) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sessions: Vec::new(),
            prefs,
            tx,
            rx,
            subscriptions: Vec::new(),
        }
    }

    #[must_use]
    pub fn preferences(&self) -> ViewerPreferences {
        self.prefs.get()
    }

    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.tx.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Registers a session built by `build`, which receives the id and the
    /// event sink its backend should report through.
    pub fn add(&mut self, build: impl FnOnce(SessionId, EventSink) -> PlaybackSession<B>) -> SessionId {
        let id = SessionId(self.sessions.len());
        let session = build(id, EventSink::new(id, self.tx.clone()));
        self.sessions.push(session);
        id
    }

    /// Forwards connectivity changes for the session's camera into the queue.
    pub fn watch_network(&mut self, id: SessionId, monitor: &NetworkMonitor) -> Result<(), SessionError> {
        let session = self.session(id)?;
        let local = is_url_local(&session.stream().primary_url);
        let subscription = monitor.observe(local).forward(id, self.tx.clone());
        self.subscriptions.push(subscription);
        Ok(())
    }

    pub fn session(&self, id: SessionId) -> Result<&PlaybackSession<B>, SessionError> {
        self.sessions
            .get(id.0)
            .ok_or(SessionError::UnknownSession(id))
    }

    pub fn session_mut(&mut self, id: SessionId) -> Result<&mut PlaybackSession<B>, SessionError> {
        self.sessions
            .get_mut(id.0)
            .ok_or(SessionError::UnknownSession(id))
    }

    /// Opens every idle session. Failures are logged and returned; the other
    /// sessions still open.
    pub fn open_all(&mut self, mode: &PlaybackMode) -> Vec<(SessionId, SessionError)> {
        let mut failures = Vec::new();
        for session in &mut self.sessions {
            if session.state() != PlaybackState::Idle {
                continue;
            }
            if let Err(err) = session.open(mode.clone()) {
                warn!(session = %session.id(), error = %err, "failed to open session");
                failures.push((session.id(), err));
            }
        }
        failures
    }

    #[must_use]
    pub fn views(&self) -> Vec<SessionView> {
        self.sessions.iter().map(PlaybackSession::view).collect()
    }

    pub fn dispatch(&mut self, envelope: Envelope) {
        match self.sessions.get_mut(envelope.session.0) {
            Some(session) => session.handle_event(envelope.event),
            None => debug!(session = %envelope.session, "event for unknown session"),
        }
    }

    /// Applies every queued event without waiting. Returns how many ran.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            self.dispatch(envelope);
            handled += 1;
        }
        handled
    }

    /// Waits for one event and applies it.
    pub async fn process_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(envelope) => {
                self.dispatch(envelope);
                true
            }
            None => false,
        }
    }

    pub fn toggle_play_pause(&mut self, id: SessionId) -> Result<PlaybackState, SessionError> {
        self.session_mut(id)?.toggle_play_pause()
    }

    pub fn toggle_mute(&mut self, id: SessionId) -> Result<bool, SessionError> {
        let muted = self.session_mut(id)?.toggle_mute()?;
        self.sync_preferences();
        Ok(muted)
    }

    pub fn switch_channel(&mut self, id: SessionId) -> Result<(), SessionError> {
        self.session_mut(id)?.switch_channel()?;
        self.sync_preferences();
        Ok(())
    }

    pub fn toggle_rate(&mut self, id: SessionId) -> Result<PlaybackRate, SessionError> {
        self.session_mut(id)?.toggle_rate()
    }

    pub fn seek(&mut self, id: SessionId, offset_ms: i64) -> Result<(), SessionError> {
        self.session_mut(id)?.seek(offset_ms)
    }

    pub fn navigate_archive(
        &mut self,
        id: SessionId,
        direction: ArchiveDirection,
    ) -> Result<ArchiveStep, SessionError> {
        self.session_mut(id)?.navigate_archive(direction)
    }

    fn sync_preferences(&mut self) {
        let mut synced = 0;
        for session in &mut self.sessions {
            if session.sync_preferences() {
                synced += 1;
            }
        }
        debug!(synced, "preferences fanned out");
    }

    pub fn on_tap(&mut self, id: SessionId) -> Result<(), SessionError> {
        self.session_mut(id)?.on_tap();
        Ok(())
    }

    pub fn on_layout_changed(&mut self, letterbox: Letterbox) {
        for session in &mut self.sessions {
            session.on_layout_changed(letterbox);
        }
    }

    /// Runs chrome deadlines. Returns whether anything changed on screen.
    pub fn tick(&mut self, now: Instant) -> bool {
        self.sessions
            .iter_mut()
            .fold(false, |changed, session| session.tick(now) || changed)
    }

    /// Stops network delivery and releases every backend.
    pub fn close_all(&mut self) {
        self.subscriptions.clear();
        for session in &mut self.sessions {
            session.close();
        }
        while self.rx.try_recv().is_ok() {}
    }
}

impl<B: PlaybackBackend> Drop for ViewerHost<B> {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[derive(Debug, Clone)]
pub struct GridOptions {
    pub title: String,
    pub refresh_fps: u16,
    pub start: PlaybackMode,
}

/// Opens every stream in `options.start` mode and runs the terminal grid
/// until the user quits.
pub async fn run_grid(
    streams: Vec<StreamConfig>,
    codec: &UrlCredentialCodec,
    prefs: SharedPreferences,
    options: &GridOptions,
) -> Result<()> {
    let probe_addr = InterfaceConnectivity::DEFAULT_PROBE
        .parse::<SocketAddr>()
        .context("invalid connectivity probe address")?;
    let connectivity: Arc<dyn ConnectivitySource> = Arc::new(InterfaceConnectivity::new(
        probe_addr,
        PROBE_INTERVAL,
        PROBE_TIMEOUT,
    ));
    let monitor = NetworkMonitor::new(connectivity);

    let mut host = ViewerHost::<MediaBackend>::new(prefs.clone());
    for stream in streams {
        let archive = stream
            .archive_url
            .as_deref()
            .and_then(|url| match LocalArchive::from_url(&codec.decode_for_connection(url)) {
                Ok(archive) => Some(archive),
                Err(err) => {
                    warn!(stream = %stream.name, error = %err, "archive unavailable");
                    None
                }
            });
        let transport = stream.transport;
        let id = host.add(|id, sink| {
            let session = PlaybackSession::create(
                id,
                stream,
                MediaBackend::new(transport, sink),
                codec.clone(),
                prefs.clone(),
            );
            match archive {
                Some(archive) => session.with_archive(Box::new(archive)),
                None => session,
            }
        });
        host.watch_network(id, &monitor)?;
    }
    host.open_all(&options.start);
    info!(title = %options.title, sessions = host.len(), "grid started");

    enable_raw_mode().context("failed to enable terminal raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)
        .context("failed to enter alternate screen")?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal backend")?;

    let render_result = render_loop(&mut terminal, &mut host, options).await;

    host.close_all();

    disable_raw_mode().context("failed to disable terminal raw mode")?;
    execute!(
        terminal.backend_mut(),
        DisableMouseCapture,
        LeaveAlternateScreen
    )
    .context("failed to leave alternate screen")?;
    terminal
        .show_cursor()
        .context("failed to restore terminal cursor")?;

    render_result
}

struct GridUi {
    focus: usize,
    solo: Option<usize>,
    pipeline: GesturePipeline,
    dimmer: TapDimmer,
    drag_origin: Option<(u16, u16)>,
    cells: Vec<(usize, Rect)>,
    grid_area: Option<(Rect, usize)>,
    relayout: Option<Letterbox>,
    status: Option<String>,
    saved_prefs: ViewerPreferences,
    running: bool,
}

impl GridUi {
    fn new(saved_prefs: ViewerPreferences) -> Self {
        Self {
            focus: 0,
            solo: None,
            pipeline: GesturePipeline::new(ZoomPan::new(1.0, 1.0)),
            dimmer: TapDimmer::default(),
            drag_origin: None,
            cells: Vec::new(),
            grid_area: None,
            relayout: None,
            status: None,
            saved_prefs,
            running: true,
        }
    }

    fn visible(&self, total: usize) -> Vec<usize> {
        match self.solo {
            Some(idx) if idx < total => vec![idx],
            _ => (0..total).collect(),
        }
    }

    fn cell_at(&self, column: u16, row: u16) -> Option<usize> {
        self.cells
            .iter()
            .find(|(_, rect)| {
                column >= rect.x
                    && column < rect.x + rect.width
                    && row >= rect.y
                    && row < rect.y + rect.height
            })
            .map(|(idx, _)| *idx)
    }

    fn report<T>(&mut self, result: Result<T, SessionError>) {
        self.status = result.err().map(|err| err.to_string());
    }

    fn report_step(&mut self, result: Result<ArchiveStep, SessionError>) {
        self.status = match result {
            Ok(ArchiveStep::AtOldest) => Some("already at the oldest recording".to_owned()),
            Ok(ArchiveStep::ReturnedToLive) => Some("no newer recording; back to live".to_owned()),
            Ok(ArchiveStep::Opened(_)) => None,
            Err(err) => Some(err.to_string()),
        };
    }
}

async fn render_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    host: &mut ViewerHost<MediaBackend>,
    options: &GridOptions,
) -> Result<()> {
    let frame_delay = Duration::from_millis(1_000_u64 / u64::from(options.refresh_fps.max(1)));
    let mut ui = GridUi::new(host.preferences());

    while ui.running {
        host.drain();
        let now = Instant::now();
        host.tick(now);
        let views = host.views();

        terminal
            .draw(|frame| draw_grid(frame, &mut ui, &views, &options.title, now))
            .context("terminal draw failed")?;

        if let Some(letterbox) = ui.relayout.take() {
            host.on_layout_changed(letterbox);
            ui.pipeline.reset();
        }

        if event::poll(Duration::from_millis(5)).context("event poll failed")? {
            match event::read().context("event read failed")? {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    handle_key(key.code, &mut ui, host);
                }
                Event::Mouse(mouse) => handle_mouse(mouse, &mut ui, host),
                _ => {}
            }
        }

        persist_preferences(&mut ui, host.preferences());
        tokio::time::sleep(frame_delay).await;
    }

    Ok(())
}

fn handle_key(code: KeyCode, ui: &mut GridUi, host: &mut ViewerHost<MediaBackend>) {
    let total = host.len();
    if total == 0 {
        ui.running = !matches!(code, KeyCode::Char('q') | KeyCode::Esc);
        return;
    }
    let focused = SessionId(ui.focus.min(total - 1));

    match code {
        KeyCode::Char('q') | KeyCode::Esc => ui.running = false,
        KeyCode::Char(' ') => {
            let result = host.toggle_play_pause(focused);
            ui.report(result);
        }
        KeyCode::Char('m') => {
            let result = host.toggle_mute(focused);
            ui.report(result);
        }
        KeyCode::Char('c') => {
            let result = host.switch_channel(focused);
            ui.report(result);
        }
        KeyCode::Char('f') => {
            let result = host.toggle_rate(focused);
            ui.report(result);
        }
        KeyCode::Left | KeyCode::Right => {
            let offset = if code == KeyCode::Left { -SEEK_STEP_MS } else { SEEK_STEP_MS };
            let result = host.seek(focused, offset);
            ui.report(result);
        }
        KeyCode::Char('[') => {
            let result = host.navigate_archive(focused, ArchiveDirection::Prev);
            ui.report_step(result);
        }
        KeyCode::Char(']') => {
            let result = host.navigate_archive(focused, ArchiveDirection::Next);
            ui.report_step(result);
        }
        KeyCode::Char('+') => zoom(ui, 1.25),
        KeyCode::Char('-') => zoom(ui, 0.8),
        KeyCode::Char('0') => {
            ui.pipeline
                .on_gesture(&GestureEvent::single(GestureKind::DoubleTap, 0.0, 0.0));
        }
        KeyCode::Tab => {
            ui.focus = match ui.solo {
                Some(_) => ui.focus,
                None => (ui.focus + 1) % total,
            };
        }
        KeyCode::Enter => {
            ui.solo = match ui.solo {
                Some(_) => None,
                None => Some(focused.0),
            };
        }
        _ => {}
    }
}

fn zoom(ui: &mut GridUi, factor: f32) {
    ui.pipeline
        .on_gesture(&GestureEvent::single(GestureKind::Zoom { factor }, 0.0, 0.0));
}

fn handle_mouse(mouse: MouseEvent, ui: &mut GridUi, host: &mut ViewerHost<MediaBackend>) {
    let (x, y) = (f32::from(mouse.column), f32::from(mouse.row));
    let kind = match mouse.kind {
        MouseEventKind::Down(MouseButton::Left) => {
            ui.drag_origin = Some((mouse.column, mouse.row));
            GestureKind::Down
        }
        MouseEventKind::Drag(MouseButton::Left) => {
            let (from_x, from_y) = ui.drag_origin.unwrap_or((mouse.column, mouse.row));
            ui.drag_origin = Some((mouse.column, mouse.row));
            GestureKind::Pan {
                dx: x - f32::from(from_x),
                dy: y - f32::from(from_y),
            }
        }
        MouseEventKind::Up(MouseButton::Left) => {
            ui.drag_origin = None;
            GestureKind::Up
        }
        MouseEventKind::ScrollUp => GestureKind::Zoom { factor: 1.25 },
        MouseEventKind::ScrollDown => GestureKind::Zoom { factor: 0.8 },
        _ => return,
    };

    let outcome = ui.pipeline.on_gesture(&GestureEvent::single(kind, x, y));
    if outcome != GestureOutcome::Tap {
        return;
    }
    if let Some(idx) = ui.cell_at(mouse.column, mouse.row) {
        ui.focus = idx;
        ui.dimmer.dim(idx, Instant::now());
        let result = host.on_tap(SessionId(idx));
        ui.report(result);
    }
}

fn persist_preferences(ui: &mut GridUi, current: ViewerPreferences) {
    if current == ui.saved_prefs {
        return;
    }
    match store::save_preferences(current) {
        Ok(()) => ui.saved_prefs = current,
        Err(err) => {
            warn!("failed saving preferences: {err:#}");
            ui.saved_prefs = current;
        }
    }
}

fn draw_grid(
    frame: &mut ratatui::Frame<'_>,
    ui: &mut GridUi,
    views: &[SessionView],
    title: &str,
    now: Instant,
) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(1), Constraint::Length(1)])
        .split(frame.area());
    let grid_area = chunks[0];
    let footer_area = chunks[1];

    let visible = ui.visible(views.len());
    let (width, height) = terminal_units(grid_area.width, grid_area.height);
    let layout = compute_layout(width, height, visible.len(), DEFAULT_ASPECT_RATIO);

    if ui.grid_area != Some((grid_area, visible.len())) {
        ui.grid_area = Some((grid_area, visible.len()));
        ui.relayout = Some(layout.letterbox);
        ui.pipeline
            .zoom_mut()
            .set_bounds(f32::from(grid_area.width), f32::from(grid_area.height));
    }

    ui.cells = terminal_cells(&layout, grid_area)
        .into_iter()
        .zip(visible.iter().copied())
        .map(|(rect, idx)| (idx, rect))
        .collect();

    for (idx, rect) in &ui.cells {
        let Some(view) = views.get(*idx) else {
            continue;
        };
        let focused = *idx == ui.focus;
        let border = if ui.dimmer.is_dimmed(*idx, now) {
            Style::default().fg(Color::DarkGray)
        } else if focused {
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };
        let block = Block::default()
            .title(format!("{} | {}", idx + 1, view.name))
            .borders(Borders::ALL)
            .border_style(border);
        frame.render_widget(Paragraph::new(cell_lines(view)).block(block), *rect);
    }

    let footer = footer_line(title, ui.pipeline.zoom().scale(), ui.status.as_deref());
    frame.render_widget(Paragraph::new(footer), footer_area);
}

fn footer_line(title: &str, zoom: f32, status: Option<&str>) -> String {
    let mut footer = format!(
        "{title} | q quit | space pause | m mute | c channel | f fast | \u{2190}/\u{2192} seek | [/] prev/next | +/-/0 zoom {zoom:.1}x | tab focus | enter solo"
    );
    if let Some(status) = status {
        footer.push_str(" | ");
        footer.push_str(status);
    }
    footer
}

fn terminal_cells(layout: &GridLayout, area: Rect) -> Vec<Rect> {
    layout
        .cells
        .iter()
        .map(|cell| {
            let cell = cell.to_terminal();
            Rect::new(
                area.x.saturating_add(to_u16(cell.x)),
                area.y.saturating_add(to_u16(cell.y)),
                to_u16(cell.width),
                to_u16(cell.height),
            )
            .intersection(area)
        })
        .collect()
}

fn to_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

fn cell_lines(view: &SessionView) -> Vec<Line<'static>> {
    let mut state = format!("{:?}", view.state);
    if view.loading {
        state.push_str(" ...");
    }
    let state_style = match view.state {
        PlaybackState::Playing => Style::default().fg(Color::Green),
        PlaybackState::Error => Style::default().fg(Color::Red),
        PlaybackState::Reconnecting | PlaybackState::Disconnected => {
            Style::default().fg(Color::Yellow)
        }
        _ => Style::default(),
    };
    let mut lines = vec![Line::from(Span::styled(state, state_style))];

    if let Some(alert) = view.alert {
        lines.push(Line::from(Span::styled(
            alert.message(),
            Style::default().fg(Color::Yellow),
        )));
    }
    if view.state == PlaybackState::Error {
        lines.push(Line::from("stream failed; restart the viewer to retry"));
    }

    if view.chrome_visible {
        let mut indicators = vec![match &view.mode {
            PlaybackMode::Live => Span::styled("LIVE", Style::default().fg(Color::Red)),
            PlaybackMode::Archive { remote_path } => Span::raw(format!("ARCHIVE {remote_path}")),
        }];
        if view.channel_indicator_visible {
            indicators.push(Span::raw(format!(" {}", view.channel.label())));
        }
        if view.mute_visible {
            indicators.push(Span::raw(if view.muted { " muted" } else { " sound" }));
        }
        if view.rate == PlaybackRate::Fast {
            indicators.push(Span::raw(" x4"));
        }
        lines.push(Line::from(indicators));
    }
    lines
}
