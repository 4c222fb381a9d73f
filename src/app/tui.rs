use std::io::{self, Stdout};
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState, Wrap};
use ratatui::{Frame, Terminal};
use tokio::sync::mpsc::UnboundedReceiver;

use super::crawl::CrawlPhase;
use super::data_io::table_cells;
use super::listing::OpportunityList;
use super::state::{
    AppState, Dashboard, Focus, LoginField, LoginForm, PageTarget, PasswordField, PasswordForm,
    Screen, Services,
};
use super::types::{AppEvent, ColumnSet, DashboardConfig};
use super::ui_utils::{
    centered_rect, enabled_style, hint_label, input_style, key_hint, masked, open_url_in_browser,
    truncate_for_display,
};

const TICK_RATE: Duration = Duration::from_millis(120);
const TITLE_COLUMN: usize = 1;
const LINK_COLUMN: usize = 4;

pub fn draw_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    state: &mut AppState,
    services: &Services,
    rx: &mut UnboundedReceiver<AppEvent>,
) -> io::Result<()> {
    let mut last_tick = Instant::now();
    let mut table_state = TableState::default();
    let mut help_mode = false;

    loop {
        while let Ok(event) = rx.try_recv() {
            state.handle_app_event(services, event);
        }

        terminal.draw(|f| {
            let area = f.area();
            match &state.screen {
                Screen::Login(form) => render_login(f, area, form),
                Screen::ChangePassword(form) => render_password_change(f, area, form),
                Screen::Dashboard(dashboard) => {
                    render_dashboard(f, area, state, dashboard, &mut table_state)
                }
            }
            render_messages_overlay(f, area, state);
            if help_mode {
                render_help(f, area);
            }
            if let Some(notice) = state.notice.as_deref() {
                render_notice(f, area, notice);
            }
        })?;

        let timeout = TICK_RATE.saturating_sub(last_tick.elapsed());
        if event::poll(timeout)?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
        {
            handle_key(state, services, key, &mut help_mode);
        }

        if last_tick.elapsed() >= TICK_RATE {
            last_tick = Instant::now();
        }

        if state.should_quit {
            break;
        }
    }
    Ok(())
}

fn handle_key(state: &mut AppState, services: &Services, key: KeyEvent, help_mode: &mut bool) {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        state.should_quit = true;
        return;
    }
    if state.notice.is_some() {
        if matches!(key.code, KeyCode::Esc | KeyCode::Enter) {
            state.notice = None;
        }
        return;
    }
    if *help_mode {
        if matches!(key.code, KeyCode::Esc | KeyCode::Enter | KeyCode::Char('?')) {
            *help_mode = false;
        }
        return;
    }

    match &mut state.screen {
        Screen::Login(form) => match key.code {
            KeyCode::Esc => state.should_quit = true,
            KeyCode::Enter => state.submit_login(services),
            KeyCode::Tab | KeyCode::Down => form.field = form.field.cycle(),
            KeyCode::BackTab | KeyCode::Up => form.field = form.field.cycle().cycle(),
            KeyCode::Char(' ') if form.field == LoginField::Remember => {
                form.remember = !form.remember;
            }
            KeyCode::Char(c) => match form.field {
                LoginField::Username => form.username.push(c),
                LoginField::Password => form.password.push(c),
                LoginField::Remember => {}
            },
            KeyCode::Backspace => match form.field {
                LoginField::Username => {
                    form.username.pop();
                }
                LoginField::Password => {
                    form.password.pop();
                }
                LoginField::Remember => {}
            },
            _ => {}
        },
        Screen::ChangePassword(form) => match key.code {
            KeyCode::Esc => state.logout(services),
            KeyCode::Enter => state.submit_password_change(services),
            KeyCode::Tab | KeyCode::Down => form.field = form.field.cycle(),
            KeyCode::BackTab | KeyCode::Up => form.field = form.field.cycle().cycle(),
            KeyCode::Char(c) => password_field(form).push(c),
            KeyCode::Backspace => {
                password_field(form).pop();
            }
            _ => {}
        },
        Screen::Dashboard(dashboard) => match dashboard.focus {
            Focus::Search => match key.code {
                KeyCode::Esc => dashboard.focus = Focus::Table,
                KeyCode::Enter => {
                    dashboard.focus = Focus::Table;
                    state.submit_crawl(services);
                }
                KeyCode::Backspace => {
                    dashboard.search_input.pop();
                }
                KeyCode::Char('u') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    dashboard.search_input.clear();
                }
                KeyCode::Char(c) => dashboard.search_input.push(c),
                _ => {}
            },
            Focus::Filter => {
                match key.code {
                    KeyCode::Esc | KeyCode::Enter => dashboard.focus = Focus::Table,
                    KeyCode::Backspace => {
                        dashboard.filter_input.pop();
                    }
                    KeyCode::Char('u') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        dashboard.filter_input.clear();
                    }
                    KeyCode::Char(c) => dashboard.filter_input.push(c),
                    _ => return,
                }
                state.apply_filter();
            }
            Focus::Table => handle_dashboard_key(state, services, key, help_mode),
        },
    }
}

fn password_field(form: &mut PasswordForm) -> &mut String {
    match form.field {
        PasswordField::Current => &mut form.current,
        PasswordField::New => &mut form.new,
        PasswordField::Confirm => &mut form.confirm,
    }
}

fn handle_dashboard_key(
    state: &mut AppState,
    services: &Services,
    key: KeyEvent,
    help_mode: &mut bool,
) {
    let Some(dashboard) = state.dashboard_mut() else {
        return;
    };
    let visible = dashboard.list.visible().len();
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => state.should_quit = true,
        KeyCode::Char('?') => *help_mode = true,
        KeyCode::Char('s') => {
            if dashboard.crawl.is_busy() {
                state.push_error("Search is disabled while the crawler is running".to_string());
            } else {
                dashboard.focus = Focus::Search;
            }
        }
        KeyCode::Char('/') => dashboard.focus = Focus::Filter,
        KeyCode::Down | KeyCode::Char('j') => {
            if dashboard.selected + 1 < visible {
                dashboard.selected += 1;
            }
        }
        KeyCode::Up | KeyCode::Char('k') => {
            dashboard.selected = dashboard.selected.saturating_sub(1);
        }
        KeyCode::Right | KeyCode::Char('n') => state.navigate(services, PageTarget::Next),
        KeyCode::Left | KeyCode::Char('p') => state.navigate(services, PageTarget::Prev),
        KeyCode::Home | KeyCode::Char('g') => state.navigate(services, PageTarget::First),
        KeyCode::End | KeyCode::Char('G') => state.navigate(services, PageTarget::Last),
        KeyCode::Char(c @ '1'..='9') => {
            let page = c.to_digit(10).map(|d| d as usize).unwrap_or(1);
            state.navigate(services, PageTarget::Number(page));
        }
        KeyCode::Char('+') => {
            let next = dashboard.list.page_size().cycle();
            state.set_page_size(services, next);
        }
        KeyCode::Char('r') => state.reload(services),
        KeyCode::Char('e') => state.request_export(services),
        KeyCode::Char('w') => state.dump_visible_page(),
        KeyCode::Char('L') => state.logout(services),
        KeyCode::Enter => {
            let link = dashboard
                .list
                .visible()
                .get(dashboard.selected)
                .map(|opp| opp.display_link().to_string());
            if let Some(link) = link
                && let Err(err) = open_url_in_browser(&link)
            {
                state.push_error(format!("failed to open link in browser: {err}"));
            }
        }
        _ => {}
    }
}

fn render_login(f: &mut Frame, area: Rect, form: &LoginForm) {
    let popup = centered_rect(50, 50, area);
    f.render_widget(Clear, popup);

    let field_line = |label: &'static str, value: String, field: LoginField| {
        Line::from(vec![
            Span::styled(format!("{label:<10}"), Style::default().fg(Color::Gray)),
            Span::styled(value, input_style(form.field == field, !form.pending)),
        ])
    };
    let mut lines = vec![
        Line::from(""),
        field_line("Username", format!("{}_", form.username), LoginField::Username),
        field_line("Password", format!("{}_", masked(&form.password)), LoginField::Password),
        field_line(
            "Remember",
            if form.remember { "[x] keep me signed in" } else { "[ ] keep me signed in" }
                .to_string(),
            LoginField::Remember,
        ),
        Line::from(""),
    ];
    if form.pending {
        lines.push(Line::styled("Signing in...", Style::default().fg(Color::Cyan)));
    }
    if let Some(error) = &form.error {
        lines.push(Line::styled(error.clone(), Style::default().fg(Color::Red)));
    }
    lines.push(Line::from(vec![
        key_hint("tab"),
        hint_label(" next field  "),
        key_hint("space"),
        hint_label(" toggle  "),
        key_hint("enter"),
        hint_label(" sign in  "),
        key_hint("esc"),
        hint_label(" quit"),
    ]));

    f.render_widget(
        Paragraph::new(lines)
            .block(
                Block::default()
                    .title("samdash - Sign in")
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(Color::Cyan)),
            )
            .wrap(Wrap { trim: true }),
        popup,
    );
}

fn render_password_change(f: &mut Frame, area: Rect, form: &PasswordForm) {
    let popup = centered_rect(56, 50, area);
    f.render_widget(Clear, popup);

    let field_line = |label: &'static str, value: &str, field: PasswordField| {
        Line::from(vec![
            Span::styled(format!("{label:<18}"), Style::default().fg(Color::Gray)),
            Span::styled(
                format!("{}_", masked(value)),
                input_style(form.field == field, !form.pending),
            ),
        ])
    };
    let mut lines = vec![
        Line::from("Your password has expired. Choose a new one to continue."),
        Line::from(""),
        field_line("Current password", &form.current, PasswordField::Current),
        field_line("New password", &form.new, PasswordField::New),
        field_line("Confirm password", &form.confirm, PasswordField::Confirm),
        Line::from(""),
    ];
    if form.pending {
        lines.push(Line::styled("Saving...", Style::default().fg(Color::Cyan)));
    }
    if let Some(error) = &form.error {
        lines.push(Line::styled(error.clone(), Style::default().fg(Color::Red)));
    }
    lines.push(Line::from(vec![
        key_hint("tab"),
        hint_label(" next field  "),
        key_hint("enter"),
        hint_label(" save  "),
        key_hint("esc"),
        hint_label(" sign out"),
    ]));

    f.render_widget(
        Paragraph::new(lines)
            .block(
                Block::default()
                    .title("Change password")
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(Color::Yellow)),
            )
            .wrap(Wrap { trim: true }),
        popup,
    );
}

fn render_dashboard(
    f: &mut Frame,
    area: Rect,
    state: &AppState,
    dashboard: &Dashboard,
    table_state: &mut TableState,
) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(3),
            Constraint::Length(4),
        ])
        .split(area);

    render_header(f, chunks[0], dashboard);
    render_inputs(f, chunks[1], dashboard);
    render_table(f, chunks[2], &state.config, dashboard, table_state);
    render_pagination(f, chunks[3], &dashboard.list);
    render_footer(f, chunks[4], state);
}

fn render_header(f: &mut Frame, area: Rect, dashboard: &Dashboard) {
    let metric_label = Style::default().fg(Color::Gray);
    let sep_style = Style::default().fg(Color::DarkGray);
    let list = &dashboard.list;
    let busy_style = Style::default()
        .fg(Color::Yellow)
        .add_modifier(Modifier::BOLD);
    let crawl_state = match dashboard.crawl.phase() {
        CrawlPhase::Idle => Span::styled("idle", Style::default().fg(Color::Green)),
        CrawlPhase::Running => Span::styled("crawling", busy_style),
        CrawlPhase::RefreshPending { attempt } => Span::styled(
            format!(
                "refreshing {attempt}/{}",
                dashboard.crawl.policy().max_attempts
            ),
            busy_style,
        ),
    };
    let line = Line::from(vec![
        Span::styled("Crawler ", metric_label),
        Span::styled(
            dashboard.crawl.config().crawler_type.label(),
            Style::default().fg(Color::Cyan),
        ),
        Span::styled("  |  ", sep_style),
        Span::styled("State ", metric_label),
        crawl_state,
        Span::styled("  |  ", sep_style),
        Span::styled("Items ", metric_label),
        Span::styled(
            list.total_items().to_string(),
            Style::default()
                .fg(Color::LightCyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled("  |  ", sep_style),
        Span::styled("Per page ", metric_label),
        Span::styled(list.page_size().to_string(), Style::default().fg(Color::White)),
        Span::styled("  |  ", sep_style),
        Span::styled(
            if list.is_loading() { "loading..." } else { "ready" },
            Style::default().fg(if list.is_loading() {
                Color::Yellow
            } else {
                Color::Green
            }),
        ),
        Span::styled("  |  ", sep_style),
        Span::styled("Export ", metric_label),
        Span::styled(
            if dashboard.exporting {
                "running"
            } else if dashboard.export_enabled() {
                "ready"
            } else {
                "disabled"
            },
            enabled_style(dashboard.export_enabled()),
        ),
    ]);
    f.render_widget(
        Paragraph::new(line).block(
            Block::default()
                .title("SAM.gov Opportunities")
                .borders(Borders::ALL),
        ),
        area,
    );
}

fn render_inputs(f: &mut Frame, area: Rect, dashboard: &Dashboard) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(area);

    let search_enabled = !dashboard.crawl.is_busy();
    let search_active = dashboard.focus == Focus::Search;
    let search_text = if search_active {
        format!("{}_", dashboard.search_input)
    } else if dashboard.search_input.is_empty() {
        "press s to enter a keyword".to_string()
    } else {
        dashboard.search_input.clone()
    };
    f.render_widget(
        Paragraph::new(search_text)
            .style(input_style(search_active, search_enabled))
            .block(
                Block::default()
                    .title(if search_enabled {
                        "Crawl keyword"
                    } else {
                        "Crawl keyword (crawler running)"
                    })
                    .borders(Borders::ALL)
                    .border_style(input_style(search_active, search_enabled)),
            ),
        chunks[0],
    );

    let filter_active = dashboard.focus == Focus::Filter;
    let filter_text = if filter_active {
        format!("{}_", dashboard.filter_input)
    } else if dashboard.filter_input.is_empty() {
        "press / to filter this page".to_string()
    } else {
        dashboard.filter_input.clone()
    };
    f.render_widget(
        Paragraph::new(filter_text)
            .style(input_style(filter_active, true))
            .block(
                Block::default()
                    .title("Filter")
                    .borders(Borders::ALL)
                    .border_style(input_style(filter_active, true)),
            ),
        chunks[1],
    );
}

fn column_widths(columns: ColumnSet) -> Vec<Constraint> {
    let mut widths = vec![
        Constraint::Length(5),
        Constraint::Min(24),
        Constraint::Length(11),
        Constraint::Length(11),
        Constraint::Length(28),
        Constraint::Length(22),
    ];
    if columns == ColumnSet::Extended {
        widths.extend([
            Constraint::Length(16),
            Constraint::Length(8),
            Constraint::Length(18),
        ]);
    }
    widths
}

fn render_table(
    f: &mut Frame,
    area: Rect,
    config: &DashboardConfig,
    dashboard: &Dashboard,
    table_state: &mut TableState,
) {
    let list = &dashboard.list;
    let visible = list.visible();
    if visible.is_empty() {
        table_state.select(None);
    } else {
        table_state.select(Some(dashboard.selected.min(visible.len() - 1)));
    }

    let rows = visible.iter().enumerate().map(|(idx, opp)| {
        let cells = table_cells(list.row_number(idx), opp, config.columns, config.date_style)
            .into_iter()
            .enumerate()
            .map(|(column, text)| match column {
                TITLE_COLUMN => Cell::from(truncate_for_display(&text, 80)),
                LINK_COLUMN => Cell::from(text).style(Style::default().fg(Color::Cyan)),
                _ => Cell::from(text),
            });
        Row::new(cells)
    });

    let title = if list.search_term().trim().is_empty() {
        format!("Opportunities ({})", list.opportunities().len())
    } else {
        format!(
            "Opportunities ({} of {} match \"{}\")",
            visible.len(),
            list.opportunities().len(),
            list.search_term()
        )
    };
    let table = Table::new(rows, column_widths(config.columns))
        .header(
            Row::new(config.columns.headers().to_vec())
                .style(Style::default().add_modifier(Modifier::BOLD)),
        )
        .row_highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .border_style(if dashboard.focus == Focus::Table {
                    Style::default().fg(Color::Cyan)
                } else {
                    Style::default().fg(Color::DarkGray)
                }),
        )
        .column_spacing(1);
    f.render_stateful_widget(table, area, table_state);
}

fn render_pagination(f: &mut Frame, area: Rect, list: &OpportunityList) {
    let controls = list.controls();
    let mut spans = vec![
        Span::styled("« ", enabled_style(controls.first_enabled)),
        Span::styled("‹ ", enabled_style(controls.prev_enabled)),
    ];
    for page in &controls.pages {
        let style = if *page == controls.current {
            Style::default()
                .fg(Color::Black)
                .bg(Color::Cyan)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::White)
        };
        spans.push(Span::styled(format!(" {page} "), style));
        spans.push(Span::raw(" "));
    }
    spans.push(Span::styled("› ", enabled_style(controls.next_enabled)));
    spans.push(Span::styled("»", enabled_style(controls.last_enabled)));
    spans.push(Span::styled(
        format!(
            "   page {} of {}  ({} items)",
            controls.current,
            controls.total_pages,
            list.total_items()
        ),
        Style::default().fg(Color::Gray),
    ));
    f.render_widget(
        Paragraph::new(Line::from(spans))
            .block(Block::default().title("Pages").borders(Borders::ALL)),
        area,
    );
}

fn render_footer(f: &mut Frame, area: Rect, state: &AppState) {
    let latest = (state.errors.front(), state.status_messages.front());
    let (last_label, last_event, last_style) = match latest {
        (Some(error), _) => ("Last error", error.as_str(), Style::default().fg(Color::Red)),
        (None, Some(status)) => ("Last status", status.as_str(), Style::default().fg(Color::Cyan)),
        (None, None) => ("Last status", "none", Style::default().fg(Color::DarkGray)),
    };
    let lines = vec![
        Line::from(vec![
            Span::styled(format!("{last_label} "), Style::default().fg(Color::DarkGray)),
            Span::styled(last_event.to_string(), last_style),
        ]),
        Line::from(vec![
            key_hint("q"),
            hint_label(" quit  "),
            key_hint("s"),
            hint_label(" crawl  "),
            key_hint("/"),
            hint_label(" filter  "),
            key_hint("n/p"),
            hint_label(" page  "),
            key_hint("+"),
            hint_label(" per page  "),
            key_hint("e"),
            hint_label(" export  "),
            key_hint("w"),
            hint_label(" save csv  "),
            key_hint("enter"),
            hint_label(" open link  "),
            key_hint("L"),
            hint_label(" sign out  "),
            key_hint("?"),
            hint_label(" help"),
        ]),
    ];
    f.render_widget(
        Paragraph::new(lines)
            .block(Block::default().title("Status").borders(Borders::ALL))
            .wrap(Wrap { trim: true }),
        area,
    );
}

/// Sign-in screens have no footer, so recent messages float at the bottom.
fn render_messages_overlay(f: &mut Frame, area: Rect, state: &AppState) {
    if matches!(state.screen, Screen::Dashboard(_)) || area.height < 4 {
        return;
    }
    let line = match (state.errors.front(), state.status_messages.front()) {
        (Some(error), _) => Line::styled(error.clone(), Style::default().fg(Color::Red)),
        (None, Some(status)) => Line::styled(status.clone(), Style::default().fg(Color::Cyan)),
        (None, None) => return,
    };
    let strip = Rect::new(area.x, area.bottom() - 1, area.width, 1);
    f.render_widget(Paragraph::new(line), strip);
}

fn render_help(f: &mut Frame, area: Rect) {
    let popup = centered_rect(64, 60, area);
    f.render_widget(Clear, popup);
    f.render_widget(
        Paragraph::new(vec![
            Line::from("Navigation"),
            Line::from("  up/down or j/k: move selection"),
            Line::from("  left/right or p/n: previous/next page"),
            Line::from("  g/G or home/end: first/last page, 1-9: jump to page"),
            Line::from("  +: cycle items per page (10, 20, 50, 100)"),
            Line::from("  enter: open the selected opportunity link"),
            Line::from(""),
            Line::from("Actions"),
            Line::from("  s: enter a keyword and run the crawler"),
            Line::from("  /: filter the loaded page by title or description"),
            Line::from("  r: reload the current page"),
            Line::from("  e: download the spreadsheet export"),
            Line::from("  w: save the visible rows as CSV"),
            Line::from("  L: sign out, q: quit"),
            Line::from(""),
            Line::from("Press ? or Esc to close."),
        ])
        .block(
            Block::default()
                .title("Help")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Yellow)),
        )
        .wrap(Wrap { trim: true }),
        popup,
    );
}

fn render_notice(f: &mut Frame, area: Rect, notice: &str) {
    let popup = centered_rect(60, 30, area);
    f.render_widget(Clear, popup);
    f.render_widget(
        Paragraph::new(vec![
            Line::styled(notice.to_string(), Style::default().fg(Color::Red)),
            Line::from(""),
            Line::from("Press Enter to dismiss."),
        ])
        .block(
            Block::default()
                .title("Notice")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Red)),
        )
        .wrap(Wrap { trim: true }),
        popup,
    );
}
