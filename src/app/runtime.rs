use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use clap::Parser;
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use super::api::{ApiClient, DashboardApi};
use super::crawl::{CrawlTrigger, RefreshOutcome, spawn_refresh_chain};
use super::data_io::{detect_data_format, export_current_data, table_cells, write_rows};
use super::listing::OpportunityList;
use super::session::{self, LoginOutcome, SessionStore};
use super::state::{AppState, Screen, Services};
use super::tui::draw_loop;
use super::types::{AppEvent, Cli, DashboardConfig, Opportunity, PageRequest};

const LOG_ENV: &str = "SAMDASH_LOG";

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref(), cli.no_tui)?;

    let session_path = cli
        .session_file
        .clone()
        .unwrap_or_else(SessionStore::default_path);
    let store = Arc::new(SessionStore::new(session_path));
    if cli.logout {
        session::logout(&store, None);
        eprintln!("signed out");
        return Ok(());
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<AppEvent>();
    let client = ApiClient::new(&cli.api_url, store.clone())
        .with_context(|| format!("invalid API URL {}", cli.api_url))?
        .with_events(tx.clone());
    let api: Arc<dyn DashboardApi> = Arc::new(client);
    log_backend_health(api.as_ref()).await;

    let services = Services { api, store, tx };
    if cli.no_tui {
        return run_headless(&cli, &services, &mut rx).await;
    }

    let mut state = AppState::new(cli.dashboard_config());
    if services.store.current().is_some() {
        state.enter_dashboard(&services, cli.page);
    } else if let Screen::Login(form) = &mut state.screen {
        form.username = cli.username.clone().unwrap_or_default();
        form.password = cli.password.clone().unwrap_or_default();
        form.remember = cli.remember;
        if !form.username.is_empty() && !form.password.is_empty() {
            state.submit_login(&services);
        }
    }
    run_tui(&mut state, &services, &mut rx)
}

fn init_logging(log_file: Option<&Path>, headless: bool) -> anyhow::Result<()> {
    let filter = || EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .try_init()
            .map_err(|err| anyhow!("failed to install logger: {err}"))?;
    } else if headless {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(io::stderr)
            .try_init()
            .map_err(|err| anyhow!("failed to install logger: {err}"))?;
    }
    Ok(())
}

async fn log_backend_health(api: &dyn DashboardApi) {
    match api.health().await {
        Ok(health) => info!(
            status = %health.status,
            version = health.version.as_deref().unwrap_or("unknown"),
            "backend reachable"
        ),
        Err(err) => warn!(error = %err, "backend health check failed"),
    }
}

async fn ensure_signed_in(cli: &Cli, services: &Services) -> anyhow::Result<()> {
    if let Some((session, scope)) = services.store.current() {
        info!(user = %session.username, scope = scope.label(), "using stored session");
        return Ok(());
    }
    let username = cli
        .username
        .as_deref()
        .context("no stored session; pass --username and --password")?;
    let password = cli
        .password
        .as_deref()
        .context("no stored session; pass --password")?;
    let outcome = session::login(
        services.api.as_ref(),
        &services.store,
        username,
        password,
        cli.remember,
    )
    .await
    .context("sign-in failed")?;

    if outcome == LoginOutcome::PasswordChangeRequired {
        let new_password = cli
            .new_password
            .as_deref()
            .context("the server requires a password change; rerun with --new-password")?;
        session::validate_password_change(password, new_password, new_password)?;
        services
            .api
            .change_password(password, new_password)
            .await
            .context("password change failed")?;
        eprintln!("password changed");
    }
    Ok(())
}

async fn run_headless(
    cli: &Cli,
    services: &Services,
    rx: &mut UnboundedReceiver<AppEvent>,
) -> anyhow::Result<()> {
    let config = cli.dashboard_config();
    ensure_signed_in(cli, services).await?;

    let mut list = OpportunityList::new(config.page_size);
    let mut filter = cli.filter.clone();
    if let Some(term) = cli.crawl.as_deref() {
        let crawl_filter = crawl_and_refresh(services, &config, term, &mut list, rx).await?;
        filter = filter.or(crawl_filter);
    }

    list.load_page(services.api.as_ref(), cli.page, config.page_size)
        .await
        .map_err(|err| anyhow!(err))?;
    if let Some(term) = filter {
        list.set_search_term(term);
    }

    let rows = list.visible();
    match cli.output.as_deref() {
        Some(path) => {
            let format = detect_data_format(path, cli.format.into());
            let count = write_rows(path, format, &rows, list.row_number(0), config.date_style)
                .with_context(|| format!("failed to write {path}"))?;
            eprintln!("wrote {count} rows to {path}");
        }
        None => print_rows(&list, &rows, &config),
    }
    eprintln!(
        "page {}/{}: {} items, {} shown",
        list.current_page(),
        list.total_pages(),
        list.total_items(),
        rows.len()
    );

    if cli.export {
        let path = export_current_data(services.api.as_ref(), &config.export_dir)
            .await
            .context("export failed")?;
        eprintln!("export saved to {}", path.display());
    }
    Ok(())
}

/// Runs one crawl and waits out its refresh chain. Returns the crawl term
/// when at least one refresh succeeded.
async fn crawl_and_refresh(
    services: &Services,
    config: &DashboardConfig,
    term: &str,
    list: &mut OpportunityList,
    rx: &mut UnboundedReceiver<AppEvent>,
) -> anyhow::Result<Option<String>> {
    let mut crawl = CrawlTrigger::new(config.crawler, config.refresh);
    let request = crawl.submit(term)?;
    eprintln!("{}", crawl.status());
    let result = services.api.run_crawler(&request).await;
    if !crawl.on_crawl_settled(result) {
        bail!("{}", crawl.error().unwrap_or("the crawler failed"));
    }
    eprintln!("{}", crawl.status());

    let page_size = list.page_size();
    if let Err(err) = list.load_page(services.api.as_ref(), 1, page_size).await {
        warn!(%err, "page 1 reload after crawl failed");
    }
    let _refreshes = spawn_refresh_chain(
        services.api.clone(),
        crawl.policy(),
        PageRequest::first(list.page_size()),
        services.tx.clone(),
    );
    let mut applied_term = None;
    while let Some(event) = rx.recv().await {
        match event {
            AppEvent::Status(message) => eprintln!("{message}"),
            AppEvent::SignedOut(_) => {
                bail!("the session expired during the refresh; sign in again")
            }
            AppEvent::RefreshAttempt {
                attempt,
                request,
                result,
            } => {
                if let Err(err) = &result
                    && err.is_unauthorized()
                {
                    bail!("the session expired during the refresh: {err}");
                }
                let ok = result.is_ok();
                if let Ok(page) = result {
                    list.begin_load(request);
                    list.finish_load(request, Ok(page));
                    applied_term.get_or_insert_with(|| crawl.term().to_string());
                }
                match crawl.on_refresh_attempt(attempt, ok) {
                    None => {}
                    Some(RefreshOutcome::Failed) => {
                        eprintln!("{}", crawl.error().unwrap_or("the data refresh failed"));
                        break;
                    }
                    Some(_) => {
                        eprintln!("{}", crawl.status());
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(applied_term)
}

fn print_rows(list: &OpportunityList, rows: &[&Opportunity], config: &DashboardConfig) {
    println!("{}", config.columns.headers().join("\t"));
    for (idx, opp) in rows.iter().enumerate() {
        let cells = table_cells(list.row_number(idx), opp, config.columns, config.date_style);
        println!("{}", cells.join("\t"));
    }
}

fn run_tui(
    state: &mut AppState,
    services: &Services,
    rx: &mut UnboundedReceiver<AppEvent>,
) -> anyhow::Result<()> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;

    let tui_result = draw_loop(&mut terminal, state, services, rx);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    tui_result.context("terminal UI failed")
}
