use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::api::{ApiError, DashboardApi};
use super::crawl::{AbortTaskOnDrop, CrawlTrigger, RefreshOutcome, spawn_refresh_chain};
use super::data_io::{default_output_path, export_current_data, write_rows};
use super::listing::OpportunityList;
use super::session::{self, LoginOutcome, SessionStore};
use super::types::{
    AppEvent, CrawlRequest, DashboardConfig, DataFormat, PageRequest, PageResult, PageSize,
    RefreshPolicy, SignOutReason,
};

const MAX_STATUS_MESSAGES: usize = 20;
const MAX_ERRORS: usize = 10;

/// Handles the UI loop uses to start network work. Every task reports back
/// through `tx`.
#[derive(Clone)]
pub struct Services {
    pub api: Arc<dyn DashboardApi>,
    pub store: Arc<SessionStore>,
    pub tx: UnboundedSender<AppEvent>,
}

impl Services {
    pub fn spawn_page_load(&self, request: PageRequest) {
        let api = self.api.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_page(request).await;
            let _ = tx.send(AppEvent::PageLoaded { request, result });
        });
    }

    pub fn spawn_crawl(&self, request: CrawlRequest) {
        let api = self.api.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = api.run_crawler(&request).await;
            let _ = tx.send(AppEvent::CrawlSettled {
                term: request.params,
                result,
            });
        });
    }

    pub fn spawn_refreshes(&self, policy: RefreshPolicy, request: PageRequest) -> AbortTaskOnDrop {
        spawn_refresh_chain(self.api.clone(), policy, request, self.tx.clone())
    }

    pub fn spawn_export(&self, dir: PathBuf) {
        let api = self.api.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = export_current_data(api.as_ref(), &dir).await;
            let _ = tx.send(AppEvent::ExportFinished(result));
        });
    }

    pub fn spawn_login(&self, username: String, password: String, remember: bool) {
        let api = self.api.clone();
        let store = self.store.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = session::login(api.as_ref(), &store, &username, &password, remember).await;
            let _ = tx.send(AppEvent::LoginFinished(result));
        });
    }

    pub fn spawn_change_password(&self, old_password: String, new_password: String) {
        let api = self.api.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = api.change_password(&old_password, &new_password).await;
            let _ = tx.send(AppEvent::PasswordChanged(result));
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginField {
    #[default]
    Username,
    Password,
    Remember,
}

impl LoginField {
    pub fn cycle(self) -> Self {
        match self {
            LoginField::Username => LoginField::Password,
            LoginField::Password => LoginField::Remember,
            LoginField::Remember => LoginField::Username,
        }
    }
}

#[derive(Debug, Default)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
    pub remember: bool,
    pub field: LoginField,
    pub error: Option<String>,
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PasswordField {
    #[default]
    Current,
    New,
    Confirm,
}

impl PasswordField {
    pub fn cycle(self) -> Self {
        match self {
            PasswordField::Current => PasswordField::New,
            PasswordField::New => PasswordField::Confirm,
            PasswordField::Confirm => PasswordField::Current,
        }
    }
}

#[derive(Debug, Default)]
pub struct PasswordForm {
    pub current: String,
    pub new: String,
    pub confirm: String,
    pub field: PasswordField,
    pub error: Option<String>,
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Table,
    Search,
    Filter,
}

pub struct Dashboard {
    pub list: OpportunityList,
    pub crawl: CrawlTrigger,
    pub search_input: String,
    pub filter_input: String,
    pub focus: Focus,
    pub selected: usize,
    pub exporting: bool,
    refresh_task: Option<AbortTaskOnDrop>,
    crawl_term_applied: bool,
}

impl Dashboard {
    pub fn new(config: &DashboardConfig) -> Self {
        Self {
            list: OpportunityList::new(config.page_size),
            crawl: CrawlTrigger::new(config.crawler, config.refresh),
            search_input: String::new(),
            filter_input: String::new(),
            focus: Focus::Table,
            selected: 0,
            exporting: false,
            refresh_task: None,
            crawl_term_applied: false,
        }
    }

    pub fn export_enabled(&self) -> bool {
        !self.exporting && !self.crawl.is_busy()
    }

    pub fn has_pending_refresh(&self) -> bool {
        self.refresh_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn clamp_selection(&mut self) {
        let visible = self.list.visible().len();
        self.selected = self.selected.min(visible.saturating_sub(1));
    }
}

pub enum Screen {
    Login(LoginForm),
    ChangePassword(PasswordForm),
    Dashboard(Box<Dashboard>),
}

pub struct AppState {
    pub config: DashboardConfig,
    pub screen: Screen,
    pub status_messages: VecDeque<String>,
    pub errors: VecDeque<String>,
    /// Blocking notice; the TUI shows it as a modal until dismissed.
    pub notice: Option<String>,
    pub should_quit: bool,
}

impl AppState {
    pub fn new(config: DashboardConfig) -> Self {
        Self {
            config,
            screen: Screen::Login(LoginForm::default()),
            status_messages: VecDeque::new(),
            errors: VecDeque::new(),
            notice: None,
            should_quit: false,
        }
    }

    pub fn push_error(&mut self, error: String) {
        self.errors.push_front(error);
        while self.errors.len() > MAX_ERRORS {
            self.errors.pop_back();
        }
    }

    pub fn push_status(&mut self, message: String) {
        self.status_messages.push_front(message);
        while self.status_messages.len() > MAX_STATUS_MESSAGES {
            self.status_messages.pop_back();
        }
    }

    pub fn dashboard(&self) -> Option<&Dashboard> {
        match &self.screen {
            Screen::Dashboard(dashboard) => Some(dashboard),
            _ => None,
        }
    }

    pub fn dashboard_mut(&mut self) -> Option<&mut Dashboard> {
        match &mut self.screen {
            Screen::Dashboard(dashboard) => Some(dashboard),
            _ => None,
        }
    }

    /// Switches to the dashboard and requests the first page.
    pub fn enter_dashboard(&mut self, services: &Services, page: usize) {
        let mut dashboard = Dashboard::new(&self.config);
        let request = dashboard
            .list
            .begin_load(PageRequest::new(page, self.config.page_size));
        services.spawn_page_load(request);
        self.screen = Screen::Dashboard(Box::new(dashboard));
    }

    pub fn submit_login(&mut self, services: &Services) {
        let Screen::Login(form) = &mut self.screen else {
            return;
        };
        if form.pending {
            return;
        }
        form.pending = true;
        form.error = None;
        services.spawn_login(
            form.username.clone(),
            form.password.clone(),
            form.remember,
        );
    }

    pub fn submit_password_change(&mut self, services: &Services) {
        let Screen::ChangePassword(form) = &mut self.screen else {
            return;
        };
        if form.pending {
            return;
        }
        match session::validate_password_change(&form.current, &form.new, &form.confirm) {
            Ok(()) => {
                form.pending = true;
                form.error = None;
                services.spawn_change_password(form.current.clone(), form.new.clone());
            }
            Err(err) => form.error = Some(err.to_string()),
        }
    }

    pub fn logout(&mut self, services: &Services) {
        session::logout(&services.store, Some(&services.tx));
    }

    pub fn submit_crawl(&mut self, services: &Services) {
        let Some(dashboard) = self.dashboard_mut() else {
            return;
        };
        let submitted = dashboard.crawl.submit(&dashboard.search_input);
        let status = dashboard.crawl.status().to_string();
        match submitted {
            Ok(request) => {
                services.spawn_crawl(request);
                self.push_status(status);
            }
            Err(err) => self.push_error(err.to_string()),
        }
    }

    pub fn request_export(&mut self, services: &Services) {
        let export_dir = self.config.export_dir.clone();
        let Some(dashboard) = self.dashboard_mut() else {
            return;
        };
        if !dashboard.export_enabled() {
            self.push_error("Export is unavailable while a crawl or export is running".to_string());
            return;
        }
        dashboard.exporting = true;
        services.spawn_export(export_dir);
        self.push_status("Exporting opportunities...".to_string());
    }

    pub fn navigate(&mut self, services: &Services, target: PageTarget) {
        let Some(dashboard) = self.dashboard_mut() else {
            return;
        };
        let request = match target {
            PageTarget::First => dashboard.list.first_page(),
            PageTarget::Prev => dashboard.list.prev_page(),
            PageTarget::Next => dashboard.list.next_page(),
            PageTarget::Last => dashboard.list.last_page(),
            PageTarget::Number(page) => dashboard.list.change_page(page),
        };
        if let Some(request) = request {
            dashboard.selected = 0;
            services.spawn_page_load(dashboard.list.begin_load(request));
        }
    }

    pub fn reload(&mut self, services: &Services) {
        let Some(dashboard) = self.dashboard_mut() else {
            return;
        };
        let request = dashboard.list.current_request();
        services.spawn_page_load(dashboard.list.begin_load(request));
    }

    pub fn set_page_size(&mut self, services: &Services, page_size: PageSize) {
        let Some(dashboard) = self.dashboard_mut() else {
            return;
        };
        let request = dashboard.list.set_items_per_page(page_size);
        dashboard.selected = 0;
        services.spawn_page_load(dashboard.list.begin_load(request));
    }

    pub fn apply_filter(&mut self) {
        let Some(dashboard) = self.dashboard_mut() else {
            return;
        };
        let term = dashboard.filter_input.clone();
        dashboard.list.set_search_term(term);
        dashboard.clamp_selection();
    }

    /// Writes the visible rows of the current page to a timestamped CSV file.
    pub fn dump_visible_page(&mut self) {
        let date_style = self.config.date_style;
        let Some(dashboard) = self.dashboard() else {
            return;
        };
        let path = default_output_path(dashboard.list.current_page(), DataFormat::Csv);
        let rows = dashboard.list.visible();
        let result = write_rows(
            &path,
            DataFormat::Csv,
            &rows,
            dashboard.list.row_number(0),
            date_style,
        );
        match result {
            Ok(count) => self.push_status(format!("Wrote {count} rows to {path}")),
            Err(err) => self.push_error(format!("Failed to write {path}: {err}")),
        }
    }

    pub fn handle_app_event(&mut self, services: &Services, event: AppEvent) {
        match event {
            AppEvent::PageLoaded { request, result } => {
                self.on_page_loaded(services, request, result)
            }
            AppEvent::CrawlSettled { term, result } => {
                self.on_crawl_settled(services, &term, result)
            }
            AppEvent::RefreshAttempt {
                attempt,
                request,
                result,
            } => self.on_refresh_attempt(services, attempt, request, result),
            AppEvent::ExportFinished(result) => {
                let Some(dashboard) = self.dashboard_mut() else {
                    return;
                };
                dashboard.exporting = false;
                match result {
                    Ok(path) => self.push_status(format!("Export saved to {}", path.display())),
                    Err(err) if err.is_unauthorized() => {}
                    Err(err) => self.notice = Some(format!("Export failed: {err}")),
                }
            }
            AppEvent::LoginFinished(result) => {
                let Screen::Login(form) = &mut self.screen else {
                    return;
                };
                form.pending = false;
                match result {
                    Ok(LoginOutcome::Dashboard) => {
                        form.password.clear();
                        self.enter_dashboard(services, 1);
                        self.push_status("Signed in".to_string());
                    }
                    Ok(LoginOutcome::PasswordChangeRequired) => {
                        self.screen = Screen::ChangePassword(PasswordForm::default());
                        self.push_status(
                            "Your password has expired, please choose a new one".to_string(),
                        );
                    }
                    Err(err) => form.error = Some(err.to_string()),
                }
            }
            AppEvent::PasswordChanged(result) => {
                let Screen::ChangePassword(form) = &mut self.screen else {
                    return;
                };
                form.pending = false;
                match result {
                    Ok(()) => {
                        info!("password changed");
                        self.enter_dashboard(services, 1);
                        self.push_status("Password changed".to_string());
                    }
                    Err(err) => form.error = Some(err.to_string()),
                }
            }
            AppEvent::SignedOut(_) if matches!(self.screen, Screen::Login(_)) => {
                // A rejected sign-in; `LoginFinished` carries the message.
                debug!("sign-out while on the login screen");
            }
            AppEvent::SignedOut(reason) => {
                self.screen = Screen::Login(LoginForm::default());
                self.notice = None;
                match reason {
                    SignOutReason::UserRequested => self.push_status("Signed out".to_string()),
                    SignOutReason::SessionExpired => {
                        self.push_error(
                            "Your session has expired, please sign in again".to_string(),
                        )
                    }
                }
            }
            AppEvent::Status(message) => self.push_status(message),
        }
    }

    fn on_page_loaded(
        &mut self,
        services: &Services,
        request: PageRequest,
        result: Result<PageResult, ApiError>,
    ) {
        let Some(dashboard) = self.dashboard_mut() else {
            return;
        };
        if request != dashboard.list.current_request() {
            debug!(page = request.page, "dropping response for a page no longer shown");
            return;
        }
        if let Some(follow_up) = dashboard.list.finish_load(request, result) {
            services.spawn_page_load(follow_up);
        }
        dashboard.clamp_selection();
        if let Some(err) = dashboard.list.error().map(str::to_string) {
            self.push_error(err);
        }
    }

    fn on_crawl_settled(&mut self, services: &Services, term: &str, result: Result<(), ApiError>) {
        let Some(dashboard) = self.dashboard_mut() else {
            return;
        };
        if !dashboard.crawl.on_crawl_settled(result) {
            let error = dashboard.crawl.error().map(str::to_string);
            if let Some(error) = error {
                self.push_error(error);
            }
            return;
        }
        let request = PageRequest::first(dashboard.list.page_size());
        services.spawn_page_load(dashboard.list.begin_load(request));
        dashboard.selected = 0;
        dashboard.crawl_term_applied = false;
        let policy = dashboard.crawl.policy();
        dashboard.refresh_task = Some(services.spawn_refreshes(policy, request));
        let status = dashboard.crawl.status().to_string();
        info!(term, "crawl accepted; refreshing");
        self.push_status(status);
    }

    fn on_refresh_attempt(
        &mut self,
        services: &Services,
        attempt: usize,
        request: PageRequest,
        result: Result<PageResult, ApiError>,
    ) {
        let Some(dashboard) = self.dashboard_mut() else {
            return;
        };
        let ok = result.is_ok();
        match result {
            Ok(page) => {
                let current = PageRequest::first(dashboard.list.page_size());
                if request == current {
                    dashboard.list.begin_load(request);
                    if let Some(follow_up) = dashboard.list.finish_load(request, Ok(page)) {
                        services.spawn_page_load(follow_up);
                    }
                } else {
                    // Page size changed mid-chain; refetch at the size now shown.
                    debug!(attempt, "refresh page size is stale");
                    services.spawn_page_load(dashboard.list.begin_load(current));
                }
                if !dashboard.crawl_term_applied {
                    dashboard.crawl_term_applied = true;
                    dashboard.filter_input = dashboard.crawl.term().to_string();
                    dashboard.list.set_search_term(dashboard.crawl.term());
                }
                dashboard.selected = 0;
                dashboard.clamp_selection();
            }
            Err(err) => debug!(attempt, error = %err, "refresh attempt failed"),
        }

        let outcome = dashboard.crawl.on_refresh_attempt(attempt, ok);
        let status = dashboard.crawl.status().to_string();
        let error = dashboard.crawl.error().map(str::to_string);
        match outcome {
            None if ok => self.push_status(status),
            None => {}
            Some(RefreshOutcome::Failed) => {
                if let Some(dashboard) = self.dashboard_mut() {
                    dashboard.refresh_task = None;
                }
                if let Some(error) = error {
                    warn!(%error, "all refreshes after the crawl failed");
                    self.push_error(error);
                }
            }
            Some(RefreshOutcome::Complete | RefreshOutcome::Partial) => {
                if let Some(dashboard) = self.dashboard_mut() {
                    dashboard.refresh_task = None;
                }
                self.push_status(status);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTarget {
    First,
    Prev,
    Next,
    Last,
    Number(usize),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::app::api::testing::FakeApi;
    use crate::app::session::tests::scratch_store;
    use crate::app::types::Opportunity;

    fn page_of(titles: &[&str], total_items: usize) -> PageResult {
        PageResult {
            opportunities: titles
                .iter()
                .map(|title| Opportunity {
                    title: Some((*title).to_string()),
                    ..Opportunity::default()
                })
                .collect(),
            total_items,
            total_pages: total_items.div_ceil(10).max(1),
        }
    }

    fn setup(
        name: &str,
        api: FakeApi,
    ) -> (AppState, Services, Arc<FakeApi>, UnboundedReceiver<AppEvent>) {
        let api = Arc::new(api);
        let (tx, rx) = mpsc::unbounded_channel();
        let services = Services {
            api: api.clone(),
            store: Arc::new(scratch_store(name)),
            tx,
        };
        let config = DashboardConfig {
            export_dir: std::env::temp_dir()
                .join(format!("samdash-state-{}-{name}", std::process::id())),
            ..DashboardConfig::default()
        };
        (AppState::new(config), services, api, rx)
    }

    async fn pump(state: &mut AppState, services: &Services, rx: &mut UnboundedReceiver<AppEvent>) {
        let event = rx.recv().await.expect("event");
        state.handle_app_event(services, event);
    }

    #[tokio::test]
    async fn entering_the_dashboard_loads_the_first_page() {
        let (mut state, services, api, mut rx) =
            setup("enter", FakeApi::with_pages(vec![Ok(page_of(&["Cloud"], 1))]));
        state.enter_dashboard(&services, 1);
        assert!(state.dashboard().expect("dashboard").list.is_loading());
        pump(&mut state, &services, &mut rx).await;

        let dashboard = state.dashboard().expect("dashboard");
        assert!(!dashboard.list.is_loading());
        assert_eq!(dashboard.list.opportunities().len(), 1);
        assert_eq!(api.page_call_count(), 1);
    }

    #[tokio::test]
    async fn stale_page_responses_are_ignored() {
        let (mut state, services, _api, _rx) = setup("stale", FakeApi::default());
        state.enter_dashboard(&services, 1);
        let stale = PageRequest::new(4, PageSize::Ten);
        state.handle_app_event(
            &services,
            AppEvent::PageLoaded {
                request: stale,
                result: Ok(page_of(&["Old"], 40)),
            },
        );
        let dashboard = state.dashboard().expect("dashboard");
        assert!(dashboard.list.is_loading());
        assert!(dashboard.list.opportunities().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn crawl_success_resets_to_page_one_and_applies_the_term_once() {
        let api = FakeApi::with_pages(vec![Ok(page_of(&["IT software support", "Chairs"], 2))]);
        let (mut state, services, api, mut rx) = setup("crawl", api);
        state.enter_dashboard(&services, 1);
        pump(&mut state, &services, &mut rx).await;

        let dashboard = state.dashboard_mut().expect("dashboard");
        dashboard.list.begin_load(PageRequest::new(3, PageSize::Ten));
        dashboard.search_input = "IT software".to_string();
        state.submit_crawl(&services);
        assert!(!state.dashboard().expect("dashboard").export_enabled());

        // CrawlSettled, then Status + RefreshAttempt per attempt.
        let mut refreshes = 0;
        while refreshes < 3 {
            let event = rx.recv().await.expect("event");
            let settled = matches!(event, AppEvent::CrawlSettled { .. });
            let refreshed = matches!(event, AppEvent::RefreshAttempt { .. });
            state.handle_app_event(&services, event);
            if settled {
                assert_eq!(state.dashboard().expect("dashboard").list.current_page(), 1);
            }
            if refreshed {
                refreshes += 1;
            }
            if refreshed && refreshes == 1 {
                let dashboard = state.dashboard_mut().expect("dashboard");
                assert_eq!(dashboard.list.search_term(), "IT software");
                // A user edit after the first refresh is kept.
                dashboard.filter_input.clear();
                dashboard.list.set_search_term("");
            }
        }

        let crawl_calls = api.crawl_calls.lock().expect("lock").clone();
        assert_eq!(crawl_calls.len(), 1);
        assert_eq!(crawl_calls[0].params, "IT software");
        assert_eq!(api.page_call_count(), 5);

        let dashboard = state.dashboard().expect("dashboard");
        assert!(!dashboard.crawl.is_busy());
        assert_eq!(dashboard.list.search_term(), "");
        assert_eq!(dashboard.list.visible().len(), 2);
        assert!(dashboard.export_enabled());
        assert_eq!(
            state.status_messages.front().map(String::as_str),
            Some("Data refresh complete!")
        );
    }

    async fn run_until_crawl_settles(
        state: &mut AppState,
        services: &Services,
        rx: &mut UnboundedReceiver<AppEvent>,
    ) {
        while state.dashboard().expect("dashboard").crawl.is_busy() {
            pump(state, services, rx).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        while let Ok(event) = rx.try_recv() {
            state.handle_app_event(services, event);
        }
    }

    fn first_title(state: &AppState) -> Option<String> {
        let list = &state.dashboard().expect("dashboard").list;
        list.opportunities().first().and_then(|opp| opp.title.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn crawl_success_shows_page_one_even_when_every_refresh_fails() {
        let api = FakeApi::with_pages(vec![
            Ok(page_of(&["P1"], 30)),
            Ok(page_of(&["P3"], 30)),
            Ok(page_of(&["P1"], 30)),
            Err(ApiError::Validation("still crawling".to_string())),
        ]);
        let (mut state, services, _api, mut rx) = setup("crawl-page-one", api);
        state.enter_dashboard(&services, 1);
        pump(&mut state, &services, &mut rx).await;
        state.navigate(&services, PageTarget::Number(3));
        pump(&mut state, &services, &mut rx).await;
        assert_eq!(first_title(&state).as_deref(), Some("P3"));

        state.dashboard_mut().expect("dashboard").search_input = "cloud".to_string();
        state.submit_crawl(&services);
        run_until_crawl_settles(&mut state, &services, &mut rx).await;

        let dashboard = state.dashboard().expect("dashboard");
        assert_eq!(dashboard.list.current_page(), 1);
        assert_eq!(dashboard.list.row_number(0), 1);
        assert_eq!(first_title(&state).as_deref(), Some("P1"));
        assert!(state.errors.front().is_some_and(|err| err.contains("data refresh has failed")));
    }

    #[tokio::test(start_paused = true)]
    async fn crawl_settling_before_a_page_response_still_clears_loading() {
        let api = FakeApi::with_pages(vec![
            Ok(page_of(&["P1"], 30)),
            Ok(page_of(&["P3"], 30)),
            Ok(page_of(&["P1"], 30)),
            Err(ApiError::Validation("still crawling".to_string())),
        ]);
        let (mut state, services, _api, mut rx) = setup("crawl-loading", api);
        state.enter_dashboard(&services, 1);
        pump(&mut state, &services, &mut rx).await;

        state.navigate(&services, PageTarget::Number(3));
        let dashboard = state.dashboard_mut().expect("dashboard");
        dashboard.crawl.submit("cloud").expect("submit");
        state.handle_app_event(
            &services,
            AppEvent::CrawlSettled {
                term: "cloud".to_string(),
                result: Ok(()),
            },
        );
        run_until_crawl_settles(&mut state, &services, &mut rx).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let dashboard = state.dashboard().expect("dashboard");
        assert!(!dashboard.list.is_loading());
        assert_eq!(dashboard.list.current_page(), 1);
        assert_eq!(first_title(&state).as_deref(), Some("P1"));
    }

    #[tokio::test(start_paused = true)]
    async fn page_size_chosen_during_refreshes_is_kept() {
        let api = FakeApi::with_pages(vec![Ok(page_of(&["Cloud"], 60))]);
        let (mut state, services, api, mut rx) = setup("crawl-page-size", api);
        state.enter_dashboard(&services, 1);
        pump(&mut state, &services, &mut rx).await;

        state.dashboard_mut().expect("dashboard").crawl.submit("cloud").expect("submit");
        state.handle_app_event(
            &services,
            AppEvent::CrawlSettled {
                term: "cloud".to_string(),
                result: Ok(()),
            },
        );
        state.set_page_size(&services, PageSize::Fifty);
        run_until_crawl_settles(&mut state, &services, &mut rx).await;

        let dashboard = state.dashboard().expect("dashboard");
        assert_eq!(dashboard.list.page_size(), PageSize::Fifty);
        assert_eq!(dashboard.list.current_request(), PageRequest::first(PageSize::Fifty));
        assert!(!dashboard.list.is_loading());
        let calls = api.page_calls.lock().expect("lock");
        let (last, _) = calls.last().expect("page call");
        assert_eq!(last.page_size, PageSize::Fifty);
    }

    #[tokio::test]
    async fn blank_search_never_reaches_the_api() {
        let (mut state, services, api, _rx) = setup("blank", FakeApi::default());
        state.enter_dashboard(&services, 1);
        state.dashboard_mut().expect("dashboard").search_input = "   ".to_string();
        state.submit_crawl(&services);
        assert!(api.crawl_calls.lock().expect("lock").is_empty());
        assert_eq!(
            state.errors.front().map(String::as_str),
            Some("Please enter a search keyword")
        );
    }

    #[tokio::test]
    async fn export_failure_raises_exactly_one_notice() {
        let api = FakeApi::default();
        api.export
            .lock()
            .expect("lock")
            .push_back(Err(ApiError::Validation("network unreachable".to_string())));
        let (mut state, services, _api, mut rx) = setup("export", api);
        state.enter_dashboard(&services, 1);
        state.request_export(&services);
        state.request_export(&services);
        assert_eq!(
            state.errors.front().map(String::as_str),
            Some("Export is unavailable while a crawl or export is running")
        );

        loop {
            let event = rx.recv().await.expect("event");
            let done = matches!(event, AppEvent::ExportFinished(_));
            state.handle_app_event(&services, event);
            if done {
                break;
            }
        }
        assert_eq!(state.notice.as_deref(), Some("Export failed: network unreachable"));
        assert!(state.dashboard().expect("dashboard").export_enabled());
        assert!(!state.config.export_dir.join("opportunities.xlsx").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn signing_out_drops_the_dashboard_and_its_refreshes() {
        let (mut state, services, api, mut rx) = setup("signout", FakeApi::default());
        state.enter_dashboard(&services, 1);
        pump(&mut state, &services, &mut rx).await;
        state.dashboard_mut().expect("dashboard").search_input = "cloud".to_string();
        state.submit_crawl(&services);
        pump(&mut state, &services, &mut rx).await;
        assert!(state.dashboard().expect("dashboard").has_pending_refresh());

        state.handle_app_event(&services, AppEvent::SignedOut(SignOutReason::SessionExpired));
        assert!(matches!(state.screen, Screen::Login(_)));
        tokio::time::sleep(Duration::from_secs(30)).await;
        // The initial load plus the page-1 reload on crawl success.
        assert_eq!(api.page_call_count(), 2, "no refresh after sign-out");
    }

    #[tokio::test]
    async fn rejected_sign_in_keeps_the_form_and_its_error() {
        let (mut state, services, _api, _rx) = setup("rejected", FakeApi::default());
        if let Screen::Login(form) = &mut state.screen {
            form.username = "ada".to_string();
            form.pending = true;
        }
        state.handle_app_event(&services, AppEvent::SignedOut(SignOutReason::SessionExpired));
        state.handle_app_event(
            &services,
            AppEvent::LoginFinished(Err(session::LoginError::InvalidCredentials(
                "invalid username or password".to_string(),
            ))),
        );

        let Screen::Login(form) = &state.screen else {
            panic!("still on the login screen");
        };
        assert_eq!(form.username, "ada");
        assert_eq!(form.error.as_deref(), Some("invalid username or password"));
        assert!(state.errors.is_empty());
    }

    #[tokio::test]
    async fn expired_password_routes_to_the_change_form() {
        let (mut state, services, _api, _rx) = setup("expired", FakeApi::default());
        state.handle_app_event(
            &services,
            AppEvent::LoginFinished(Ok(LoginOutcome::PasswordChangeRequired)),
        );
        assert!(matches!(state.screen, Screen::ChangePassword(_)));

        if let Screen::ChangePassword(form) = &mut state.screen {
            form.current = "old".to_string();
            form.new = "new-secret".to_string();
            form.confirm = "typo".to_string();
        }
        state.submit_password_change(&services);
        let Screen::ChangePassword(form) = &state.screen else {
            panic!("still on the password form");
        };
        assert_eq!(
            form.error.as_deref(),
            Some("new password and confirmation do not match")
        );
        assert!(!form.pending);
    }

    #[test]
    fn message_queues_are_capped() {
        let mut state = AppState::new(DashboardConfig::default());
        for i in 0..30 {
            state.push_status(format!("status {i}"));
            state.push_error(format!("error {i}"));
        }
        assert_eq!(state.status_messages.len(), MAX_STATUS_MESSAGES);
        assert_eq!(state.errors.len(), MAX_ERRORS);
        assert_eq!(state.errors.front().map(String::as_str), Some("error 29"));
    }
}
