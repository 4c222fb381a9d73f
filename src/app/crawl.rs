use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use super::api::{ApiError, DashboardApi};
use super::types::{AppEvent, CrawlRequest, CrawlerConfig, PageRequest, PageResult, RefreshPolicy};

pub struct AbortTaskOnDrop(tokio::task::AbortHandle);

impl AbortTaskOnDrop {
    pub fn new(handle: tokio::task::AbortHandle) -> Self {
        Self(handle)
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for AbortTaskOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlPhase {
    Idle,
    Running,
    RefreshPending { attempt: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Complete,
    Partial,
    Failed,
}

/// Tracks one crawl from submit through its follow-up refreshes.
#[derive(Debug)]
pub struct CrawlTrigger {
    config: CrawlerConfig,
    policy: RefreshPolicy,
    phase: CrawlPhase,
    term: String,
    status: String,
    error: Option<String>,
    successes: usize,
}

impl CrawlTrigger {
    pub fn new(config: CrawlerConfig, policy: RefreshPolicy) -> Self {
        Self {
            config,
            policy,
            phase: CrawlPhase::Idle,
            term: String::new(),
            status: String::new(),
            error: None,
            successes: 0,
        }
    }

    pub fn phase(&self) -> CrawlPhase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        self.phase != CrawlPhase::Idle
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn submit(&mut self, input: &str) -> Result<CrawlRequest, ApiError> {
        if self.is_busy() {
            return Err(ApiError::Validation(
                "a crawl is already running".to_string(),
            ));
        }
        let term = input.trim();
        if term.is_empty() {
            let err = ApiError::Validation("Please enter a search keyword".to_string());
            self.error = Some(err.to_string());
            return Err(err);
        }
        self.phase = CrawlPhase::Running;
        self.term = term.to_string();
        self.error = None;
        self.successes = 0;
        self.status = "The crawler is running, please wait...".to_string();
        info!(term, crawler = self.config.crawler_type.code(), "crawl submitted");
        Ok(CrawlRequest::new(&self.config, term))
    }

    /// Returns true when the refresh chain should start.
    pub fn on_crawl_settled(&mut self, result: Result<(), ApiError>) -> bool {
        if self.phase != CrawlPhase::Running {
            return false;
        }
        match result {
            Ok(()) => {
                self.phase = CrawlPhase::RefreshPending { attempt: 1 };
                self.status = format!(
                    "The crawler is running! Search for keywords: {}. \
                     The data will be automatically refreshed...",
                    self.term
                );
                true
            }
            Err(err) => {
                warn!(error = %err, "crawl request failed");
                self.phase = CrawlPhase::Idle;
                self.status.clear();
                self.error = Some(format!("The crawler failed: {err}"));
                false
            }
        }
    }

    /// Records one refresh attempt; the last one settles the run.
    pub fn on_refresh_attempt(&mut self, attempt: usize, ok: bool) -> Option<RefreshOutcome> {
        let CrawlPhase::RefreshPending { .. } = self.phase else {
            return None;
        };
        let total = self.policy.max_attempts;
        if ok {
            self.successes += 1;
            self.status = format!("The data has been refreshed ({attempt}/{total})");
        } else {
            warn!(attempt, total, "refresh after crawl failed");
        }
        if attempt < total {
            self.phase = CrawlPhase::RefreshPending {
                attempt: attempt + 1,
            };
            return None;
        }

        self.phase = CrawlPhase::Idle;
        let outcome = if ok {
            self.status = "Data refresh complete!".to_string();
            RefreshOutcome::Complete
        } else if self.successes > 0 {
            self.status =
                "The crawler has completed, but the last data refresh failed".to_string();
            RefreshOutcome::Partial
        } else {
            self.status.clear();
            self.error =
                Some("The crawler has completed, but the data refresh has failed".to_string());
            RefreshOutcome::Failed
        };
        info!(?outcome, "crawl refresh finished");
        Some(outcome)
    }

    pub fn term(&self) -> &str {
        &self.term
    }
}

/// Re-fetches `request` up to `policy.max_attempts` times, waiting
/// `policy.interval` before each attempt. Attempts never overlap.
pub async fn run_refresh_chain(
    api: Arc<dyn DashboardApi>,
    policy: RefreshPolicy,
    request: PageRequest,
    tx: UnboundedSender<AppEvent>,
) {
    for attempt in 1..=policy.max_attempts {
        tokio::time::sleep(policy.interval).await;
        send_status(
            &tx,
            format!("Refreshing the data ({attempt}/{})...", policy.max_attempts),
        );
        let result: Result<PageResult, ApiError> = api.fetch_page(request).await;
        let unauthorized = matches!(&result, Err(err) if err.is_unauthorized());
        if tx
            .send(AppEvent::RefreshAttempt {
                attempt,
                request,
                result,
            })
            .is_err()
            || unauthorized
        {
            break;
        }
    }
}

pub fn spawn_refresh_chain(
    api: Arc<dyn DashboardApi>,
    policy: RefreshPolicy,
    request: PageRequest,
    tx: UnboundedSender<AppEvent>,
) -> AbortTaskOnDrop {
    let handle = tokio::spawn(run_refresh_chain(api, policy, request, tx));
    AbortTaskOnDrop::new(handle.abort_handle())
}

fn send_status(tx: &UnboundedSender<AppEvent>, message: impl Into<String>) {
    let _ = tx.send(AppEvent::Status(message.into()));
}
