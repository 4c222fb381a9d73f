use tracing::{info, warn};

use super::api::{ApiError, DashboardApi};
use super::types::{Opportunity, PageRequest, PageResult, PageSize};

const MAX_PAGE_BUTTONS: usize = 5;

/// The page currently shown in the dashboard table.
#[derive(Debug, Default)]
pub struct OpportunityList {
    opportunities: Vec<Opportunity>,
    current_page: usize,
    page_size: PageSize,
    total_items: usize,
    total_pages: usize,
    loading: bool,
    error: Option<String>,
    search_term: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationControls {
    pub current: usize,
    pub total_pages: usize,
    pub pages: Vec<usize>,
    pub first_enabled: bool,
    pub prev_enabled: bool,
    pub next_enabled: bool,
    pub last_enabled: bool,
}

impl OpportunityList {
    pub fn new(page_size: PageSize) -> Self {
        Self {
            current_page: 1,
            page_size,
            total_pages: 1,
            ..Self::default()
        }
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    pub fn total_items(&self) -> usize {
        self.total_items
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn opportunities(&self) -> &[Opportunity] {
        &self.opportunities
    }

    pub fn search_term(&self) -> &str {
        &self.search_term
    }

    pub fn set_search_term(&mut self, term: impl Into<String>) {
        self.search_term = term.into();
    }

    pub fn current_request(&self) -> PageRequest {
        PageRequest::new(self.current_page, self.page_size)
    }

    /// Marks a fetch for `request` as in flight and makes it the active page.
    pub fn begin_load(&mut self, request: PageRequest) -> PageRequest {
        self.current_page = request.page.max(1);
        self.page_size = request.page_size;
        self.loading = true;
        request
    }

    /// Applies a settled fetch. Returns a follow-up request when the active
    /// page no longer exists under the new totals.
    pub fn finish_load(
        &mut self,
        request: PageRequest,
        result: Result<PageResult, ApiError>,
    ) -> Option<PageRequest> {
        self.loading = false;
        match result {
            Ok(page) => {
                self.error = None;
                let mut rows = page.opportunities;
                rows.truncate(request.page_size.get());
                self.opportunities = rows;
                self.total_items = page.total_items;
                self.total_pages = page.total_pages.max(1);
                info!(
                    page = request.page,
                    rows = self.opportunities.len(),
                    total = self.total_items,
                    "page loaded"
                );
                if self.current_page > self.total_pages {
                    self.current_page = self.total_pages;
                    return Some(self.begin_load(self.current_request()));
                }
                None
            }
            Err(err) => {
                warn!(page = request.page, error = %err, "page load failed");
                self.error = Some(format!("Failed to retrieve data: {err}"));
                None
            }
        }
    }

    pub async fn load_page(
        &mut self,
        api: &dyn DashboardApi,
        page: usize,
        page_size: PageSize,
    ) -> Result<(), String> {
        let mut request = self.begin_load(PageRequest::new(page, page_size));
        loop {
            let result = api.fetch_page(request).await;
            match self.finish_load(request, result) {
                Some(next) => request = next,
                None => break,
            }
        }
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Page-size changes invalidate the offset, so the view returns to page 1.
    pub fn set_items_per_page(&mut self, page_size: PageSize) -> PageRequest {
        self.page_size = page_size;
        self.current_page = 1;
        self.current_request()
    }

    pub fn change_page(&mut self, page: usize) -> Option<PageRequest> {
        if page < 1 || page > self.total_pages || page == self.current_page {
            return None;
        }
        self.current_page = page;
        Some(self.current_request())
    }

    pub fn first_page(&mut self) -> Option<PageRequest> {
        self.change_page(1)
    }

    pub fn prev_page(&mut self) -> Option<PageRequest> {
        self.change_page(self.current_page.saturating_sub(1))
    }

    pub fn next_page(&mut self) -> Option<PageRequest> {
        self.change_page(self.current_page + 1)
    }

    pub fn last_page(&mut self) -> Option<PageRequest> {
        self.change_page(self.total_pages)
    }

    pub fn filter(&self, term: &str) -> Vec<&Opportunity> {
        let needle = term.trim().to_lowercase();
        self.opportunities
            .iter()
            .filter(|opp| needle.is_empty() || opp.matches(&needle))
            .collect()
    }

    pub fn visible(&self) -> Vec<&Opportunity> {
        self.filter(&self.search_term)
    }

    /// Row number of the `index`-th record on the active page.
    pub fn row_number(&self, index: usize) -> usize {
        (self.current_page - 1) * self.page_size.get() + index + 1
    }

    pub fn controls(&self) -> PaginationControls {
        let total_pages = self.total_pages.max(1);
        let current = self.current_page.clamp(1, total_pages);
        PaginationControls {
            current,
            total_pages,
            pages: pagination_window(current, total_pages).collect(),
            first_enabled: current > 1,
            prev_enabled: current > 1,
            next_enabled: current < total_pages,
            last_enabled: current < total_pages,
        }
    }
}

/// Up to five page numbers centered on `current`, shifted left near the end
/// so the full width shows whenever there are enough pages.
pub fn pagination_window(current: usize, total_pages: usize) -> std::ops::RangeInclusive<usize> {
    let total_pages = total_pages.max(1);
    let current = current.clamp(1, total_pages);
    let mut start = current.saturating_sub(MAX_PAGE_BUTTONS / 2).max(1);
    let end = (start + MAX_PAGE_BUTTONS - 1).min(total_pages);
    if end - start + 1 < MAX_PAGE_BUTTONS && start > 1 {
        start = (end + 1).saturating_sub(MAX_PAGE_BUTTONS).max(1);
    }
    start..=end
}
