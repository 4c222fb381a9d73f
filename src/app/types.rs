use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::api::ApiError;
use super::session::{LoginError, LoginOutcome};

pub const PLACEHOLDER: &str = "N/A";

#[derive(Debug, Parser, Clone)]
#[command(
    name = "samdash",
    version,
    about = "TUI dashboard for scraped SAM.gov procurement opportunities"
)]
pub struct Cli {
    #[arg(
        long,
        env = "SAMDASH_API_URL",
        value_name = "URL",
        default_value = "http://localhost:8888"
    )]
    pub api_url: String,

    #[arg(short, long, env = "SAMDASH_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "SAMDASH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Keep the session on disk instead of only for this process.
    #[arg(long, default_value_t = false)]
    pub remember: bool,

    #[arg(long, env = "SAMDASH_SESSION_FILE", value_name = "FILE")]
    pub session_file: Option<PathBuf>,

    #[arg(long, value_name = "N", default_value_t = 1)]
    pub page: usize,

    #[arg(long, value_name = "N", default_value = "10", value_parser = parse_page_size)]
    pub per_page: PageSize,

    #[arg(long, value_name = "TERM")]
    pub filter: Option<String>,

    /// Trigger a crawl for TERM before listing (headless mode).
    #[arg(long, value_name = "TERM")]
    pub crawl: Option<String>,

    #[arg(long, value_enum, default_value_t = CrawlerType::EightA)]
    pub crawler_type: CrawlerType,

    #[arg(long, value_name = "N", default_value_t = 1)]
    pub crawler_page_number: u32,

    #[arg(long, value_name = "N", default_value_t = 200)]
    pub crawler_page_size: u32,

    #[arg(long, value_name = "MS", default_value_t = 3000)]
    pub refresh_interval_ms: u64,

    #[arg(long, value_name = "N", default_value_t = 3)]
    pub refresh_attempts: usize,

    /// Download the server-side spreadsheet export (headless mode).
    #[arg(long, default_value_t = false)]
    pub export: bool,

    #[arg(long, value_name = "DIR", default_value = ".")]
    pub export_dir: PathBuf,

    #[arg(short, long, value_name = "FILE")]
    pub output: Option<String>,

    #[arg(long, value_enum, default_value_t = FileFormatArg::Csv)]
    pub format: FileFormatArg,

    #[arg(long, value_enum, default_value_t = ColumnSet::Standard)]
    pub columns: ColumnSet,

    #[arg(long, value_enum, default_value_t = DateStyle::Us)]
    pub date_style: DateStyle,

    /// Used when the server reports an expired password (headless mode).
    #[arg(long, hide_env_values = true, env = "SAMDASH_NEW_PASSWORD")]
    pub new_password: Option<String>,

    #[arg(long, default_value_t = false)]
    pub logout: bool,

    #[arg(long, env = "SAMDASH_LOG_FILE", value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub no_tui: bool,
}

impl Cli {
    pub fn dashboard_config(&self) -> DashboardConfig {
        DashboardConfig {
            crawler: CrawlerConfig {
                crawler_type: self.crawler_type,
                page_number: self.crawler_page_number.max(1),
                page_size: self.crawler_page_size.max(1),
            },
            refresh: RefreshPolicy {
                interval: Duration::from_millis(self.refresh_interval_ms),
                max_attempts: self.refresh_attempts.max(1),
            },
            page_size: self.per_page,
            columns: self.columns,
            date_style: self.date_style,
            export_dir: self.export_dir.clone(),
        }
    }
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum FileFormatArg {
    Csv,
    Json,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataFormat {
    Csv,
    Json,
}

impl From<FileFormatArg> for DataFormat {
    fn from(value: FileFormatArg) -> Self {
        match value {
            FileFormatArg::Csv => DataFormat::Csv,
            FileFormatArg::Json => DataFormat::Json,
        }
    }
}

/// Table layout. The extended set adds the notice/NAICS/location columns.
#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum ColumnSet {
    Standard,
    Extended,
}

impl ColumnSet {
    pub fn headers(self) -> &'static [&'static str] {
        match self {
            ColumnSet::Standard => &["#", "Title", "Published", "Response", "Link", "Department"],
            ColumnSet::Extended => &[
                "#",
                "Title",
                "Published",
                "Response",
                "Link",
                "Department",
                "Notice ID",
                "NAICS",
                "Location",
            ],
        }
    }
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum DateStyle {
    Us,
    Iso,
}

impl DateStyle {
    pub fn pattern(self) -> &'static str {
        match self {
            DateStyle::Us => "%m/%d/%Y",
            DateStyle::Iso => "%Y-%m-%d",
        }
    }
}

/// Items-per-page choices offered by the list view.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum PageSize {
    #[default]
    Ten,
    Twenty,
    Fifty,
    Hundred,
}

impl PageSize {
    pub const ALL: [PageSize; 4] = [
        PageSize::Ten,
        PageSize::Twenty,
        PageSize::Fifty,
        PageSize::Hundred,
    ];

    pub fn get(self) -> usize {
        match self {
            PageSize::Ten => 10,
            PageSize::Twenty => 20,
            PageSize::Fifty => 50,
            PageSize::Hundred => 100,
        }
    }

    pub fn cycle(self) -> Self {
        match self {
            PageSize::Ten => PageSize::Twenty,
            PageSize::Twenty => PageSize::Fifty,
            PageSize::Fifty => PageSize::Hundred,
            PageSize::Hundred => PageSize::Ten,
        }
    }
}

impl TryFrom<usize> for PageSize {
    type Error = String;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        PageSize::ALL
            .into_iter()
            .find(|size| size.get() == value)
            .ok_or_else(|| format!("page size must be one of 10, 20, 50, 100 (got {value})"))
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

fn parse_page_size(raw: &str) -> Result<PageSize, String> {
    let value = raw
        .trim()
        .parse::<usize>()
        .map_err(|err| format!("invalid page size '{raw}': {err}"))?;
    PageSize::try_from(value)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: PageSize,
}

impl PageRequest {
    pub fn new(page: usize, page_size: PageSize) -> Self {
        Self {
            page: page.max(1),
            page_size,
        }
    }

    pub fn first(page_size: PageSize) -> Self {
        Self::new(1, page_size)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub opportunities: Vec<Opportunity>,
    pub total_items: usize,
    pub total_pages: usize,
}

impl PageResult {
    /// Builds a page from a listing response. Without server pagination the
    /// whole listing is sliced locally; rows beyond the page size are dropped.
    pub fn from_listing(
        opportunities: Vec<Opportunity>,
        pagination: Option<PaginationMeta>,
        request: PageRequest,
    ) -> Self {
        let size = request.page_size.get();
        match pagination {
            Some(meta) => {
                let total_items = meta.total.unwrap_or(opportunities.len() as u64) as usize;
                let total_pages = meta
                    .pages
                    .map(|pages| pages as usize)
                    .unwrap_or_else(|| total_items.div_ceil(size))
                    .max(1);
                let mut opportunities = opportunities;
                opportunities.truncate(size);
                Self {
                    opportunities,
                    total_items,
                    total_pages,
                }
            }
            None => {
                let total_items = opportunities.len();
                let total_pages = total_items.div_ceil(size).max(1);
                let offset = (request.page - 1).saturating_mul(size);
                let opportunities = opportunities.into_iter().skip(offset).take(size).collect();
                Self {
                    opportunities,
                    total_items,
                    total_pages,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub struct PaginationMeta {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub pages: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub solicitation: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub publish_date: Option<String>,
    #[serde(default)]
    pub response_date: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub notice_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub naics: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

impl Opportunity {
    /// Title, falling back to the solicitation name.
    pub fn headline(&self) -> Option<&str> {
        non_blank(self.title.as_deref()).or_else(|| non_blank(self.solicitation.as_deref()))
    }

    pub fn display_title(&self) -> &str {
        self.headline().unwrap_or(PLACEHOLDER)
    }

    pub fn display_department(&self) -> &str {
        non_blank(self.department.as_deref()).unwrap_or(PLACEHOLDER)
    }

    pub fn display_link(&self) -> &str {
        non_blank(self.link.as_deref()).unwrap_or(PLACEHOLDER)
    }

    pub fn display_notice_id(&self) -> &str {
        non_blank(self.notice_id.as_deref()).unwrap_or(PLACEHOLDER)
    }

    pub fn display_naics(&self) -> &str {
        non_blank(self.naics.as_deref()).unwrap_or(PLACEHOLDER)
    }

    pub fn display_location(&self) -> String {
        match (
            non_blank(self.city.as_deref()),
            non_blank(self.state.as_deref()),
        ) {
            (Some(city), Some(state)) => format!("{city}, {state}"),
            (Some(only), None) | (None, Some(only)) => only.to_string(),
            (None, None) => PLACEHOLDER.to_string(),
        }
    }

    pub fn matches(&self, needle_lower: &str) -> bool {
        let title_hit = self
            .headline()
            .is_some_and(|title| title.to_lowercase().contains(needle_lower));
        title_hit
            || self
                .description
                .as_deref()
                .is_some_and(|text| text.to_lowercase().contains(needle_lower))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Crawler families the backend knows how to scrape.
#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrawlerType {
    #[value(name = "8a")]
    #[serde(rename = "8A")]
    EightA,
    #[value(name = "rp")]
    #[serde(rename = "RP")]
    SourcesSought,
    #[value(name = "o")]
    #[serde(rename = "O")]
    Solicitation,
    #[value(name = "wosb")]
    #[serde(rename = "WOSB")]
    WomenOwned,
}

impl CrawlerType {
    pub fn code(self) -> &'static str {
        match self {
            CrawlerType::EightA => "8A",
            CrawlerType::SourcesSought => "RP",
            CrawlerType::Solicitation => "O",
            CrawlerType::WomenOwned => "WOSB",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CrawlerType::EightA => "8A Program Contracts",
            CrawlerType::SourcesSought => "Sources Sought / Presolicitation",
            CrawlerType::Solicitation => "Solicitation",
            CrawlerType::WomenOwned => "WOSB / EDWOSB",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlerConfig {
    pub crawler_type: CrawlerType,
    pub page_number: u32,
    pub page_size: u32,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            crawler_type: CrawlerType::EightA,
            page_number: 1,
            page_size: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlRequest {
    #[serde(rename = "type")]
    pub crawler_type: CrawlerType,
    #[serde(rename = "pageNumber")]
    pub page_number: u32,
    #[serde(rename = "pageSize")]
    pub page_size: u32,
    pub params: String,
}

impl CrawlRequest {
    pub fn new(config: &CrawlerConfig, term: &str) -> Self {
        Self {
            crawler_type: config.crawler_type,
            page_number: config.page_number,
            page_size: config.page_size,
            params: term.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub interval: Duration,
    pub max_attempts: usize,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub crawler: CrawlerConfig,
    pub refresh: RefreshPolicy,
    pub page_size: PageSize,
    pub columns: ColumnSet,
    pub date_style: DateStyle,
    pub export_dir: PathBuf,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlerConfig::default(),
            refresh: RefreshPolicy::default(),
            page_size: PageSize::Ten,
            columns: ColumnSet::Standard,
            date_style: DateStyle::Us,
            export_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    UserRequested,
    SessionExpired,
}

/// Results flowing from network tasks back to the UI loop.
#[derive(Debug)]
pub enum AppEvent {
    PageLoaded {
        request: PageRequest,
        result: Result<PageResult, ApiError>,
    },
    CrawlSettled {
        term: String,
        result: Result<(), ApiError>,
    },
    RefreshAttempt {
        attempt: usize,
        request: PageRequest,
        result: Result<PageResult, ApiError>,
    },
    ExportFinished(Result<PathBuf, ApiError>),
    LoginFinished(Result<LoginOutcome, LoginError>),
    PasswordChanged(Result<(), ApiError>),
    SignedOut(SignOutReason),
    Status(String),
}
