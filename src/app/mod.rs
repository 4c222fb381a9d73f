mod api;
mod crawl;
mod data_io;
mod listing;
mod runtime;
mod session;
mod state;
mod tui;
mod types;
mod ui_utils;

pub use runtime::run;
