// Market discovery module

pub mod scanner;
pub mod screen;

pub use scanner::{MarketScanner, ScanConfig, ScanSummary};
pub use screen::screen_market;
