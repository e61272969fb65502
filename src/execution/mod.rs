// Order lifecycle and position management module
pub mod exit_engine;
pub mod fill_consumer;
pub mod order_tracker;
pub mod orchestrator;
pub mod portfolio;

pub use exit_engine::{ExitConfig, ExitEngine, ExitPriority, ExitReason, ExitTrigger, TickOutcome};
pub use fill_consumer::FillConsumer;
pub use order_tracker::{OrderTracker, PendingFill, PollSummary};
pub use orchestrator::{Orchestrator, TradeOutcome};
pub use portfolio::{apply_fill, BookStats, LedgerError, LedgerUpdate, PositionBook};
