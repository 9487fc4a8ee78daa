// Trading loop orchestration
pub mod book;
pub mod controller;

pub use book::{AccountBook, BookedFill, StaleOrder};
pub use controller::{CycleOutcome, CycleReport, CycleState, TradingLoopController};
