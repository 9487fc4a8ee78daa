// Order execution and position bookkeeping
pub mod executor;
pub mod position_tracker;
pub mod retry;

pub use executor::{Execution, OrderExecutor, Remainder};
pub use position_tracker::{EntryFill, ExitInstruction, PositionTracker};
pub use retry::{ExponentialBackoff, RetryPolicy};
