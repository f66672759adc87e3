//! Drip sequences: multi-step outbound messaging where each recipient
//! walks an ordered list of delayed steps, with behavioral skip conditions
//! and a periodic scheduler that advances due runs.

pub mod analytics;
pub mod conditions;
pub mod dispatch;
pub mod engine;
pub mod feed;
pub mod lifecycle;
pub mod scheduler;
pub mod state_machine;
pub mod steps;
pub mod store;
pub mod types;

pub use conditions::ConditionEvaluator;
pub use dispatch::{Dispatcher, LoggingDispatcher};
pub use engine::SequenceEngine;
pub use feed::{ActivityFeed, InMemoryActivityFeed};
pub use lifecycle::SequenceManager;
pub use scheduler::SequenceScheduler;
pub use store::{InMemorySequenceStore, SequenceStore};
