pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod fetcher;
pub mod limiter;
pub mod matcher;
pub mod normalizer;
pub mod parser;
pub mod reasoning;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod scorer;
pub mod store;
pub mod types;

pub use config::PipelineConfig;
pub use coordinator::{CoordinatorSettings, PipelineCoordinator};
pub use dedup::{Deduplicator, Disposition, Verdict};
pub use fetcher::{FeedTransport, Fetcher, HttpTransport};
pub use limiter::RateLimiter;
pub use matcher::{ThemeMatchReport, ThemeMatcher, ThemeVocabulary};
pub use normalizer::Normalizer;
pub use parser::FeedParser;
pub use reasoning::{ClaudeReasoner, MockReasoner, ReasoningError, ReasoningRequest, ReasoningService, ReasoningTask};
pub use registry::SourceRegistry;
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
pub use scorer::{CallSettings, RelevanceScorer, ScoreScale};
pub use store::{SqliteStore, Storage};
pub use types::*;
