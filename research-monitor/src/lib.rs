// Library interface for research-monitor modules
// This allows tests and the binary to import modules

pub mod digest;
pub mod executor;
pub mod item;
pub mod judge;
pub mod llm;
pub mod notify;
pub mod pipeline;
pub mod seen;
pub mod sources;

pub use digest::{DigestEntry, Enrichment};
pub use executor::{CallError, CancelBatch, ExecutorConfig, JudgeCall, RateLimitedBatchExecutor};
pub use item::{Item, ItemSource};
pub use judge::{InterestProfile, JudgeError, RelevanceJudge, Verdict};
pub use pipeline::{FilterPipeline, FilterReport, ScoredItem};
