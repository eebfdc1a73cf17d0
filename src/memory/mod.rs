// src/memory/mod.rs
// The memory pipeline: compress -> store -> retrieve -> fuse -> build -> limit

pub mod builder;
pub mod compressor;
pub mod fuser;
pub mod injector;
pub mod limiter;
pub mod retriever;
pub mod types;

pub use builder::{BuilderConfig, BuiltPrompt, PromptBuilder};
pub use compressor::{CompressionRequest, CompressionResult, SemanticCompressor};
pub use fuser::{FusedMemory, FusionConfig, MemoryFuser};
pub use injector::{ContextInjector, InjectionMode, InjectionRequest, InjectionResponse};
pub use limiter::{LimitedContent, LimiterConfig, PriorityLevel, TokenLimiter, TruncationStrategy};
pub use retriever::{RetrievalRequest, RetrievalResult, SemanticRetriever};
pub use types::{
    Conversation, MatchType, MemoryUnit, MemoryUnitType, Message, MessageType, SearchResult,
};
