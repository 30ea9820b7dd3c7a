pub mod accumulator;
pub mod anthropic;
pub mod credential;
pub mod openai_compat;
pub mod registry;
pub mod traits;
pub(crate) mod sse;
pub(crate) mod util;

// Re-exports for convenience.
pub use credential::{CredentialProvider, NoAuth, StaticApiKey};
pub use registry::{ProviderRegistry, ResolvedProvider};
pub use traits::{LlmProvider, OnDelta, SamplingOverrides, TurnResult};
