//! Model clients for knowbase.
//!
//! Knowledge bases depend on two external model services: an embedding model
//! that turns chunk text into vectors and an optional reranker that re-scores
//! recalled candidates. Both are reached through provider-agnostic traits.
//!
//! # Embedding providers
//! - **mock**: deterministic trigram hashing, no network (tests, offline use)
//! - **ollama**: local Ollama runtime (`/api/embed`)
//! - **openai**: any OpenAI-compatible `/embeddings` endpoint
//!
//! # Rerank providers
//! - **openai** / **siliconflow** / **vllm**: `{model, query, documents}` payloads
//! - **dashscope**: `{model, input, parameters}` payloads
//! - **mock**: token-overlap scoring

pub mod embeddings;
pub mod rerank;

pub use embeddings::{create_provider, EmbeddingConfig, EmbeddingProvider};
pub use rerank::{create_reranker, normalize_scores, RerankConfig, Reranker};
