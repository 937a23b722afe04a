//! # askdb
//!
//! A natural-language-to-SQL retrieval and generation harness. Given a
//! question and an optional hint, askdb retrieves matching column
//! values and catalog entries from two approximate indices, generates
//! SQL candidates through configured LLM engines, repairs the failing
//! ones, executes the best candidate, and narrates the result.
//!
//! ## Pipeline
//!
//! ```text
//! question ──▶ keywords ──▶ index lookups ──▶ schema text
//!                                               │
//!      narrate ◀── execute ◀── revise ◀── assess ◀── generate
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with fatal validation |
//! | [`error`] | Library error taxonomy |
//! | [`models`] | Core data types |
//! | [`backend`] | Database backend trait, factory, sqlite and mysql variants |
//! | [`minhash`] | MinHash signatures and banded LSH |
//! | [`values`] | Fuzzy value index |
//! | [`catalog`] | Semantic catalog index |
//! | [`embedding`] | Embedding providers and vector codecs |
//! | [`engine`] | LLM engine registry |
//! | [`retry`] | Retry policy and combinator |
//! | [`parse`] | Structured-output parsers |
//! | [`prompts`] | Prompt templates |
//! | [`history`] | Append-only run history |
//! | [`stage`] | Stage framework |
//! | [`keywords`] | Keyword extraction stage |
//! | [`generate`] | Candidate generation stage |
//! | [`revise`] | Revision loop |
//! | [`executor`] | Assessment and final execution |
//! | [`pipeline`] | Orchestrator and terminal stages |
//! | [`interface`] | Caller-facing harness |

pub mod backend;
pub mod catalog;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod executor;
pub mod generate;
pub mod history;
pub mod interface;
pub mod keywords;
pub mod minhash;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod prompts;
pub mod retry;
pub mod revise;
pub mod stage;
pub mod values;

pub use error::{AskdbError, Result};
pub use interface::Harness;
