//! AI operation runtime: dispatch, provider calls and the worker pool.
//!
//! The dispatcher admits requests against quota and persists `queued` jobs;
//! the worker pool executes them against an OpenAI-compatible provider and
//! settles quota, usage and results.

pub mod dispatcher;
pub mod llm;
pub mod openai;
pub mod worker;
pub mod writer;

pub use dispatcher::{DispatchSettings, Dispatcher, JobQueue, Services};
pub use llm::{Completion, CompletionClient, CompletionRequest, ProviderError};
pub use openai::{OpenAiClient, OpenAiClientConfig};
pub use worker::{JobWorker, WorkerError, WorkerEvent, WorkerHandle};
pub use writer::{EntityWriter, InMemoryEntityWriter, WriteError};
