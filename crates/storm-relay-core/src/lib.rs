#![doc = include_str!("../README.md")]

mod common;
pub use common::*;

pub mod channel;
pub mod context;
pub mod encoder;
pub mod generator;
mod pool;
pub mod runner;
pub mod store;

pub use channel::{ProgressHook, ProgressStream};
pub use context::{RequestContext, RequestId};
pub use encoder::{StreamChunk, encode_run, run_chunks};
pub use generator::{ArticleGenerator, TemplateGenerator};
pub use runner::{RunHandle, RunResult, RunnerConfig, TaskRunner};
pub use store::{ArtifactStore, MemoryStore, VirtualFile};
