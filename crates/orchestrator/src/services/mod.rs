pub mod renderer;
pub mod worker;

pub use renderer::{FileTemplateRenderer, Renderer};
pub use worker::{CommandWorkerPool, WorkerContext, WorkerOutput, WorkerPool};
