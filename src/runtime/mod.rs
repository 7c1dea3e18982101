pub mod context;
pub mod environment;
pub mod process;
pub mod shell;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{ContextState, ExecutionContext, ExecutionKind, ExecutionRecord};
pub use environment::InterpreterEnvironment;
pub use worker::{Interpreter, PythonWorker, WorkerSpec};
