use std::error::Error;

/// Alias for boxed errors that can be sent across threads.
///
/// Used at trait-object boundaries (modules built through `BuildModule`,
/// swappable attention layers, causal language models), where the concrete
/// error type of the implementation is not known.
pub type BoxedError = Box<dyn Error + Send + Sync>;
