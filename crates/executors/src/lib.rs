pub mod executors;

pub use executors::{
    ActionContext, ActionExecutor, ExecutorError, LoggingExecutor, MockExecutor,
    RecommendedAction,
};
