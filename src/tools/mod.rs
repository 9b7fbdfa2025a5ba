pub mod executor;
pub mod python;
pub mod registry;
pub mod schema;
pub mod web;
pub mod wolfram;

pub use executor::ToolExecutor;
pub use python::PythonArgs;
pub use registry::{
    parse_arguments, ToolContext, ToolError, ToolInvocation, ToolRegistry, PYTHON_TOOL, WEB_TOOL, WOLFRAM_TOOL,
};
pub use schema::{parameters_schema, tool_names, FunctionSpec, ToolSpec};
pub use web::{PerplexityLookup, WebArgs, WebLookup};
pub use wolfram::{WolframAlpha, WolframArgs, WolframClient};
