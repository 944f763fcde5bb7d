pub mod functions;
pub mod registry;

pub use functions::FunctionRegistry;
pub use registry::ToolRegistry;
