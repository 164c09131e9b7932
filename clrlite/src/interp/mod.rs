//! The execution engine: given a linked [`crate::schema::assembly::Assembly`],
//! runs a chosen entry method by walking CIL a single instruction at a time,
//! with no ahead-of-time compilation step.

mod config;
mod errors;
mod exceptions;
mod frame;
mod interpreter;
mod invoker;
mod opcodes;
mod resolver;
mod scope;
mod statics;
mod value;

pub use config::Config;
pub use errors::{ExecOutcome, InterpError, ManagedException};
pub use interpreter::{interpret_call, interpret_generic_call, interpret_instance_call, Interpreter};
pub use scope::GenericScope;
pub use value::{Object, ObjectData, ObjectRef, Value};
