use std::fmt::{Debug, Display, Formatter};

use crate::raw::indices::metadata_token::MetadataToken;
use crate::schema::ReadError;

/// Errors raised by the interpreter. Distinguishes invocation-time misuse,
/// resolution failures, and interpreter-internal faults from genuine managed
/// exceptions, which travel as [`crate::interp::value::Value::ObjRef`] through
/// the protected-region machinery instead of this type.
pub enum InterpError {
	/// The method has no body, is `InternalCall`/`PInvoke`, or the supplied
	/// argument count doesn't match its signature.
	InvalidArgument(String),
	TypeLoad(String),
	MissingMethod(String),
	MissingField(String),
	InvalidCast { value_type: String, target_type: String },
	NullReference,
	ArithmeticOverflow,
	DivideByZero,
	IndexOutOfRange,
	StackOverflow,
	/// Malformed or unsupported method body: unbalanced stack at `ret`,
	/// control flow running off the end, an opcode with no handler.
	InvalidProgram(String),
	Metadata(ReadError),
}

impl InterpError {
	pub fn invalid_program(method: &str, offset: u64, detail: impl Display) -> Self {
		InterpError::InvalidProgram(format!("{method}+0x{offset:X}: {detail}"))
	}

	pub fn unimplemented_opcode(name: &str) -> Self {
		InterpError::InvalidProgram(format!("opcode not implemented: {name}"))
	}

	pub fn missing_token(token: MetadataToken) -> Self {
		InterpError::MissingMethod(format!("unresolved {token:?}"))
	}
}

impl Display for InterpError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			InterpError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
			InterpError::TypeLoad(name) => write!(f, "could not load type `{name}`"),
			InterpError::MissingMethod(name) => write!(f, "missing method `{name}`"),
			InterpError::MissingField(name) => write!(f, "missing field `{name}`"),
			InterpError::InvalidCast { value_type, target_type } =>
				write!(f, "cannot cast `{value_type}` to `{target_type}`"),
			InterpError::NullReference => write!(f, "null reference"),
			InterpError::ArithmeticOverflow => write!(f, "arithmetic overflow"),
			InterpError::DivideByZero => write!(f, "divide by zero"),
			InterpError::IndexOutOfRange => write!(f, "index out of range"),
			InterpError::StackOverflow => write!(f, "stack overflow"),
			InterpError::InvalidProgram(msg) => write!(f, "invalid program: {msg}"),
			InterpError::Metadata(err) => write!(f, "metadata error: {err:?}"),
		}
	}
}

impl Debug for InterpError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		Display::fmt(self, f)
	}
}

impl std::error::Error for InterpError {}

impl From<ReadError> for InterpError {
	fn from(err: ReadError) -> Self {
		InterpError::Metadata(err)
	}
}

/// An escaped managed exception: the object thrown by `throw`/`rethrow` once
/// unwinding has exited the outermost frame, as opposed to `InterpError`,
/// which models faults the interpreter itself detects.
pub struct ManagedException<'l>(pub crate::interp::value::ObjectRef<'l>);

pub enum ExecOutcome<'l> {
	Error(InterpError),
	Thrown(ManagedException<'l>),
}

impl<'l> From<InterpError> for ExecOutcome<'l> {
	fn from(err: InterpError) -> Self {
		ExecOutcome::Error(err)
	}
}
