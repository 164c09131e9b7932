//! Invokes a resolved method on a receiver with an argument vector, hiding
//! the interpreted-vs-native distinction from callers (spec §4.3).

use crate::interp::errors::{ExecOutcome, InterpError};
use crate::interp::interpreter::Interpreter;
use crate::interp::scope::GenericScope;
use crate::interp::value::Value;
use crate::raw::indices::metadata_token::MetadataTokenKind;
use crate::schema::method::Method;
use crate::schema::r#type::Type;

/// `true` for methods the invoker hands to the interpreter loop, `false` for
/// ones that must go through [`invoke_native`].
pub fn is_interpretable(method: &Method) -> bool {
	method.is_interpretable()
}

pub fn invoke<'l>(
	interp: &Interpreter<'l>,
	method: &'l Method<'l>,
	scope: GenericScope<'l>,
	receiver: Option<Value<'l>>,
	args: Vec<Value<'l>>,
) -> Result<Value<'l>, ExecOutcome<'l>> {
	if method.is_interpretable() {
		interp.execute(method, scope, receiver, args)
	} else {
		invoke_native(interp, method, receiver, args).map_err(ExecOutcome::Error)
	}
}

/// Virtual dispatch: selects the most-derived override of `method`'s slot in
/// `receiver_type`. Approximated, in the absence of a precomputed v-table, by
/// walking `receiver_type`'s ancestors from itself outward and returning the
/// first virtual method matching `method`'s name and parameter arity; falls
/// back to `method` itself if `receiver_type` overrides nothing (e.g. it's
/// the declaring type, or the override lives in a base we couldn't load).
pub fn resolve_virtual<'l>(method: &'l Method<'l>, receiver_type: &'l Type<'l>) -> &'l Method<'l> {
	if !method.is_virtual() {
		return method;
	}
	for ancestor in receiver_type.ancestors() {
		if let Some(found) = ancestor.methods().iter().find(|m| overrides(m, method)) {
			return found;
		}
	}
	method
}

fn overrides(candidate: &Method, base: &Method) -> bool {
	candidate.is_virtual()
		&& candidate.name().as_str() == base.name().as_str()
		&& candidate.parameters().len() == base.parameters().len()
}

/// Constrained virtual dispatch (`constrained.` prefix, spec §4.3): if
/// `constraint` is a value type that itself overrides `method`, dispatch
/// there without boxing `receiver`'s payload; otherwise fall back to ordinary
/// virtual dispatch (the caller is responsible for boxing first in that case).
pub fn resolve_constrained<'l>(method: &'l Method<'l>, constraint: &'l Type<'l>) -> &'l Method<'l> {
	if constraint.is_value_type() {
		if let Some(found) = constraint.methods().iter().find(|m| overrides(m, method)) {
			return found;
		}
	}
	resolve_virtual(method, constraint)
}

/// Dispatches a non-interpretable method: `InternalCall`/`PInvoke` bodies, or
/// (far more commonly in practice) calls whose target couldn't be resolved to
/// a `MethodDef` in this assembly at all because the call site references a
/// method in an unloaded assembly through a `MemberRef`.
///
/// Since cross-assembly loading is out of scope, the only such call handled
/// is the single most common one in compiled IL: a parameterless instance
/// constructor chaining to `System.Object::.ctor`, which does nothing. Any
/// other native call surfaces as a `MissingMethod` error naming the method.
fn invoke_native<'l>(
	_interp: &Interpreter<'l>,
	method: &'l Method<'l>,
	_receiver: Option<Value<'l>>,
	_args: Vec<Value<'l>>,
) -> Result<Value<'l>, InterpError> {
	Err(InterpError::MissingMethod(format!(
		"`{}` has no managed body and is not a recognized intrinsic",
		method.name().as_str()
	)))
}

/// `call`/`callvirt` targeting a `MemberRef` token is, in practice, almost
/// always a derived constructor chaining to its base's constructor — most
/// commonly `System.Object::.ctor`, which does nothing. Since cross-assembly
/// loading can't resolve the real target, the `call`/`callvirt` handlers
/// treat any `MemberRef`-addressed call as this no-op rather than failing
/// outright; see `DESIGN.md` for the tradeoff.
pub fn is_external_ctor_chain_call(kind: MetadataTokenKind) -> bool {
	matches!(kind, MetadataTokenKind::MemberRef)
}
