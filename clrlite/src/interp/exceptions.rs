//! Protected-region scanning for `throw`/`leave`/`rethrow` (spec §4.5).
//!
//! Only interpreted exception objects already materialized by the executing
//! assembly (via `newobj`, the common case for user-defined exception types)
//! are catchable here. Faults whose canonical exception type lives in a
//! referenced assembly that cross-assembly loading can't reach (e.g. the
//! BCL's `System.NullReferenceException`) surface as [`InterpError`] instead
//! — see the static-constructor/`TypeRef` scope note in `DESIGN.md`.

use crate::interp::errors::InterpError;
use crate::interp::frame::Frame;
use crate::interp::resolver::Resolver;
use crate::interp::scope::GenericScope;
use crate::interp::value::ObjectRef;
use crate::raw::il::ExceptionClauseFlags;
use crate::raw::indices::metadata_token::MetadataToken;

#[derive(Debug)]
pub enum Handler {
	/// Transfer control to a `catch`/`filter` handler with the exception as
	/// the sole stack value.
	Catch { handler_offset: u64 },
	/// Run a `finally`/`fault` block, then keep unwinding.
	Finally { handler_offset: u64 },
}

/// Scans `frame`'s exception table, innermost region first, for a handler
/// covering `at_offset` (the offset the fault or `throw` occurred at) that
/// catches `exception`. `skip` lets the caller resume scanning outward past
/// regions already tried (e.g. after running their `finally`).
///
/// `filter` clauses are not evaluated — doing so requires running the filter
/// expression as interpreted code with the exception as its sole input, which
/// would require re-entering the interpreter loop from here. They're treated
/// as non-matching, which only under-catches relative to real CLR semantics.
pub fn find_handler<'l>(
	frame: &Frame<'l>,
	at_offset: u64,
	exception: &ObjectRef<'l>,
	resolver: &Resolver<'l>,
	scope: &GenericScope<'l>,
	skip: usize,
) -> Result<Option<Handler>, InterpError> {
	for &idx in frame.regions_enclosing(at_offset).iter().skip(skip) {
		let clause = frame.exception_clauses()[idx];
		tracing::trace!(region = idx, handler_offset = clause.handler_offset, "scanning protected region");
		if clause.flags.contains(ExceptionClauseFlags::FINALLY) || clause.flags.contains(ExceptionClauseFlags::FAULT) {
			return Ok(Some(Handler::Finally { handler_offset: clause.handler_offset as u64 }));
		}
		if clause.flags.contains(ExceptionClauseFlags::FILTER) {
			continue;
		}

		let Ok(token) = MetadataToken::try_from(clause.class_token) else { continue };
		let target = resolver.resolve_type(token, scope)?;
		if exception.ty.is_assignable_to(target) {
			return Ok(Some(Handler::Catch { handler_offset: clause.handler_offset as u64 }));
		}
	}
	Ok(None)
}

/// `finally` regions that lexically enclose `from_offset` but not
/// `to_offset`, innermost first: exactly the set `leave` must run before
/// jumping (spec §4.5: "`leave`... runs intervening `finally` blocks in
/// lexical nesting order before jumping to its target").
pub fn finally_regions_for_leave<'l>(frame: &Frame<'l>, from_offset: u64, to_offset: u64) -> Vec<u64> {
	let to_offset = to_offset as u32;
	frame.regions_enclosing(from_offset).into_iter()
		.map(|idx| frame.exception_clauses()[idx])
		.filter(|c| c.flags.contains(ExceptionClauseFlags::FINALLY))
		.filter(|c| to_offset < c.try_offset || to_offset >= c.try_offset + c.try_length)
		.map(|c| c.handler_offset as u64)
		.collect()
}

#[cfg(test)]
mod tests {
	use bumpalo::Bump;

	use crate::interp::value::Object;
	use crate::raw::heaps::table::{MethodAttributes, MethodImplAttributes};
	use crate::raw::indices::metadata_token::MethodDef;
	use crate::raw::il::ExceptionClause;
	use crate::schema::assembly::Assembly;
	use crate::schema::method::{Method, MethodBody};
	use crate::schema::r#type::Type;
	use crate::schema::{intern_test_code, intern_test_name, DataPool};

	use super::*;

	fn method_with_clauses<'l>(bump: &'l Bump, declaring_type: &'l Type<'l>, clauses: &'l [ExceptionClause]) -> &'l Method<'l> {
		let body = MethodBody {
			max_stack_size: 1,
			init_locals: true,
			locals: &[],
			code: intern_test_code(bump, &[0x2A]), // ret
			exception_clauses: clauses,
		};
		bump.alloc(Method {
			metadata_token: MethodDef(1),
			name: intern_test_name(bump, "Try"),
			attributes: MethodAttributes::STATIC,
			impl_attributes: MethodImplAttributes::empty(),
			declaring_type,
			parameters: &[],
			return_type: declaring_type,
			generic_arity: 0,
			body: Some(body),
		})
	}

	#[test]
	fn finally_regions_run_innermost_first() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let declaring_type = Type::for_test(&bump, pool.types(), "Program", "", false, None);

		let clauses = bump.alloc_slice_copy(&[
			ExceptionClause { flags: ExceptionClauseFlags::FINALLY, try_offset: 0, try_length: 20, handler_offset: 100, handler_length: 5, class_token: 0, filter_offset: 0 },
			ExceptionClause { flags: ExceptionClauseFlags::FINALLY, try_offset: 5, try_length: 5, handler_offset: 200, handler_length: 5, class_token: 0, filter_offset: 0 },
		]);
		let method = method_with_clauses(&bump, declaring_type, clauses);
		let frame = Frame::new(method, GenericScope::empty(), None, vec![]);

		let order = finally_regions_for_leave(&frame, 7, 50);
		assert_eq!(order, vec![200, 100], "innermost (narrowest) try region's finally must run first");
	}

	#[test]
	fn finally_regions_skip_the_block_being_left_into() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let declaring_type = Type::for_test(&bump, pool.types(), "Program", "", false, None);

		let clauses = bump.alloc_slice_copy(&[
			ExceptionClause { flags: ExceptionClauseFlags::FINALLY, try_offset: 0, try_length: 20, handler_offset: 100, handler_length: 5, class_token: 0, filter_offset: 0 },
		]);
		let method = method_with_clauses(&bump, declaring_type, clauses);
		let frame = Frame::new(method, GenericScope::empty(), None, vec![]);

		// Leaving to a target still inside the same try region must not run it.
		let order = finally_regions_for_leave(&frame, 7, 10);
		assert!(order.is_empty());
	}

	#[test]
	fn fault_clause_is_a_finally_handler_with_no_type_check() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let declaring_type = Type::for_test(&bump, pool.types(), "Program", "", false, None);

		let clauses = bump.alloc_slice_copy(&[
			ExceptionClause { flags: ExceptionClauseFlags::FAULT, try_offset: 0, try_length: 10, handler_offset: 42, handler_length: 5, class_token: 0, filter_offset: 0 },
		]);
		let method = method_with_clauses(&bump, declaring_type, clauses);
		let frame = Frame::new(method, GenericScope::empty(), None, vec![]);

		let assembly = Assembly::for_test(&pool, &bump, &[], &[]);
		let resolver = Resolver::new(&assembly);
		let exception = Object::new_instance(declaring_type);

		match find_handler(&frame, 3, &exception, &resolver, &GenericScope::empty(), 0).unwrap() {
			Some(Handler::Finally { handler_offset }) => assert_eq!(handler_offset, 42),
			other => panic!("expected a Finally handler, got {other:?}"),
		}
	}

	#[test]
	fn catch_clause_matches_an_assignable_exception_type() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let exception_type = Type::for_test(&bump, pool.types(), "MyException", "", false, None);
		let types = bump.alloc_slice_copy(&[exception_type]);

		let declaring_type = Type::for_test(&bump, pool.types(), "Program", "", false, None);
		let class_token = (0x02u32 << 24) | 1; // TypeDef(1), matching `types[0]`'s 1-based row.
		let clauses = bump.alloc_slice_copy(&[
			ExceptionClause { flags: ExceptionClauseFlags::EXCEPTION, try_offset: 0, try_length: 10, handler_offset: 50, handler_length: 5, class_token, filter_offset: 0 },
		]);
		let method = method_with_clauses(&bump, declaring_type, clauses);
		let frame = Frame::new(method, GenericScope::empty(), None, vec![]);

		let assembly = Assembly::for_test(&pool, &bump, &[], types);
		let resolver = Resolver::new(&assembly);
		let exception = Object::new_instance(exception_type);

		match find_handler(&frame, 3, &exception, &resolver, &GenericScope::empty(), 0).unwrap() {
			Some(Handler::Catch { handler_offset }) => assert_eq!(handler_offset, 50),
			other => panic!("expected a Catch handler, got {other:?}"),
		}
	}

	#[test]
	fn no_enclosing_region_yields_no_handler() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let declaring_type = Type::for_test(&bump, pool.types(), "Program", "", false, None);
		let method = method_with_clauses(&bump, declaring_type, &[]);
		let frame = Frame::new(method, GenericScope::empty(), None, vec![]);

		let assembly = Assembly::for_test(&pool, &bump, &[], &[]);
		let resolver = Resolver::new(&assembly);
		let exception = Object::new_instance(declaring_type);

		assert!(find_handler(&frame, 3, &exception, &resolver, &GenericScope::empty(), 0).unwrap().is_none());
	}
}
