//! Per-invocation execution context (spec §3's "Frame context").

use std::cell::RefCell;
use std::rc::Rc;

use crate::interp::scope::GenericScope;
use crate::interp::value::Value;
use crate::raw::il::ExceptionClause;
use crate::schema::method::Method;
use crate::schema::r#type::Type;

/// A protected region (`try`) currently entered, tracked so `leave` can run
/// intervening `finally` blocks in lexical nesting order and `throw` can scan
/// outward for a matching handler (spec §4.5).
#[derive(Clone, Copy)]
pub struct ActiveRegion {
	pub clause_index: usize,
}

pub struct Frame<'l> {
	pub method: &'l Method<'l>,
	pub scope: GenericScope<'l>,
	pub receiver: Option<Value<'l>>,
	pub args: Vec<Rc<RefCell<Value<'l>>>>,
	pub locals: Vec<Rc<RefCell<Value<'l>>>>,
	pub stack: Vec<Value<'l>>,
	pub protected_regions: Vec<ActiveRegion>,
	pub cursor: u64,
	/// Set by `throw`/`rethrow` while unwinding lets the handler examine the
	/// currently active exception (e.g. for `rethrow`, or a `filter` block).
	pub active_exception: Option<crate::interp::value::ObjectRef<'l>>,
	/// Set by the `constrained.` prefix for the following `callvirt`, cleared
	/// once consumed.
	pub constrained_type: Option<&'l Type<'l>>,
	/// While a `leave` is running the `finally` chain it jumps through, the
	/// ultimate target it's still heading for.
	pub pending_leave_target: Option<u64>,
	/// Remaining `finally` handler offsets a `leave` still has to run, in
	/// order, before jumping to `pending_leave_target`.
	pub leave_finally_queue: Vec<u64>,
	/// While unwinding for a thrown exception, the offset the fault occurred
	/// at (fixed for the whole unwind) and how many enclosing regions have
	/// already been tried, so `endfinally` can resume scanning further out.
	pub unwind: Option<(u64, usize)>,
}

impl<'l> Frame<'l> {
	pub fn new(
		method: &'l Method<'l>,
		scope: GenericScope<'l>,
		receiver: Option<Value<'l>>,
		arguments: Vec<Value<'l>>,
	) -> Self {
		let args = arguments.into_iter().map(|v| Rc::new(RefCell::new(v))).collect();
		let locals = match method.body() {
			Some(body) => body.locals.iter().map(|ty| Rc::new(RefCell::new(Value::default_for(ty)))).collect(),
			None => Vec::new(),
		};
		Self {
			method,
			scope,
			receiver,
			args,
			locals,
			stack: Vec::new(),
			protected_regions: Vec::new(),
			cursor: 0,
			active_exception: None,
			constrained_type: None,
			pending_leave_target: None,
			leave_finally_queue: Vec::new(),
			unwind: None,
		}
	}

	pub fn push(&mut self, value: Value<'l>) {
		self.stack.push(value);
	}

	pub fn pop(&mut self) -> Option<Value<'l>> {
		self.stack.pop()
	}

	pub fn exception_clauses(&self) -> &'l [ExceptionClause] {
		self.method.body().map(|b| b.exception_clauses).unwrap_or(&[])
	}

	/// Active protected regions enclosing bytecode offset `offset`, as defined
	/// by the method's exception-handling table (ECMA-335 §II.25.4.6),
	/// innermost first.
	pub fn regions_enclosing(&self, offset: u64) -> Vec<usize> {
		let offset = offset as u32;
		let mut enclosing: Vec<usize> = self.exception_clauses().iter().enumerate()
			.filter(|(_, c)| offset >= c.try_offset && offset < c.try_offset + c.try_length)
			.map(|(i, _)| i)
			.collect();
		enclosing.sort_by_key(|&i| self.exception_clauses()[i].try_length);
		enclosing
	}
}
