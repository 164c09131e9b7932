//! The interpreter loop (spec §4.6): fetches one instruction at a time from
//! the current frame's cursor, dispatches it to [`opcodes::execute`], and
//! handles the control-flow events (`ret`, thrown exceptions, `endfinally`)
//! that the per-opcode handlers can't resolve on their own.

use std::cell::Cell;
use std::io::Cursor;

use crate::interp::config::Config;
use crate::interp::errors::{ExecOutcome, InterpError, ManagedException};
use crate::interp::exceptions::{self, Handler};
use crate::interp::frame::Frame;
use crate::interp::invoker;
use crate::interp::opcodes::{self, Step};
use crate::interp::resolver::Resolver;
use crate::interp::scope::GenericScope;
use crate::interp::statics::StaticsTable;
use crate::interp::value::Value;
use crate::raw::il::OpCode;
use crate::schema::assembly::Assembly;
use crate::schema::method::Method;
use crate::schema::r#type::{Type, TypePool};

pub struct Interpreter<'l> {
	assembly: &'l Assembly<'l>,
	resolver: Resolver<'l>,
	statics: StaticsTable<'l>,
	config: Config,
	depth: Cell<usize>,
}

impl<'l> Interpreter<'l> {
	pub fn new(assembly: &'l Assembly<'l>) -> Self {
		Self::with_config(assembly, Config::default())
	}

	pub fn with_config(assembly: &'l Assembly<'l>, config: Config) -> Self {
		Self {
			assembly,
			resolver: Resolver::new(assembly),
			statics: StaticsTable::new(),
			config,
			depth: Cell::new(0),
		}
	}

	pub fn assembly(&self) -> &'l Assembly<'l> {
		self.assembly
	}

	pub fn resolver(&self) -> &Resolver<'l> {
		&self.resolver
	}

	pub fn statics(&self) -> &StaticsTable<'l> {
		&self.statics
	}

	pub fn types(&self) -> &'l TypePool<'l> {
		self.assembly.data_pool().types()
	}

	/// Runs `ty`'s static constructor exactly once per type, the first time
	/// any code belonging to it would observe its statics (spec §5): before a
	/// static field access, and (conservatively, since the schema doesn't
	/// flag `BeforeFieldInit`) before entering any of its methods.
	pub fn ensure_cctor(&self, ty: &'l Type<'l>, scope: GenericScope<'l>) -> Result<(), ExecOutcome<'l>> {
		let Some(cctor) = ty.methods().iter().find(|m| m.name().as_str() == ".cctor") else {
			return Ok(());
		};
		if !self.statics.begin_cctor(ty) {
			return Ok(());
		}
		let result = invoker::invoke(self, cctor, scope, None, Vec::new());
		self.statics.finish_cctor(ty);
		result.map(|_| ())
	}

	/// The three `interpret_call` arities (spec §6) all funnel through this:
	/// resolve nothing further, just run `method` with the given receiver,
	/// arguments, and generic bindings.
	pub fn execute(
		&self,
		method: &'l Method<'l>,
		scope: GenericScope<'l>,
		receiver: Option<Value<'l>>,
		args: Vec<Value<'l>>,
	) -> Result<Value<'l>, ExecOutcome<'l>> {
		if !method.is_interpretable() {
			return Err(InterpError::InvalidArgument(format!(
				"`{}` has no managed CIL body",
				method.name().as_str()
			)).into());
		}
		if args.len() != method.parameters().len() {
			return Err(InterpError::InvalidArgument(format!(
				"`{}` expects {} argument(s), got {}",
				method.name().as_str(),
				method.parameters().len(),
				args.len()
			)).into());
		}
		if receiver.is_none() && !method.is_static() {
			return Err(InterpError::InvalidArgument(format!(
				"`{}` is an instance method but no receiver was supplied",
				method.name().as_str()
			)).into());
		}

		let depth = self.depth.get();
		if depth >= self.config.max_call_depth {
			return Err(InterpError::StackOverflow.into());
		}
		self.depth.set(depth + 1);
		let result = self.run(method, scope, receiver, args);
		self.depth.set(depth);
		result
	}

	#[tracing::instrument(skip_all, fields(method = %method.name().as_str(), depth = self.depth.get()))]
	fn run(
		&self,
		method: &'l Method<'l>,
		scope: GenericScope<'l>,
		receiver: Option<Value<'l>>,
		args: Vec<Value<'l>>,
	) -> Result<Value<'l>, ExecOutcome<'l>> {
		self.ensure_cctor(method.declaring_type(), scope.clone())?;

		let mut frame = Frame::new(method, scope, receiver, args);
		let code: &[u8] = &method.body().expect("checked interpretable above").code;

		loop {
			if (frame.cursor as usize) >= code.len() {
				return Err(InterpError::invalid_program(
					method.name().as_str(),
					frame.cursor,
					"control fell off the end of the method body without a `ret`",
				).into());
			}

			let offset = frame.cursor;
			let mut cursor = Cursor::new(code);
			cursor.set_position(offset);
			let opcode = OpCode::read(&mut cursor, &()).map_err(|e| InterpError::invalid_program(
				method.name().as_str(),
				offset,
				format_args!("malformed instruction: {e}"),
			))?;
			let next = cursor.position();

			match opcodes::execute(self, &mut frame, &opcode, offset, next) {
				Ok(Step::Return(value)) => {
					if !frame.stack.is_empty() {
						return Err(InterpError::invalid_program(
							method.name().as_str(),
							offset,
							"evaluation stack not empty at `ret`",
						).into());
					}
					return Ok(value);
				}
				Ok(Step::Continue) => {
					if matches!(opcode, OpCode::endfinally) {
						self.resume_after_finally(&mut frame)?;
					}
				}
				Err(ExecOutcome::Thrown(ManagedException(exc))) => {
					frame.active_exception = Some(exc.clone());
					match exceptions::find_handler(&frame, offset, &exc, &self.resolver, &frame.scope, 0)
						.map_err(ExecOutcome::Error)?
					{
						Some(Handler::Finally { handler_offset }) => {
							frame.unwind = Some((offset, 1));
							frame.cursor = handler_offset;
						}
						Some(Handler::Catch { handler_offset }) => {
							frame.stack.clear();
							frame.push(Value::ObjRef(Some(exc)));
							frame.cursor = handler_offset;
						}
						None => return Err(ExecOutcome::Thrown(ManagedException(exc))),
					}
				}
				Err(err @ ExecOutcome::Error(_)) => return Err(err),
			}
		}
	}

	/// Runs after `endfinally` returns control to the driving loop: resumes
	/// whichever of `leave`'s finally chain or an exception unwind was
	/// waiting on this block, or does nothing if it was neither (a `finally`
	/// block that simply fell through with no pending transfer).
	fn resume_after_finally(&self, frame: &mut Frame<'l>) -> Result<(), ExecOutcome<'l>> {
		if let Some(next_offset) = frame.leave_finally_queue.pop() {
			frame.cursor = next_offset;
			return Ok(());
		}
		if let Some(target) = frame.pending_leave_target.take() {
			frame.cursor = target;
			return Ok(());
		}
		if let Some((origin, skip)) = frame.unwind.take() {
			let exc = frame.active_exception.clone().expect("unwind in progress without an active exception");
			match exceptions::find_handler(frame, origin, &exc, &self.resolver, &frame.scope, skip)
				.map_err(ExecOutcome::Error)?
			{
				Some(Handler::Finally { handler_offset }) => {
					frame.unwind = Some((origin, skip + 1));
					frame.cursor = handler_offset;
				}
				Some(Handler::Catch { handler_offset }) => {
					frame.stack.clear();
					frame.push(Value::ObjRef(Some(exc)));
					frame.cursor = handler_offset;
				}
				None => return Err(ExecOutcome::Thrown(ManagedException(exc))),
			}
		}
		Ok(())
	}
}

/// Entry points matching spec §6's three `interpret_call` arities. All three
/// share the same underlying [`Interpreter::execute`]; they only differ in
/// how much generic/receiver context the caller has to supply.
pub fn interpret_call<'l>(
	interp: &Interpreter<'l>,
	method: &'l Method<'l>,
	args: Vec<Value<'l>>,
) -> Result<Value<'l>, ExecOutcome<'l>> {
	interp.execute(method, GenericScope::empty(), None, args)
}

pub fn interpret_instance_call<'l>(
	interp: &Interpreter<'l>,
	method: &'l Method<'l>,
	receiver: Value<'l>,
	args: Vec<Value<'l>>,
) -> Result<Value<'l>, ExecOutcome<'l>> {
	interp.execute(method, GenericScope::empty(), Some(receiver), args)
}

pub fn interpret_generic_call<'l>(
	interp: &Interpreter<'l>,
	method: &'l Method<'l>,
	scope: GenericScope<'l>,
	receiver: Option<Value<'l>>,
	args: Vec<Value<'l>>,
) -> Result<Value<'l>, ExecOutcome<'l>> {
	interp.execute(method, scope, receiver, args)
}

#[cfg(test)]
mod tests {
	use std::rc::Rc;

	use bumpalo::Bump;

	use crate::raw::heaps::table::{MethodAttributes, MethodImplAttributes};
	use crate::raw::il::{ExceptionClause, ExceptionClauseFlags};
	use crate::raw::indices::metadata_token::{MetadataToken, MethodDef};
	use crate::interp::value::{Object, ObjectData, values_structurally_equal};
	use crate::schema::method::MethodBody;
	use crate::schema::r#type::{Field, PrimitiveType};
	use crate::schema::{intern_test_code, intern_test_name, DataPool};

	use super::*;

	/// `n > 1 ? n * Factorial(n - 1) : 1`, recursing through a real `call`
	/// opcode against the method's own `MethodDef(1)` token.
	const FACTORIAL_BODY: [u8; 17] = [
		0x02, 0x17, 0x30, 0x02, 0x17, 0x2A, // ldarg.0; ldc.i4.1; bgt.s +2; ldc.i4.1; ret
		0x02, 0x02, 0x17, 0x59, // ldarg.0; ldarg.0; ldc.i4.1; sub
		0x28, 0x01, 0x00, 0x00, 0x06, // call MethodDef(1)
		0x5A, 0x2A, // mul; ret
	];

	#[test]
	fn factorial_recurses_through_call() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let int32 = pool.types().get_primitive(PrimitiveType::Int32);

		let declaring_type = Type::for_test(&bump, pool.types(), "Program", "", false, None);

		let body = MethodBody {
			max_stack_size: 4,
			init_locals: true,
			locals: &[],
			code: intern_test_code(&bump, &FACTORIAL_BODY),
			exception_clauses: &[],
		};
		let method = Method {
			metadata_token: MethodDef(1),
			name: intern_test_name(&bump, "Factorial"),
			attributes: MethodAttributes::STATIC,
			impl_attributes: MethodImplAttributes::empty(),
			declaring_type,
			parameters: bump.alloc_slice_copy(&[int32]),
			return_type: int32,
			generic_arity: 0,
			body: Some(body),
		};

		let methods = std::slice::from_ref(&*bump.alloc(method));
		declaring_type.set_test_methods(methods);
		let types = bump.alloc_slice_copy(&[declaring_type]);

		let assembly = Assembly::for_test(&pool, &bump, methods, types);
		let interp = Interpreter::new(&assembly);
		let factorial = assembly.get_method(MethodDef(1)).unwrap();

		for (n, expected) in [(0i32, 1i32), (1, 1), (5, 120), (12, 479_001_600)] {
			let result = match interpret_call(&interp, factorial, vec![Value::I32(n)]) {
				Ok(v) => v,
				Err(ExecOutcome::Error(e)) => panic!("fact({n}): {e}"),
				Err(ExecOutcome::Thrown(_)) => panic!("fact({n}): unexpected managed exception"),
			};
			match result {
				Value::I32(v) => assert_eq!(v, expected, "fact({n})"),
				other => panic!("fact({n}): expected I32, got {other:?}"),
			}
		}
	}

	/// `callvirt` against `Speak`'s own `MethodDef(1)` token must redirect to
	/// whichever override is nearest the receiver's actual type, walking
	/// `Derived`'s ancestor chain back to `Base` when it doesn't override.
	#[test]
	fn callvirt_dispatches_to_the_most_derived_override() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let int32 = pool.types().get_primitive(PrimitiveType::Int32);

		let base_type = Type::for_test(&bump, pool.types(), "Base", "", false, None);
		let derived_type = Type::for_test(&bump, pool.types(), "Derived", "", false, Some(base_type));

		let speak_base = Method {
			metadata_token: MethodDef(1),
			name: intern_test_name(&bump, "Speak"),
			attributes: MethodAttributes::VIRTUAL,
			impl_attributes: MethodImplAttributes::empty(),
			declaring_type: base_type,
			parameters: &[],
			return_type: int32,
			generic_arity: 0,
			body: Some(MethodBody {
				max_stack_size: 1,
				init_locals: true,
				locals: &[],
				code: intern_test_code(&bump, &[0x17, 0x2A]), // ldc.i4.1; ret
				exception_clauses: &[],
			}),
		};
		let speak_derived = Method {
			metadata_token: MethodDef(2),
			name: intern_test_name(&bump, "Speak"),
			attributes: MethodAttributes::VIRTUAL,
			impl_attributes: MethodImplAttributes::empty(),
			declaring_type: derived_type,
			parameters: &[],
			return_type: int32,
			generic_arity: 0,
			body: Some(MethodBody {
				max_stack_size: 1,
				init_locals: true,
				locals: &[],
				code: intern_test_code(&bump, &[0x18, 0x2A]), // ldc.i4.2; ret
				exception_clauses: &[],
			}),
		};
		let caller = Method {
			metadata_token: MethodDef(3),
			name: intern_test_name(&bump, "Caller"),
			attributes: MethodAttributes::empty(),
			impl_attributes: MethodImplAttributes::empty(),
			declaring_type: base_type,
			parameters: &[],
			return_type: int32,
			generic_arity: 0,
			body: Some(MethodBody {
				max_stack_size: 2,
				init_locals: true,
				locals: &[],
				// ldarg.0; callvirt MethodDef(1); ret
				code: intern_test_code(&bump, &[0x02, 0x6F, 0x01, 0x00, 0x00, 0x06, 0x2A]),
				exception_clauses: &[],
			}),
		};

		let methods: &[Method] = bump.alloc_slice_fill_iter([speak_base, speak_derived, caller]);
		base_type.set_test_methods(std::slice::from_ref(&methods[0]));
		derived_type.set_test_methods(std::slice::from_ref(&methods[1]));
		let types = bump.alloc_slice_copy(&[base_type, derived_type]);

		let assembly = Assembly::for_test(&pool, &bump, methods, types);
		let interp = Interpreter::new(&assembly);
		let caller = assembly.get_method(MethodDef(3)).unwrap();

		let base_receiver = Value::ObjRef(Some(Object::new_instance(base_type)));
		let result = match interpret_instance_call(&interp, caller, base_receiver, vec![]) {
			Ok(v) => v,
			Err(ExecOutcome::Error(e)) => panic!("Base receiver: {e}"),
			Err(ExecOutcome::Thrown(_)) => panic!("Base receiver: unexpected managed exception"),
		};
		match result {
			Value::I32(v) => assert_eq!(v, 1, "a Base receiver must dispatch to Base::Speak"),
			other => panic!("expected I32, got {other:?}"),
		}

		let derived_receiver = Value::ObjRef(Some(Object::new_instance(derived_type)));
		let result = match interpret_instance_call(&interp, caller, derived_receiver, vec![]) {
			Ok(v) => v,
			Err(ExecOutcome::Error(e)) => panic!("Derived receiver: {e}"),
			Err(ExecOutcome::Thrown(_)) => panic!("Derived receiver: unexpected managed exception"),
		};
		match result {
			Value::I32(v) => assert_eq!(v, 2, "a Derived receiver must dispatch to Derived::Speak"),
			other => panic!("expected I32, got {other:?}"),
		}
	}

	/// `throw` inside a nested `try`/`catch` unwinds to the matching handler,
	/// whose `leave` runs the outer `finally` before jumping to its target —
	/// the `finally` stores a marker the method reads back after resuming.
	#[test]
	fn leave_runs_the_enclosing_finally_before_its_target() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let int32 = pool.types().get_primitive(PrimitiveType::Int32);
		let void = pool.types().get_primitive(PrimitiveType::Void);

		let program_type = Type::for_test(&bump, pool.types(), "Program", "", false, None);
		let exception_type = Type::for_test(&bump, pool.types(), "MyException", "", false, None);

		let ctor = Method {
			metadata_token: MethodDef(2),
			name: intern_test_name(&bump, ".ctor"),
			attributes: MethodAttributes::empty(),
			impl_attributes: MethodImplAttributes::empty(),
			declaring_type: exception_type,
			parameters: &[],
			return_type: void,
			generic_arity: 0,
			body: Some(MethodBody {
				max_stack_size: 1,
				init_locals: true,
				locals: &[],
				code: intern_test_code(&bump, &[0x2A]), // ret
				exception_clauses: &[],
			}),
		};

		let ran_field: &Field = bump.alloc(Field {
			metadata_token: MetadataToken::try_from(0x04000001u32).unwrap(),
			name: "Ran",
			declaring_type: program_type,
			field_type: int32,
			is_static: true,
		});

		// offset  0: newobj MethodDef(2)               (try region: [0, 6))
		// offset  5: throw
		// offset  6: pop                                (catch handler: [6, 12))
		// offset  7: leave +7  (-> 19)
		// offset 12: ldc.i4.1                            (finally handler: [12, 19))
		// offset 13: stsfld Field(1)
		// offset 18: endfinally
		// offset 19: ldsfld Field(1)
		// offset 24: ret
		const BODY: [u8; 25] = [
			0x73, 0x02, 0x00, 0x00, 0x06,
			0x7A,
			0x26,
			0xDD, 0x07, 0x00, 0x00, 0x00,
			0x17,
			0x80, 0x01, 0x00, 0x00, 0x04,
			0xDC,
			0x7E, 0x01, 0x00, 0x00, 0x04,
			0x2A,
		];
		let class_token = (0x02u32 << 24) | 2; // TypeDef(2), matching `exception_type`'s row.
		let clauses = bump.alloc_slice_copy(&[
			ExceptionClause { flags: ExceptionClauseFlags::EXCEPTION, try_offset: 0, try_length: 6, handler_offset: 6, handler_length: 6, class_token, filter_offset: 0 },
			ExceptionClause { flags: ExceptionClauseFlags::FINALLY, try_offset: 0, try_length: 19, handler_offset: 12, handler_length: 7, class_token: 0, filter_offset: 0 },
		]);

		let run_try_finally = Method {
			metadata_token: MethodDef(1),
			name: intern_test_name(&bump, "RunTryFinally"),
			attributes: MethodAttributes::STATIC,
			impl_attributes: MethodImplAttributes::empty(),
			declaring_type: program_type,
			parameters: &[],
			return_type: int32,
			generic_arity: 0,
			body: Some(MethodBody {
				max_stack_size: 4,
				init_locals: true,
				locals: &[],
				code: intern_test_code(&bump, &BODY),
				exception_clauses: clauses,
			}),
		};

		let methods: &[Method] = bump.alloc_slice_fill_iter([run_try_finally, ctor]);
		program_type.set_test_methods(std::slice::from_ref(&methods[0]));
		exception_type.set_test_methods(std::slice::from_ref(&methods[1]));
		let types = bump.alloc_slice_copy(&[program_type, exception_type]);
		let field_defs: &[&Field] = bump.alloc_slice_copy(&[ran_field]);

		let assembly = Assembly::for_test_with_fields(&pool, &bump, methods, types, field_defs);
		let interp = Interpreter::new(&assembly);
		let run = assembly.get_method(MethodDef(1)).unwrap();

		let result = match interpret_call(&interp, run, vec![]) {
			Ok(v) => v,
			Err(ExecOutcome::Error(e)) => panic!("{e}"),
			Err(ExecOutcome::Thrown(_)) => panic!("unexpected managed exception escaped the catch"),
		};
		match result {
			Value::I32(v) => assert_eq!(v, 1, "the finally must run (setting the field) before the leave's target reads it"),
			other => panic!("expected I32, got {other:?}"),
		}
	}

	/// `ldsfld` on a type with a `.cctor` runs it lazily on first access; a
	/// second call must not re-run it, matching spec §5's once-only guarantee.
	#[test]
	fn ldsfld_triggers_the_static_constructor_exactly_once() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let int32 = pool.types().get_primitive(PrimitiveType::Int32);
		let void = pool.types().get_primitive(PrimitiveType::Void);

		let program_type = Type::for_test(&bump, pool.types(), "Program", "", false, None);
		let counter_field: &Field = bump.alloc(Field {
			metadata_token: MetadataToken::try_from(0x04000001u32).unwrap(),
			name: "Counter",
			declaring_type: program_type,
			field_type: int32,
			is_static: true,
		});

		// .cctor: ldsfld Counter; ldc.i4.1; add; stsfld Counter; ret
		const CCTOR_BODY: [u8; 13] = [
			0x7E, 0x01, 0x00, 0x00, 0x04,
			0x17,
			0x58,
			0x80, 0x01, 0x00, 0x00, 0x04,
			0x2A,
		];
		let cctor = Method {
			metadata_token: MethodDef(2),
			name: intern_test_name(&bump, ".cctor"),
			attributes: MethodAttributes::STATIC,
			impl_attributes: MethodImplAttributes::empty(),
			declaring_type: program_type,
			parameters: &[],
			return_type: void,
			generic_arity: 0,
			body: Some(MethodBody {
				max_stack_size: 3,
				init_locals: true,
				locals: &[],
				code: intern_test_code(&bump, &CCTOR_BODY),
				exception_clauses: &[],
			}),
		};

		// ldsfld Counter; ret
		const GET_COUNTER_BODY: [u8; 6] = [0x7E, 0x01, 0x00, 0x00, 0x04, 0x2A];
		let get_counter = Method {
			metadata_token: MethodDef(1),
			name: intern_test_name(&bump, "GetCounter"),
			attributes: MethodAttributes::STATIC,
			impl_attributes: MethodImplAttributes::empty(),
			declaring_type: program_type,
			parameters: &[],
			return_type: int32,
			generic_arity: 0,
			body: Some(MethodBody {
				max_stack_size: 1,
				init_locals: true,
				locals: &[],
				code: intern_test_code(&bump, &GET_COUNTER_BODY),
				exception_clauses: &[],
			}),
		};

		let methods: &[Method] = bump.alloc_slice_fill_iter([get_counter, cctor]);
		program_type.set_test_methods(methods);
		let types = bump.alloc_slice_copy(&[program_type]);
		let field_defs: &[&Field] = bump.alloc_slice_copy(&[counter_field]);

		let assembly = Assembly::for_test_with_fields(&pool, &bump, methods, types, field_defs);
		let interp = Interpreter::new(&assembly);
		let get_counter = assembly.get_method(MethodDef(1)).unwrap();

		for call in 0..2 {
			let result = match interpret_call(&interp, get_counter, vec![]) {
				Ok(v) => v,
				Err(ExecOutcome::Error(e)) => panic!("call {call}: {e}"),
				Err(ExecOutcome::Thrown(_)) => panic!("call {call}: unexpected managed exception"),
			};
			match result {
				Value::I32(v) => assert_eq!(v, 1, "call {call}: the .cctor must have run exactly once"),
				other => panic!("call {call}: expected I32, got {other:?}"),
			}
		}
	}

	/// `box` on the same argument twice yields structurally-equal but
	/// distinct heap objects (spec property: boxing never aliases).
	#[test]
	fn box_opcode_produces_structurally_equal_but_distinct_objects() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let int32 = pool.types().get_primitive(PrimitiveType::Int32);
		let object_ty = pool.types().get_primitive(PrimitiveType::Object);

		let box_type = Type::for_test(&bump, pool.types(), "Box32", "", true, None);

		// ldarg.0; box TypeDef(1); ret
		const BODY: [u8; 7] = [0x02, 0x8C, 0x01, 0x00, 0x00, 0x02, 0x2A];
		let box_value = Method {
			metadata_token: MethodDef(1),
			name: intern_test_name(&bump, "BoxValue"),
			attributes: MethodAttributes::STATIC,
			impl_attributes: MethodImplAttributes::empty(),
			declaring_type: box_type,
			parameters: bump.alloc_slice_copy(&[int32]),
			return_type: object_ty,
			generic_arity: 0,
			body: Some(MethodBody {
				max_stack_size: 1,
				init_locals: true,
				locals: &[],
				code: intern_test_code(&bump, &BODY),
				exception_clauses: &[],
			}),
		};

		let methods = std::slice::from_ref(&*bump.alloc(box_value));
		let types = bump.alloc_slice_copy(&[box_type]);
		let assembly = Assembly::for_test(&pool, &bump, methods, types);
		let interp = Interpreter::new(&assembly);
		let box_value = assembly.get_method(MethodDef(1)).unwrap();

		let call = |n: i32| match interpret_call(&interp, box_value, vec![Value::I32(n)]) {
			Ok(v) => v,
			Err(ExecOutcome::Error(e)) => panic!("box({n}): {e}"),
			Err(ExecOutcome::Thrown(_)) => panic!("box({n}): unexpected managed exception"),
		};

		let a = call(42);
		let b = call(42);
		let c = call(7);

		match (&a, &b) {
			(Value::ObjRef(Some(x)), Value::ObjRef(Some(y))) => assert!(!Rc::ptr_eq(x, y), "two boxes must never alias"),
			_ => panic!("expected boxed ObjRefs"),
		}
		assert!(values_structurally_equal(&a, &b), "boxing the same value twice must compare structurally equal");
		assert!(!values_structurally_equal(&a, &c), "boxes of different payloads must not compare equal");
	}

	/// `box !!0` against a method-generic parameter must resolve through the
	/// call's own `GenericScope` to the type the caller bound `!!0` to.
	#[test]
	fn generic_method_parameter_concretizes_through_the_call_site_scope() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let int32 = pool.types().get_primitive(PrimitiveType::Int32);
		let object_ty = pool.types().get_primitive(PrimitiveType::Object);
		let method_param = pool.types().get_generic_method_param(0); // `!!0`

		// ldarg.0; box TypeDef(1) (-> `!!0`); ret
		const BODY: [u8; 7] = [0x02, 0x8C, 0x01, 0x00, 0x00, 0x02, 0x2A];
		let identity = Method {
			metadata_token: MethodDef(1),
			name: intern_test_name(&bump, "Identity"),
			attributes: MethodAttributes::STATIC,
			impl_attributes: MethodImplAttributes::empty(),
			declaring_type: method_param, // arbitrary; unused by execution
			parameters: bump.alloc_slice_copy(&[object_ty]),
			return_type: object_ty,
			generic_arity: 1,
			body: Some(MethodBody {
				max_stack_size: 1,
				init_locals: true,
				locals: &[],
				code: intern_test_code(&bump, &BODY),
				exception_clauses: &[],
			}),
		};

		let methods = std::slice::from_ref(&*bump.alloc(identity));
		let types = bump.alloc_slice_copy(&[method_param]); // TypeDef(1) resolves to the open `!!0` marker.
		let assembly = Assembly::for_test(&pool, &bump, methods, types);
		let interp = Interpreter::new(&assembly);
		let identity = assembly.get_method(MethodDef(1)).unwrap();

		let scope = GenericScope::new(vec![], vec![int32]);
		let result = match interpret_generic_call(&interp, identity, scope, None, vec![Value::I32(99)]) {
			Ok(v) => v,
			Err(ExecOutcome::Error(e)) => panic!("{e}"),
			Err(ExecOutcome::Thrown(_)) => panic!("unexpected managed exception"),
		};

		match result {
			Value::ObjRef(Some(obj)) => {
				assert!(std::ptr::eq(obj.ty, int32), "`!!0` must concretize to the scope's bound type, not stay an open parameter");
				match &*obj.data.borrow() {
					ObjectData::Boxed(instance) => match &instance.fields[0] {
						Value::I32(v) => assert_eq!(*v, 99),
						other => panic!("expected an I32 payload, got {other:?}"),
					},
					_ => panic!("expected a boxed value"),
				}
			}
			other => panic!("expected a boxed ObjRef, got {other:?}"),
		}
	}
}
