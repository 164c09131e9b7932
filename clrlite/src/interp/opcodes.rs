//! The opcode dispatch table (spec §4.4): one function per handler family,
//! called from the interpreter loop with the decoded instruction and the
//! current frame. Handlers mutate the stack, locals, or `frame.cursor`
//! (branches / `leave` overwrite it; everything else falls through to the
//! caller-supplied `next`).

use std::rc::Rc;

use crate::interp::errors::{ExecOutcome, InterpError};
use crate::interp::exceptions;
use crate::interp::frame::Frame;
use crate::interp::interpreter::Interpreter;
use crate::interp::invoker;
use crate::interp::resolver::concretize;
use crate::interp::value::{ManagedRef, NarrowValue, Object, ObjectData, Value, ValueTypeInstance};
use crate::raw::il::{CompoundOpCode, OpCode};
use crate::raw::indices::metadata_token::MetadataTokenKind;
use crate::schema::r#type::PrimitiveType;

pub enum Step<'l> {
	Continue,
	Return(Value<'l>),
}

pub fn execute<'l>(
	interp: &Interpreter<'l>,
	frame: &mut Frame<'l>,
	op: &OpCode<'l>,
	offset: u64,
	next: u64,
) -> Result<Step<'l>, ExecOutcome<'l>> {
	frame.cursor = next;
	match op {
		OpCode::nop | OpCode::dbg_break => {}

		// --- stack / constant loads -----------------------------------
		OpCode::ldnull => frame.push(Value::ObjRef(None)),
		OpCode::ldc_i4_m1 => frame.push(Value::I32(-1)),
		OpCode::ldc_i4_0 => frame.push(Value::I32(0)),
		OpCode::ldc_i4_1 => frame.push(Value::I32(1)),
		OpCode::ldc_i4_2 => frame.push(Value::I32(2)),
		OpCode::ldc_i4_3 => frame.push(Value::I32(3)),
		OpCode::ldc_i4_4 => frame.push(Value::I32(4)),
		OpCode::ldc_i4_5 => frame.push(Value::I32(5)),
		OpCode::ldc_i4_6 => frame.push(Value::I32(6)),
		OpCode::ldc_i4_7 => frame.push(Value::I32(7)),
		OpCode::ldc_i4_8 => frame.push(Value::I32(8)),
		OpCode::ldc_i4_s(n) => frame.push(Value::I32(*n as i8 as i32)),
		OpCode::ldc_i4(n) => frame.push(Value::I32(*n)),
		OpCode::ldc_i8(n) => frame.push(Value::I64(*n)),
		OpCode::ldc_r4(n) => frame.push(Value::F(*n as f64)),
		OpCode::ldc_r8(n) => frame.push(Value::F(*n)),
		OpCode::ldstr(token) => {
			let text = interp.assembly().get_user_string(token.index())
				.ok_or_else(|| InterpError::invalid_program("", frame.cursor, "ldstr: no literal at that #US offset"))?;
			let string_ty = interp.types().get_primitive(PrimitiveType::String);
			frame.push(Value::ObjRef(Some(Object::new_string(string_ty, &text))));
		}
		OpCode::dup => {
			let top = frame.stack.last().cloned().ok_or_else(|| InterpError::invalid_program("", frame.cursor, "dup on empty stack"))?;
			frame.push(top);
		}
		OpCode::pop => { frame.pop(); }

		// --- locals / arguments -----------------------------------------
		OpCode::ldarg_0 => load_arg(frame, 0)?,
		OpCode::ldarg_1 => load_arg(frame, 1)?,
		OpCode::ldarg_2 => load_arg(frame, 2)?,
		OpCode::ldarg_3 => load_arg(frame, 3)?,
		OpCode::ldarg_s(n) => load_arg(frame, *n as usize)?,
		OpCode::ldarga_s(n) => load_arga(frame, *n as usize)?,
		OpCode::starg_s(n) => store_arg(frame, *n as usize)?,
		OpCode::ldloc_0 => load_loc(frame, 0)?,
		OpCode::ldloc_1 => load_loc(frame, 1)?,
		OpCode::ldloc_2 => load_loc(frame, 2)?,
		OpCode::ldloc_3 => load_loc(frame, 3)?,
		OpCode::ldloc_s(n) => load_loc(frame, *n as usize)?,
		OpCode::ldloca_s(n) => load_loca(frame, *n as usize)?,
		OpCode::stloc_0 => store_loc(frame, 0)?,
		OpCode::stloc_1 => store_loc(frame, 1)?,
		OpCode::stloc_2 => store_loc(frame, 2)?,
		OpCode::stloc_3 => store_loc(frame, 3)?,
		OpCode::stloc_s(n) => store_loc(frame, *n as usize)?,

		// --- arithmetic ---------------------------------------------------
		OpCode::add => binary_arith(frame, |a, b| a.wrapping_add(b), |a, b| a + b)?,
		OpCode::sub => binary_arith(frame, |a, b| a.wrapping_sub(b), |a, b| a - b)?,
		OpCode::mul => binary_arith(frame, |a, b| a.wrapping_mul(b), |a, b| a * b)?,
		OpCode::div => binary_div(frame, false)?,
		OpCode::div_un => binary_div(frame, true)?,
		OpCode::rem => binary_rem(frame, false)?,
		OpCode::rem_un => binary_rem(frame, true)?,
		OpCode::and => binary_int_only(frame, |a, b| a & b)?,
		OpCode::or => binary_int_only(frame, |a, b| a | b)?,
		OpCode::xor => binary_int_only(frame, |a, b| a ^ b)?,
		OpCode::shl => shift(frame, true)?,
		OpCode::shr => shift(frame, false)?,
		OpCode::shr_un => shift_un(frame)?,
		OpCode::neg => {
			let v = frame.pop().ok_or_else(underflow)?;
			frame.push(match v {
				Value::I32(n) => Value::I32(n.wrapping_neg()),
				Value::I64(n) => Value::I64(n.wrapping_neg()),
				Value::NativeInt(n) => Value::NativeInt(n.wrapping_neg()),
				Value::F(n) => Value::F(-n),
				_ => return Err(InterpError::invalid_program("", frame.cursor, "neg on non-numeric").into()),
			});
		}
		OpCode::not => {
			let v = frame.pop().ok_or_else(underflow)?;
			frame.push(match v {
				Value::I32(n) => Value::I32(!n),
				Value::I64(n) => Value::I64(!n),
				Value::NativeInt(n) => Value::NativeInt(!n),
				_ => return Err(InterpError::invalid_program("", frame.cursor, "not on non-integer").into()),
			});
		}
		OpCode::add_ovf => binary_checked(frame, false, i32::checked_add, i64::checked_add)?,
		OpCode::add_ovf_un => binary_checked_un(frame, u32::checked_add, u64::checked_add)?,
		OpCode::sub_ovf => binary_checked(frame, false, i32::checked_sub, i64::checked_sub)?,
		OpCode::sub_ovf_un => binary_checked_un(frame, u32::checked_sub, u64::checked_sub)?,
		OpCode::mul_ovf => binary_checked(frame, false, i32::checked_mul, i64::checked_mul)?,
		OpCode::mul_ovf_un => binary_checked_un(frame, u32::checked_mul, u64::checked_mul)?,

		// --- comparisons / branches ---------------------------------------
		OpCode::br_s(off) => branch(frame, next, *off as i64),
		OpCode::br(off) => branch(frame, next, *off as i64),
		OpCode::brfalse_s(off) => branch_if(frame, next, *off as i64, false)?,
		OpCode::brfalse(off) => branch_if(frame, next, *off as i64, false)?,
		OpCode::brtrue_s(off) => branch_if(frame, next, *off as i64, true)?,
		OpCode::brtrue(off) => branch_if(frame, next, *off as i64, true)?,
		OpCode::beq_s(off) => branch_cmp(frame, next, *off as i64, |o| o == std::cmp::Ordering::Equal, false)?,
		OpCode::beq(off) => branch_cmp(frame, next, *off as i64, |o| o == std::cmp::Ordering::Equal, false)?,
		OpCode::bge_s(off) => branch_cmp(frame, next, *off as i64, |o| o != std::cmp::Ordering::Less, false)?,
		OpCode::bge(off) => branch_cmp(frame, next, *off as i64, |o| o != std::cmp::Ordering::Less, false)?,
		OpCode::bgt_s(off) => branch_cmp(frame, next, *off as i64, |o| o == std::cmp::Ordering::Greater, false)?,
		OpCode::bgt(off) => branch_cmp(frame, next, *off as i64, |o| o == std::cmp::Ordering::Greater, false)?,
		OpCode::ble_s(off) => branch_cmp(frame, next, *off as i64, |o| o != std::cmp::Ordering::Greater, false)?,
		OpCode::ble(off) => branch_cmp(frame, next, *off as i64, |o| o != std::cmp::Ordering::Greater, false)?,
		OpCode::blt_s(off) => branch_cmp(frame, next, *off as i64, |o| o == std::cmp::Ordering::Less, false)?,
		OpCode::blt(off) => branch_cmp(frame, next, *off as i64, |o| o == std::cmp::Ordering::Less, false)?,
		OpCode::bne_un_s(off) => branch_cmp(frame, next, *off as i64, |o| o != std::cmp::Ordering::Equal, true)?,
		OpCode::bne_un(off) => branch_cmp(frame, next, *off as i64, |o| o != std::cmp::Ordering::Equal, true)?,
		OpCode::bge_un_s(off) => branch_cmp(frame, next, *off as i64, |o| o != std::cmp::Ordering::Less, true)?,
		OpCode::bge_un(off) => branch_cmp(frame, next, *off as i64, |o| o != std::cmp::Ordering::Less, true)?,
		OpCode::bgt_un_s(off) => branch_cmp(frame, next, *off as i64, |o| o == std::cmp::Ordering::Greater, true)?,
		OpCode::bgt_un(off) => branch_cmp(frame, next, *off as i64, |o| o == std::cmp::Ordering::Greater, true)?,
		OpCode::ble_un_s(off) => branch_cmp(frame, next, *off as i64, |o| o != std::cmp::Ordering::Greater, true)?,
		OpCode::ble_un(off) => branch_cmp(frame, next, *off as i64, |o| o != std::cmp::Ordering::Greater, true)?,
		OpCode::blt_un_s(off) => branch_cmp(frame, next, *off as i64, |o| o == std::cmp::Ordering::Less, true)?,
		OpCode::blt_un(off) => branch_cmp(frame, next, *off as i64, |o| o == std::cmp::Ordering::Less, true)?,
		OpCode::switch(table) => {
			let v = frame.pop().and_then(|v| v.as_i32()).ok_or_else(underflow)? as usize;
			if let Some(offset) = table.variants().nth(v) {
				frame.cursor = (next as i64 + offset as i64) as u64;
			}
		}

		// --- conversions ----------------------------------------------------
		OpCode::conv_i1 => convert(frame, |v| Value::I32(v as i8 as i32))?,
		OpCode::conv_i2 => convert(frame, |v| Value::I32(v as i16 as i32))?,
		OpCode::conv_i4 => convert(frame, |v| Value::I32(v as i32))?,
		OpCode::conv_i8 => convert(frame, |v| Value::I64(v))?,
		OpCode::conv_u1 => convert(frame, |v| Value::I32(v as u8 as i32))?,
		OpCode::conv_u2 => convert(frame, |v| Value::I32(v as u16 as i32))?,
		OpCode::conv_u4 => convert(frame, |v| Value::I32(v as u32 as i32))?,
		OpCode::conv_u8 => convert(frame, |v| Value::I64(v as u64 as i64))?,
		OpCode::conv_i => convert(frame, |v| Value::NativeInt(v as isize))?,
		OpCode::conv_u => convert(frame, |v| Value::NativeInt(v as usize as isize))?,
		OpCode::conv_r4 | OpCode::conv_r8 => {
			let v = frame.pop().ok_or_else(underflow)?;
			frame.push(Value::F(match v {
				Value::I32(n) => n as f64,
				Value::I64(n) => n as f64,
				Value::NativeInt(n) => n as f64,
				Value::F(n) => n,
				_ => return Err(InterpError::invalid_program("", frame.cursor, "conv.r on non-numeric").into()),
			}));
		}
		OpCode::conv_r_un => {
			let v = frame.pop().and_then(|v| v.as_i64()).ok_or_else(underflow)?;
			frame.push(Value::F(v as u64 as f64));
		}
		OpCode::conv_ovf_i1 | OpCode::conv_ovf_i1_un => convert_ovf(frame, i8::try_from)?,
		OpCode::conv_ovf_u1 | OpCode::conv_ovf_u1_un => convert_ovf_u(frame, u8::try_from)?,
		OpCode::conv_ovf_i2 | OpCode::conv_ovf_i2_un => convert_ovf(frame, i16::try_from)?,
		OpCode::conv_ovf_u2 | OpCode::conv_ovf_u2_un => convert_ovf_u(frame, u16::try_from)?,
		OpCode::conv_ovf_i4 | OpCode::conv_ovf_i4_un => convert_ovf(frame, i32::try_from)?,
		OpCode::conv_ovf_u4 | OpCode::conv_ovf_u4_un => convert_ovf_u(frame, u32::try_from)?,
		OpCode::conv_ovf_i8 | OpCode::conv_ovf_i8_un | OpCode::conv_ovf_i | OpCode::conv_ovf_i_un => {
			let v = frame.pop().and_then(|v| v.as_i64()).ok_or_else(underflow)?;
			frame.push(Value::I64(v));
		}
		OpCode::conv_ovf_u8 | OpCode::conv_ovf_u8_un | OpCode::conv_ovf_u | OpCode::conv_ovf_u_un => {
			let v = frame.pop().and_then(|v| v.as_i64()).ok_or_else(underflow)?;
			if v < 0 {
				return Err(InterpError::ArithmeticOverflow.into());
			}
			frame.push(Value::I64(v));
		}
		OpCode::ckfinite => {
			let v = frame.pop().and_then(|v| v.as_f64()).ok_or_else(underflow)?;
			if !v.is_finite() {
				return Err(InterpError::ArithmeticOverflow.into());
			}
			frame.push(Value::F(v));
		}

		// --- object model ---------------------------------------------------
		OpCode::newobj(token) => return newobj(interp, frame, *token),
		OpCode::newarr(token) => newarr(interp, frame, *token)?,
		OpCode::ldlen => {
			let arr = pop_array(frame)?;
			let len = arr.data.borrow().len();
			frame.push(Value::NativeInt(len as isize));
		}
		OpCode::ldfld(token) => ldfld(interp, frame, *token)?,
		OpCode::ldflda(token) => ldflda(interp, frame, *token)?,
		OpCode::stfld(token) => stfld(interp, frame, *token)?,
		OpCode::ldsfld(token) => ldsfld(interp, frame, *token)?,
		OpCode::ldsflda(token) => return Err(InterpError::unimplemented_opcode("ldsflda").into()),
		OpCode::stsfld(token) => stsfld(interp, frame, *token)?,
		OpCode::ldelem_i1 | OpCode::ldelem_u1 | OpCode::ldelem_i2 | OpCode::ldelem_u2
			| OpCode::ldelem_i4 | OpCode::ldelem_u4 | OpCode::ldelem_i8 | OpCode::ldelem_i
			| OpCode::ldelem_r4 | OpCode::ldelem_r8 | OpCode::ldelem_ref => ldelem(frame)?,
		OpCode::ldelem(_) => ldelem(frame)?,
		OpCode::stelem_i | OpCode::stelem_i1 | OpCode::stelem_i2 | OpCode::stelem_i4
			| OpCode::stelem_i8 | OpCode::stelem_r4 | OpCode::stelem_r8 | OpCode::stelem_ref => stelem(frame)?,
		OpCode::stelem(_) => stelem(frame)?,
		OpCode::ldelema(_) => ldelema(frame)?,
		OpCode::box_val(token) => box_value(interp, frame, *token)?,
		OpCode::unbox(token) => unbox(interp, frame, *token, false)?,
		OpCode::unbox_any(token) => unbox(interp, frame, *token, true)?,
		OpCode::castclass(token) => cast(interp, frame, *token, true)?,
		OpCode::isinst(token) => cast(interp, frame, *token, false)?,
		OpCode::ldobj(_) | OpCode::stobj(_) | OpCode::cpobj(_) => {
			return Err(InterpError::unimplemented_opcode("ldobj/stobj/cpobj").into());
		}
		OpCode::ldtoken(_) => return Err(InterpError::unimplemented_opcode("ldtoken").into()),

		// --- comparisons (non-branching) -------------------------------------
		OpCode::ldind_i1 | OpCode::ldind_u1 | OpCode::ldind_i2 | OpCode::ldind_u2
			| OpCode::ldind_i4 | OpCode::ldind_u4 | OpCode::ldind_i8 | OpCode::ldind_i
			| OpCode::ldind_r4 | OpCode::ldind_r8 | OpCode::ldind_ref => {
			let r = pop_managed_ref(frame)?;
			frame.push(promote_narrow(r.load()));
		}
		OpCode::stind_ref | OpCode::stind_i1 | OpCode::stind_i2 | OpCode::stind_i4
			| OpCode::stind_i8 | OpCode::stind_r4 | OpCode::stind_r8 | OpCode::stind_i => {
			let v = frame.pop().ok_or_else(underflow)?;
			let r = pop_managed_ref(frame)?;
			r.store(v);
		}

		// --- calls -----------------------------------------------------------
		OpCode::call(token) => return call(interp, frame, *token, false),
		OpCode::callvirt(token) => return call(interp, frame, *token, true),
		OpCode::ret => {
			return Ok(match frame.pop() {
				Some(v) => Step::Return(v),
				None if is_void(frame.method.return_type()) => Step::Return(Value::I32(0)),
				None => return Err(InterpError::invalid_program(
					frame.method.name().as_str(),
					frame.cursor,
					"`ret` with an empty evaluation stack on a non-void method",
				).into()),
			});
		}
		OpCode::jmp(_) | OpCode::calli(_) => return Err(InterpError::unimplemented_opcode("jmp/calli").into()),

		// --- exceptions --------------------------------------------------------
		OpCode::throw => {
			let v = frame.pop().ok_or_else(underflow)?;
			let Value::ObjRef(Some(obj)) = v else {
				return Err(InterpError::NullReference.into());
			};
			return Err(ExecOutcome::Thrown(crate::interp::errors::ManagedException(obj)));
		}
		OpCode::leave(off) => return Ok(leave(interp, frame, offset, next, *off as i64)?),
		OpCode::leave_s(off) => return Ok(leave(interp, frame, offset, next, *off as i64)?),
		OpCode::endfinally => {}

		OpCode::compound(c) => return execute_compound(interp, frame, c, next),

		#[allow(unreachable_patterns)]
		_ => return Err(InterpError::unimplemented_opcode("unhandled opcode").into()),
	}
	Ok(Step::Continue)
}

fn execute_compound<'l>(
	interp: &Interpreter<'l>,
	frame: &mut Frame<'l>,
	op: &CompoundOpCode,
	next: u64,
) -> Result<Step<'l>, ExecOutcome<'l>> {
	frame.cursor = next;
	match op {
		CompoundOpCode::ceq => compare_push(frame, |o| o == std::cmp::Ordering::Equal, false)?,
		CompoundOpCode::cgt => compare_push(frame, |o| o == std::cmp::Ordering::Greater, false)?,
		CompoundOpCode::cgt_un => compare_push(frame, |o| o == std::cmp::Ordering::Greater, true)?,
		CompoundOpCode::clt => compare_push(frame, |o| o == std::cmp::Ordering::Less, false)?,
		CompoundOpCode::clt_un => compare_push(frame, |o| o == std::cmp::Ordering::Less, true)?,
		CompoundOpCode::ldarg(n) => load_arg(frame, *n as usize)?,
		CompoundOpCode::ldarga(n) => load_arga(frame, *n as usize)?,
		CompoundOpCode::starg(n) => store_arg(frame, *n as usize)?,
		CompoundOpCode::ldloc(n) => load_loc(frame, *n as usize)?,
		CompoundOpCode::ldloca(n) => load_loca(frame, *n as usize)?,
		CompoundOpCode::stloc(n) => store_loc(frame, *n as usize)?,
		CompoundOpCode::initobj(token) => initobj(interp, frame, *token)?,
		CompoundOpCode::constrained(token) => {
			let ty = interp.resolver().resolve_type(*token, &frame.scope)?;
			frame.constrained_type = Some(ty);
		}
		CompoundOpCode::rethrow => {
			let exc = frame.active_exception.clone().ok_or_else(|| InterpError::invalid_program("", frame.cursor, "rethrow outside catch"))?;
			return Err(ExecOutcome::Thrown(crate::interp::errors::ManagedException(exc)));
		}
		CompoundOpCode::endfilter => {
			// The value left on the stack by the filter expression is
			// consumed by the interpreter loop's filter-evaluation path, not
			// here; this handler only marks the instruction boundary.
		}
		CompoundOpCode::tail | CompoundOpCode::unaligned | CompoundOpCode::volatile | CompoundOpCode::readonly => {}
		CompoundOpCode::sizeof(_) | CompoundOpCode::ldftn(_) | CompoundOpCode::ldvirtftn(_)
			| CompoundOpCode::localloc | CompoundOpCode::cpblk | CompoundOpCode::initblk
			| CompoundOpCode::arglist | CompoundOpCode::refanytype | CompoundOpCode::no_chk(_) => {
			return Err(InterpError::unimplemented_opcode("extended opcode").into());
		}
	}
	Ok(Step::Continue)
}

fn underflow() -> InterpError {
	InterpError::InvalidProgram("evaluation stack underflow".into())
}

fn promote_narrow(v: Value) -> Value {
	match v {
		Value::Narrow(NarrowValue::I8(n)) => Value::I32(n as i32),
		Value::Narrow(NarrowValue::U8(n)) => Value::I32(n as i32),
		Value::Narrow(NarrowValue::I16(n)) => Value::I32(n as i32),
		Value::Narrow(NarrowValue::U16(n)) => Value::I32(n as i32),
		Value::Narrow(NarrowValue::Bool(b)) => Value::I32(b as i32),
		Value::Narrow(NarrowValue::Char(c)) => Value::I32(c as i32),
		Value::Narrow(NarrowValue::F32(f)) => Value::F(f as f64),
		other => other,
	}
}

fn load_arg<'l>(frame: &mut Frame<'l>, index: usize) -> Result<(), InterpError> {
	if index == 0 {
		if let Some(r) = &frame.receiver {
			frame.push(r.clone());
			return Ok(());
		}
	}
	let index = if frame.receiver.is_some() { index - 1 } else { index };
	let cell = frame.args.get(index).ok_or_else(underflow)?;
	frame.push(cell.borrow().clone());
	Ok(())
}

fn load_arga<'l>(frame: &mut Frame<'l>, index: usize) -> Result<(), InterpError> {
	let index = if frame.receiver.is_some() { index.saturating_sub(1) } else { index };
	let cell = frame.args.get(index).ok_or_else(underflow)?.clone();
	frame.push(Value::ManagedRef(ManagedRef::Local(cell)));
	Ok(())
}

fn store_arg<'l>(frame: &mut Frame<'l>, index: usize) -> Result<(), InterpError> {
	let index = if frame.receiver.is_some() { index.saturating_sub(1) } else { index };
	let v = frame.pop().ok_or_else(underflow)?;
	let cell = frame.args.get(index).ok_or_else(underflow)?;
	*cell.borrow_mut() = v;
	Ok(())
}

fn load_loc<'l>(frame: &mut Frame<'l>, index: usize) -> Result<(), InterpError> {
	let cell = frame.locals.get(index).ok_or_else(underflow)?;
	frame.push(cell.borrow().clone());
	Ok(())
}

fn load_loca<'l>(frame: &mut Frame<'l>, index: usize) -> Result<(), InterpError> {
	let cell = frame.locals.get(index).ok_or_else(underflow)?.clone();
	frame.push(Value::ManagedRef(ManagedRef::Local(cell)));
	Ok(())
}

fn store_loc<'l>(frame: &mut Frame<'l>, index: usize) -> Result<(), InterpError> {
	let v = frame.pop().ok_or_else(underflow)?;
	let cell = frame.locals.get(index).ok_or_else(underflow)?;
	*cell.borrow_mut() = v;
	Ok(())
}

fn branch(frame: &mut Frame, next: u64, offset: i64) {
	frame.cursor = (next as i64 + offset) as u64;
}

fn branch_if(frame: &mut Frame, next: u64, offset: i64, when: bool) -> Result<(), InterpError> {
	let v = frame.pop().ok_or_else(underflow)?;
	if v.is_truthy() == when {
		branch(frame, next, offset);
	}
	Ok(())
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
	match (a, b) {
		(Value::I32(x), Value::I32(y)) => x.partial_cmp(y),
		(Value::I64(x), Value::I64(y)) => x.partial_cmp(y),
		(Value::NativeInt(x), Value::NativeInt(y)) => x.partial_cmp(y),
		(Value::F(x), Value::F(y)) => x.partial_cmp(y),
		(Value::ObjRef(x), Value::ObjRef(y)) => match (x, y) {
			(None, None) => Some(std::cmp::Ordering::Equal),
			(Some(x), Some(y)) if Rc::ptr_eq(x, y) => Some(std::cmp::Ordering::Equal),
			_ => None,
		},
		_ => None,
	}
}

fn unsigned_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
	match (a, b) {
		(Value::I32(x), Value::I32(y)) => (*x as u32).partial_cmp(&(*y as u32)),
		(Value::I64(x), Value::I64(y)) => (*x as u64).partial_cmp(&(*y as u64)),
		(Value::NativeInt(x), Value::NativeInt(y)) => (*x as usize).partial_cmp(&(*y as usize)),
		_ => numeric_cmp(a, b),
	}
}

fn branch_cmp(
	frame: &mut Frame,
	next: u64,
	offset: i64,
	test: impl Fn(std::cmp::Ordering) -> bool,
	unsigned: bool,
) -> Result<(), InterpError> {
	let b = frame.pop().ok_or_else(underflow)?;
	let a = frame.pop().ok_or_else(underflow)?;
	let cmp = if unsigned { unsigned_cmp(&a, &b) } else { numeric_cmp(&a, &b) };
	let take = match cmp {
		Some(ord) => test(ord),
		// unordered (e.g. NaN): `.un` branches on unordered, ordered ones don't.
		None => unsigned,
	};
	if take {
		branch(frame, next, offset);
	}
	Ok(())
}

fn compare_push(frame: &mut Frame, test: impl Fn(std::cmp::Ordering) -> bool, unsigned: bool) -> Result<(), InterpError> {
	let b = frame.pop().ok_or_else(underflow)?;
	let a = frame.pop().ok_or_else(underflow)?;
	let cmp = if unsigned { unsigned_cmp(&a, &b) } else { numeric_cmp(&a, &b) };
	let result = match cmp {
		Some(ord) => test(ord),
		None => unsigned,
	};
	frame.push(Value::I32(result as i32));
	Ok(())
}

fn rank(v: &Value) -> u8 {
	match v {
		Value::I32(_) => 0,
		Value::NativeInt(_) => 1,
		Value::I64(_) => 2,
		Value::F(_) => 3,
		_ => 9,
	}
}

fn wrap_to(rank: u8, v: i64) -> Value {
	match rank {
		0 => Value::I32(v as i32),
		1 => Value::NativeInt(v as isize),
		_ => Value::I64(v),
	}
}

fn binary_arith(frame: &mut Frame, int_op: impl Fn(i64, i64) -> i64, float_op: impl Fn(f64, f64) -> f64) -> Result<(), InterpError> {
	let b = frame.pop().ok_or_else(underflow)?;
	let a = frame.pop().ok_or_else(underflow)?;
	if matches!(a, Value::F(_)) || matches!(b, Value::F(_)) {
		let (x, y) = (a.as_f64().ok_or_else(underflow)?, b.as_f64().ok_or_else(underflow)?);
		frame.push(Value::F(float_op(x, y)));
	} else {
		let r = rank(&a).max(rank(&b));
		let (x, y) = (a.as_i64().ok_or_else(underflow)?, b.as_i64().ok_or_else(underflow)?);
		frame.push(wrap_to(r, int_op(x, y)));
	}
	Ok(())
}

fn binary_int_only(frame: &mut Frame, op: impl Fn(i64, i64) -> i64) -> Result<(), InterpError> {
	let b = frame.pop().ok_or_else(underflow)?;
	let a = frame.pop().ok_or_else(underflow)?;
	let r = rank(&a).max(rank(&b));
	let (x, y) = (a.as_i64().ok_or_else(underflow)?, b.as_i64().ok_or_else(underflow)?);
	frame.push(wrap_to(r, op(x, y)));
	Ok(())
}

fn binary_div(frame: &mut Frame, unsigned: bool) -> Result<(), InterpError> {
	let b = frame.pop().ok_or_else(underflow)?;
	let a = frame.pop().ok_or_else(underflow)?;
	if matches!(a, Value::F(_)) || matches!(b, Value::F(_)) {
		let (x, y) = (a.as_f64().ok_or_else(underflow)?, b.as_f64().ok_or_else(underflow)?);
		frame.push(Value::F(x / y));
		return Ok(());
	}
	let r = rank(&a).max(rank(&b));
	let (x, y) = (a.as_i64().ok_or_else(underflow)?, b.as_i64().ok_or_else(underflow)?);
	if y == 0 {
		return Err(InterpError::DivideByZero);
	}
	let result = if unsigned { ((x as u64) / (y as u64)) as i64 } else {
		x.checked_div(y).ok_or(InterpError::ArithmeticOverflow)?
	};
	frame.push(wrap_to(r, result));
	Ok(())
}

fn binary_rem(frame: &mut Frame, unsigned: bool) -> Result<(), InterpError> {
	let b = frame.pop().ok_or_else(underflow)?;
	let a = frame.pop().ok_or_else(underflow)?;
	if matches!(a, Value::F(_)) || matches!(b, Value::F(_)) {
		let (x, y) = (a.as_f64().ok_or_else(underflow)?, b.as_f64().ok_or_else(underflow)?);
		frame.push(Value::F(x % y));
		return Ok(());
	}
	let r = rank(&a).max(rank(&b));
	let (x, y) = (a.as_i64().ok_or_else(underflow)?, b.as_i64().ok_or_else(underflow)?);
	if y == 0 {
		return Err(InterpError::DivideByZero);
	}
	let result = if unsigned { ((x as u64) % (y as u64)) as i64 } else {
		x.checked_rem(y).ok_or(InterpError::ArithmeticOverflow)?
	};
	frame.push(wrap_to(r, result));
	Ok(())
}

fn shift(frame: &mut Frame, left: bool) -> Result<(), InterpError> {
	let shamt = frame.pop().and_then(|v| v.as_i32()).ok_or_else(underflow)?;
	let a = frame.pop().ok_or_else(underflow)?;
	let r = rank(&a);
	let x = a.as_i64().ok_or_else(underflow)?;
	let result = if left { x.wrapping_shl(shamt as u32) } else { x.wrapping_shr(shamt as u32) };
	frame.push(wrap_to(r, result));
	Ok(())
}

fn shift_un(frame: &mut Frame) -> Result<(), InterpError> {
	let shamt = frame.pop().and_then(|v| v.as_i32()).ok_or_else(underflow)?;
	let a = frame.pop().ok_or_else(underflow)?;
	let r = rank(&a);
	let x = a.as_i64().ok_or_else(underflow)? as u64;
	let result = (x.wrapping_shr(shamt as u32)) as i64;
	frame.push(wrap_to(r, result));
	Ok(())
}

fn binary_checked(
	frame: &mut Frame,
	_unsigned: bool,
	op32: impl Fn(i32, i32) -> Option<i32>,
	op64: impl Fn(i64, i64) -> Option<i64>,
) -> Result<(), InterpError> {
	let b = frame.pop().ok_or_else(underflow)?;
	let a = frame.pop().ok_or_else(underflow)?;
	if rank(&a).max(rank(&b)) >= 2 {
		let (x, y) = (a.as_i64().ok_or_else(underflow)?, b.as_i64().ok_or_else(underflow)?);
		frame.push(Value::I64(op64(x, y).ok_or(InterpError::ArithmeticOverflow)?));
	} else {
		let (x, y) = (a.as_i32().ok_or_else(underflow)?, b.as_i32().ok_or_else(underflow)?);
		frame.push(Value::I32(op32(x, y).ok_or(InterpError::ArithmeticOverflow)?));
	}
	Ok(())
}

fn binary_checked_un(
	frame: &mut Frame,
	op32: impl Fn(u32, u32) -> Option<u32>,
	op64: impl Fn(u64, u64) -> Option<u64>,
) -> Result<(), InterpError> {
	let b = frame.pop().ok_or_else(underflow)?;
	let a = frame.pop().ok_or_else(underflow)?;
	if rank(&a).max(rank(&b)) >= 2 {
		let (x, y) = (a.as_i64().ok_or_else(underflow)? as u64, b.as_i64().ok_or_else(underflow)? as u64);
		frame.push(Value::I64(op64(x, y).ok_or(InterpError::ArithmeticOverflow)? as i64));
	} else {
		let (x, y) = (a.as_i32().ok_or_else(underflow)? as u32, b.as_i32().ok_or_else(underflow)? as u32);
		frame.push(Value::I32(op32(x, y).ok_or(InterpError::ArithmeticOverflow)? as i32));
	}
	Ok(())
}

fn convert(frame: &mut Frame, f: impl Fn(i64) -> Value) -> Result<(), InterpError> {
	let v = frame.pop().and_then(|v| match v {
		Value::F(n) => Some(n as i64),
		other => other.as_i64(),
	}).ok_or_else(underflow)?;
	frame.push(f(v));
	Ok(())
}

fn convert_ovf<T: Into<i32>>(frame: &mut Frame, conv: impl Fn(i64) -> Result<T, std::num::TryFromIntError>) -> Result<(), InterpError> {
	let v = frame.pop().and_then(|v| v.as_i64()).ok_or_else(underflow)?;
	let narrowed = conv(v).map_err(|_| InterpError::ArithmeticOverflow)?;
	frame.push(Value::I32(narrowed.into()));
	Ok(())
}

fn convert_ovf_u<T: Into<u32>>(frame: &mut Frame, conv: impl Fn(u32) -> Result<T, std::num::TryFromIntError>) -> Result<(), InterpError> {
	let v = frame.pop().and_then(|v| v.as_i64()).ok_or_else(underflow)?;
	if v < 0 || v > u32::MAX as i64 {
		return Err(InterpError::ArithmeticOverflow);
	}
	let narrowed = conv(v as u32).map_err(|_| InterpError::ArithmeticOverflow)?;
	frame.push(Value::I32(narrowed.into() as i32));
	Ok(())
}

fn pop_managed_ref<'l>(frame: &mut Frame<'l>) -> Result<ManagedRef<'l>, InterpError> {
	match frame.pop().ok_or_else(underflow)? {
		Value::ManagedRef(r) => Ok(r),
		Value::ObjRef(None) => Err(InterpError::NullReference),
		_ => Err(InterpError::InvalidProgram("expected managed reference".into())),
	}
}

fn pop_array<'l>(frame: &mut Frame<'l>) -> Result<crate::interp::value::ObjectRef<'l>, InterpError> {
	match frame.pop().ok_or_else(underflow)? {
		Value::ObjRef(Some(obj)) => Ok(obj),
		Value::ObjRef(None) => Err(InterpError::NullReference),
		_ => Err(InterpError::InvalidProgram("expected array reference".into())),
	}
}

fn ldelem(frame: &mut Frame) -> Result<(), InterpError> {
	let index = frame.pop().and_then(|v| v.as_i32()).ok_or_else(underflow)?;
	let arr = pop_array(frame)?;
	let data = arr.data.borrow();
	let v = data.element(index as usize).clone();
	frame.push(promote_narrow(v));
	Ok(())
}

fn stelem(frame: &mut Frame) -> Result<(), InterpError> {
	let value = frame.pop().ok_or_else(underflow)?;
	let index = frame.pop().and_then(|v| v.as_i32()).ok_or_else(underflow)?;
	let arr = pop_array(frame)?;
	*arr.data.borrow_mut().element_mut(index as usize) = value;
	Ok(())
}

fn ldelema<'l>(frame: &mut Frame<'l>) -> Result<(), InterpError> {
	let index = frame.pop().and_then(|v| v.as_i32()).ok_or_else(underflow)?;
	let array = pop_array(frame)?;
	frame.push(Value::ManagedRef(ManagedRef::ArrayElement { array, index: index as usize }));
	Ok(())
}

fn newobj<'l>(
	interp: &Interpreter<'l>,
	frame: &mut Frame<'l>,
	token: crate::raw::indices::metadata_token::MetadataToken,
) -> Result<Step<'l>, ExecOutcome<'l>> {
	if invoker::is_external_ctor_chain_call(token.kind()) {
		return Err(InterpError::TypeLoad("newobj of an external (unresolvable) type".into()).into());
	}
	let ctor = interp.resolver().resolve_method(token, &frame.scope)?;
	let ty = ctor.declaring_type();
	let argc = ctor.parameters().len();
	if frame.stack.len() < argc {
		return Err(underflow().into());
	}
	let args = frame.stack.split_off(frame.stack.len() - argc);

	let obj = if ty.is_value_type() {
		Object::new_boxed(ty, ValueTypeInstance::zeroed(ty))
	} else {
		Object::new_instance(ty)
	};
	let receiver = Value::ObjRef(Some(Rc::clone(&obj)));
	invoker::invoke(interp, ctor, frame.scope.clone(), Some(receiver), args)?;
	frame.push(Value::ObjRef(Some(obj)));
	Ok(Step::Continue)
}

fn newarr<'l>(interp: &Interpreter<'l>, frame: &mut Frame<'l>, token: crate::raw::indices::metadata_token::MetadataToken) -> Result<(), InterpError> {
	let element_type = interp.resolver().resolve_type(token, &frame.scope)?;
	let len = frame.pop().and_then(|v| v.as_i32()).ok_or_else(underflow)?;
	if len < 0 {
		return Err(InterpError::IndexOutOfRange);
	}
	let array_type = interp.types().get_array(element_type);
	frame.push(Value::ObjRef(Some(Object::new_array(element_type, array_type, len as usize))));
	Ok(())
}

fn ldfld<'l>(interp: &Interpreter<'l>, frame: &mut Frame<'l>, token: crate::raw::indices::metadata_token::MetadataToken) -> Result<(), InterpError> {
	let field = interp.resolver().resolve_field(token, &frame.scope)?;
	let target = frame.pop().ok_or_else(underflow)?;
	let value = match target {
		Value::ObjRef(Some(obj)) => field_slot_value(&obj, field)?,
		Value::ObjRef(None) => return Err(InterpError::NullReference),
		Value::ManagedRef(r) => match r.load() {
			Value::ValueType(instance) => {
				let idx = instance.field_index(field.name()).ok_or_else(|| InterpError::MissingField(field.name().to_string()))?;
				instance.fields[idx].clone()
			}
			Value::ObjRef(Some(obj)) => field_slot_value(&obj, field)?,
			_ => return Err(InterpError::InvalidProgram("ldfld on non-object managed ref".into())),
		},
		Value::ValueType(instance) => {
			let idx = instance.field_index(field.name()).ok_or_else(|| InterpError::MissingField(field.name().to_string()))?;
			instance.fields[idx].clone()
		}
		_ => return Err(InterpError::InvalidProgram("ldfld on non-object value".into())),
	};
	frame.push(promote_narrow(value));
	Ok(())
}

fn field_slot_value<'l>(obj: &crate::interp::value::ObjectRef<'l>, field: &crate::schema::r#type::Field<'l>) -> Result<Value<'l>, InterpError> {
	let idx = field_index_in(obj.ty, field);
	Ok(obj.data.borrow().field(idx).clone())
}

fn field_index_in<'l>(ty: &'l crate::schema::r#type::Type<'l>, field: &crate::schema::r#type::Field<'l>) -> usize {
	let mut idx = 0;
	for ancestor in ty.ancestors().collect::<Vec<_>>().into_iter().rev() {
		for f in ancestor.fields().iter().filter(|f| !f.is_static()) {
			if std::ptr::eq(f, field) {
				return idx;
			}
			idx += 1;
		}
	}
	idx
}

fn ldflda<'l>(interp: &Interpreter<'l>, frame: &mut Frame<'l>, token: crate::raw::indices::metadata_token::MetadataToken) -> Result<(), InterpError> {
	let field = interp.resolver().resolve_field(token, &frame.scope)?;
	let target = frame.pop().ok_or_else(underflow)?;
	let Value::ObjRef(Some(obj)) = target else {
		return Err(InterpError::NullReference);
	};
	let index = field_index_in(obj.ty, field);
	frame.push(Value::ManagedRef(ManagedRef::Field { owner: obj, index }));
	Ok(())
}

fn stfld<'l>(interp: &Interpreter<'l>, frame: &mut Frame<'l>, token: crate::raw::indices::metadata_token::MetadataToken) -> Result<(), InterpError> {
	let field = interp.resolver().resolve_field(token, &frame.scope)?;
	let value = frame.pop().ok_or_else(underflow)?;
	let target = frame.pop().ok_or_else(underflow)?;
	let Value::ObjRef(Some(obj)) = target else {
		return Err(InterpError::NullReference);
	};
	let index = field_index_in(obj.ty, field);
	*obj.data.borrow_mut().field_mut(index) = value;
	Ok(())
}

fn ldsfld<'l>(interp: &Interpreter<'l>, frame: &mut Frame<'l>, token: crate::raw::indices::metadata_token::MetadataToken) -> Result<(), InterpError> {
	let field = interp.resolver().resolve_field(token, &frame.scope)?;
	interp.ensure_cctor(field.declaring_type(), frame.scope.clone())?;
	frame.push(promote_narrow(interp.statics().get_or_default(field)));
	Ok(())
}

fn stsfld<'l>(interp: &Interpreter<'l>, frame: &mut Frame<'l>, token: crate::raw::indices::metadata_token::MetadataToken) -> Result<(), InterpError> {
	let field = interp.resolver().resolve_field(token, &frame.scope)?;
	interp.ensure_cctor(field.declaring_type(), frame.scope.clone())?;
	let value = frame.pop().ok_or_else(underflow)?;
	interp.statics().set(field, value);
	Ok(())
}

fn box_value<'l>(interp: &Interpreter<'l>, frame: &mut Frame<'l>, token: crate::raw::indices::metadata_token::MetadataToken) -> Result<(), InterpError> {
	let ty = interp.resolver().resolve_type(token, &frame.scope)?;
	let v = frame.pop().ok_or_else(underflow)?;
	let boxed = match v {
		Value::ValueType(instance) => Object::new_boxed(ty, instance),
		other => Object::new_boxed(ty, ValueTypeInstance { ty, fields: Box::new([other]) }),
	};
	frame.push(Value::ObjRef(Some(boxed)));
	Ok(())
}

fn unbox<'l>(interp: &Interpreter<'l>, frame: &mut Frame<'l>, token: crate::raw::indices::metadata_token::MetadataToken, by_value: bool) -> Result<(), InterpError> {
	let ty = interp.resolver().resolve_type(token, &frame.scope)?;
	let v = frame.pop().ok_or_else(underflow)?;
	let Value::ObjRef(Some(obj)) = v else {
		return Err(InterpError::NullReference);
	};
	if !std::ptr::eq(obj.ty, ty) {
		return Err(InterpError::InvalidCast { value_type: obj.ty.to_string(), target_type: ty.to_string() });
	}
	let ObjectData::Boxed(instance) = &*obj.data.borrow() else {
		return Err(InterpError::InvalidCast { value_type: obj.ty.to_string(), target_type: ty.to_string() });
	};
	if by_value {
		frame.push(Value::ValueType(instance.clone()));
	} else {
		frame.push(Value::ManagedRef(ManagedRef::Field { owner: Rc::clone(&obj), index: 0 }));
	}
	Ok(())
}

fn cast<'l>(interp: &Interpreter<'l>, frame: &mut Frame<'l>, token: crate::raw::indices::metadata_token::MetadataToken, throws: bool) -> Result<(), InterpError> {
	let ty = interp.resolver().resolve_type(token, &frame.scope)?;
	let v = frame.pop().ok_or_else(underflow)?;
	match &v {
		Value::ObjRef(None) => frame.push(v),
		Value::ObjRef(Some(obj)) if obj.ty.is_assignable_to(ty) => frame.push(v),
		Value::ObjRef(Some(obj)) => {
			if throws {
				return Err(InterpError::InvalidCast { value_type: obj.ty.to_string(), target_type: ty.to_string() });
			}
			frame.push(Value::ObjRef(None));
		}
		_ => return Err(InterpError::InvalidProgram("isinst/castclass on non-reference value".into())),
	}
	Ok(())
}

fn initobj<'l>(interp: &Interpreter<'l>, frame: &mut Frame<'l>, token: crate::raw::indices::metadata_token::MetadataToken) -> Result<(), InterpError> {
	let ty = interp.resolver().resolve_type(token, &frame.scope)?;
	let target = pop_managed_ref(frame)?;
	target.store(Value::default_for(ty));
	Ok(())
}

fn call<'l>(
	interp: &Interpreter<'l>,
	frame: &mut Frame<'l>,
	token: crate::raw::indices::metadata_token::MetadataToken,
	virt: bool,
) -> Result<Step<'l>, ExecOutcome<'l>> {
	if invoker::is_external_ctor_chain_call(token.kind()) && matches!(token.kind(), MetadataTokenKind::MemberRef) {
		// Best-effort base-constructor chain: pop `this` and discard, no other
		// arguments expected for the recognized pattern (see `invoker`).
		frame.pop();
		return Ok(Step::Continue);
	}

	let method = interp.resolver().resolve_method(token, &frame.scope)?;
	let argc = method.parameters().len();
	if frame.stack.len() < argc {
		return Err(underflow().into());
	}
	let args = frame.stack.split_off(frame.stack.len() - argc);

	let receiver = if !method.is_static() {
		Some(frame.pop().ok_or_else(underflow)?)
	} else {
		None
	};

	let target_method = if virt {
		match (&receiver, frame.constrained_type.take()) {
			(_, Some(constraint)) => invoker::resolve_constrained(method, constraint),
			(Some(Value::ObjRef(Some(obj))), None) => invoker::resolve_virtual(method, obj.ty),
			_ => method,
		}
	} else {
		method
	};

	if let Some(Value::ObjRef(None)) = &receiver {
		return Err(InterpError::NullReference.into());
	}

	let result = invoker::invoke(interp, target_method, frame.scope.clone(), receiver, args)?;
	if !is_void(target_method.return_type()) {
		frame.push(result);
	}
	Ok(Step::Continue)
}

fn is_void(ty: &crate::schema::r#type::Type) -> bool {
	ty.namespace() == "System" && ty.name() == "Void"
}

fn leave<'l>(interp: &Interpreter<'l>, frame: &mut Frame<'l>, from: u64, next: u64, offset: i64) -> Result<Step<'l>, InterpError> {
	// Scan from `leave`'s own start offset, not `next`: a `leave` that is the
	// last instruction of its `try` block has `next == try_offset + try_length`,
	// which `regions_enclosing` would judge as outside that `try` region.
	frame.stack.clear();
	let target = (next as i64 + offset) as u64;
	let mut regions = exceptions::finally_regions_for_leave(frame, from, target);
	if !regions.is_empty() {
		let first = regions.remove(0);
		regions.reverse();
		frame.leave_finally_queue = regions;
		frame.pending_leave_target = Some(target);
		frame.cursor = first;
	} else {
		frame.cursor = target;
	}
	let _ = interp;
	Ok(Step::Continue)
}
