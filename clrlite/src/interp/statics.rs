//! Static-field storage and once-only `.cctor` execution (spec §5).
//!
//! State is keyed by `(type descriptor, field descriptor)` identity (pointer
//! identity of both, which the schema layer already interns). Each type gets
//! a state cell tracking whether its static constructor has run, is running
//! on the current thread, or hasn't started, matching ECMA-335 §I.8.9.5:
//! recursive re-entry on the same thread is treated as "done for this thread"
//! so a `.cctor` that (directly or transitively) touches its own type's
//! statics doesn't deadlock.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::ThreadId;

use crate::interp::value::Value;
use crate::schema::r#type::{Field, Type};

enum CctorState {
	NotStarted,
	Running(ThreadId),
	Done,
}

pub struct StaticsTable<'l> {
	cctor_state: Mutex<HashMap<*const Type<'l>, CctorState>>,
	fields: RefCell<HashMap<*const Field<'l>, Value<'l>>>,
}

impl<'l> StaticsTable<'l> {
	pub fn new() -> Self {
		Self {
			cctor_state: Mutex::new(HashMap::new()),
			fields: RefCell::new(HashMap::new()),
		}
	}

	/// Returns `true` if the caller must now run `ty`'s `.cctor` (it was
	/// `NotStarted`); `false` if it's already running on this thread or done.
	pub fn begin_cctor(&self, ty: &'l Type<'l>) -> bool {
		let mut state = self.cctor_state.lock().unwrap();
		let current = std::thread::current().id();
		match state.get(&(ty as *const _)) {
			None | Some(CctorState::NotStarted) => {
				tracing::debug!(type_ptr = ?(ty as *const _), "running static constructor");
				state.insert(ty as *const _, CctorState::Running(current));
				true
			}
			Some(CctorState::Running(thread)) if *thread == current => false,
			Some(CctorState::Running(_)) => {
				// Another thread is running it: block until done. The core is
				// single-threaded per instance (spec §5), so this only matters
				// if a `StaticsTable` is ever shared across instances; block
				// cooperatively by spinning the lock rather than a condvar,
				// since cross-instance sharing isn't a supported configuration.
				drop(state);
				loop {
					std::thread::yield_now();
					let state = self.cctor_state.lock().unwrap();
					match state.get(&(ty as *const _)) {
						Some(CctorState::Done) => return false,
						Some(CctorState::Running(thread)) if *thread == current => return false,
						_ => continue,
					}
				}
			}
			Some(CctorState::Done) => false,
		}
	}

	pub fn finish_cctor(&self, ty: &'l Type<'l>) {
		let mut state = self.cctor_state.lock().unwrap();
		state.insert(ty as *const _, CctorState::Done);
	}

	pub fn get(&self, field: &'l Field<'l>) -> Option<Value<'l>> {
		self.fields.borrow().get(&(field as *const _)).cloned()
	}

	pub fn set(&self, field: &'l Field<'l>, value: Value<'l>) {
		self.fields.borrow_mut().insert(field as *const _, value);
	}

	pub fn get_or_default(&self, field: &'l Field<'l>) -> Value<'l> {
		self.get(field).unwrap_or_else(|| Value::default_for(field.field_type()))
	}
}

impl<'l> Default for StaticsTable<'l> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use bumpalo::Bump;

	use crate::raw::indices::metadata_token::MetadataToken;
	use crate::schema::r#type::PrimitiveType;
	use crate::schema::DataPool;

	use super::*;

	fn test_field<'l>(declaring_type: &'l Type<'l>, field_type: &'l Type<'l>) -> Field<'l> {
		Field {
			metadata_token: MetadataToken::try_from(0x04000001u32).unwrap(),
			name: "Counter",
			declaring_type,
			field_type,
			is_static: true,
		}
	}

	#[test]
	fn cctor_runs_exactly_once() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let ty = pool.types().get_primitive(PrimitiveType::Int32);
		let table = StaticsTable::new();

		assert!(table.begin_cctor(ty), "first call must request the cctor run");
		assert!(!table.begin_cctor(ty), "reentrant call on the same thread must not re-request it");
		table.finish_cctor(ty);
		assert!(!table.begin_cctor(ty), "once done, never requested again");
	}

	#[test]
	fn distinct_types_have_independent_state() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let a = pool.types().get_primitive(PrimitiveType::Int32);
		let b = pool.types().get_primitive(PrimitiveType::Int64);
		let table = StaticsTable::new();

		assert!(table.begin_cctor(a));
		assert!(table.begin_cctor(b), "a different type's cctor is independent of `a`'s state");
	}

	#[test]
	fn field_storage_defaults_then_round_trips() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let declaring_type = pool.types().get_primitive(PrimitiveType::Int32);
		let field_type = pool.types().get_primitive(PrimitiveType::Int32);
		let field = test_field(declaring_type, field_type);
		let table = StaticsTable::new();

		assert!(table.get(&field).is_none());
		match table.get_or_default(&field) {
			Value::I32(0) => {}
			other => panic!("expected zeroed default, got {other:?}"),
		}

		table.set(&field, Value::I32(42));
		match table.get(&field) {
			Some(Value::I32(42)) => {}
			other => panic!("expected stored value, got {other:?}"),
		}
	}
}
