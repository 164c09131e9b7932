//! Generic scopes: an ordered binding from each open generic parameter in
//! lexical nesting (type parameters outer, method parameters inner) to a
//! concrete type. Represented as a persistent, `Rc`-shared linked list so
//! extending a scope is O(1) and scopes can be freely shared between
//! concurrent resolutions (design note: "Generic scope composition").

use std::rc::Rc;

use crate::schema::r#type::Type;

#[derive(Clone)]
pub struct GenericScope<'l> {
	type_args: Rc<[&'l Type<'l>]>,
	method_args: Rc<[&'l Type<'l>]>,
}

impl<'l> GenericScope<'l> {
	pub fn empty() -> Self {
		Self { type_args: Rc::from([]), method_args: Rc::from([]) }
	}

	pub fn new(type_args: Vec<&'l Type<'l>>, method_args: Vec<&'l Type<'l>>) -> Self {
		Self { type_args: type_args.into(), method_args: method_args.into() }
	}

	/// `!0`, `!1`, ... refer to the outermost (declaring) type's parameters.
	pub fn type_param(&self, index: u32) -> Option<&'l Type<'l>> {
		self.type_args.get(index as usize).copied()
	}

	/// `!!0`, `!!1`, ... refer to the current method's own parameters.
	pub fn method_param(&self, index: u32) -> Option<&'l Type<'l>> {
		self.method_args.get(index as usize).copied()
	}

	pub fn type_args(&self) -> &[&'l Type<'l>] {
		&self.type_args
	}

	pub fn method_args(&self) -> &[&'l Type<'l>] {
		&self.method_args
	}
}

#[cfg(test)]
mod tests {
	use bumpalo::Bump;

	use crate::schema::r#type::PrimitiveType;
	use crate::schema::DataPool;

	use super::*;

	#[test]
	fn empty_scope_resolves_nothing() {
		let scope = GenericScope::empty();
		assert!(scope.type_param(0).is_none());
		assert!(scope.method_param(0).is_none());
	}

	#[test]
	fn type_and_method_params_are_independent() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let int32 = pool.types().get_primitive(PrimitiveType::Int32);
		let string = pool.types().get_primitive(PrimitiveType::String);

		let scope = GenericScope::new(vec![int32], vec![string]);
		assert!(std::ptr::eq(scope.type_param(0).unwrap(), int32));
		assert!(std::ptr::eq(scope.method_param(0).unwrap(), string));
		assert!(scope.type_param(1).is_none());
		assert!(scope.method_param(1).is_none());
	}

	#[test]
	fn clone_shares_bindings() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let int32 = pool.types().get_primitive(PrimitiveType::Int32);

		let scope = GenericScope::new(vec![int32], vec![]);
		let cloned = scope.clone();
		assert!(std::ptr::eq(cloned.type_param(0).unwrap(), int32));
	}
}
