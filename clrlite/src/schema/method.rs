use derivative::Derivative;

use crate::raw::heaps::table::{MethodAttributes, MethodImplAttributes};
use crate::raw::indices::metadata_token::MethodDef;
use crate::schema::heaps::InternedBytes;
use crate::schema::heaps::InternedString;
use crate::schema::r#type::Type;

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Method<'l> {
	pub(crate) metadata_token: MethodDef,
	pub(crate) name: InternedString<'l>,
	pub(crate) attributes: MethodAttributes,
	pub(crate) impl_attributes: MethodImplAttributes,
	pub(crate) declaring_type: &'l Type<'l>,
	pub(crate) parameters: &'l [&'l Type<'l>],
	pub(crate) return_type: &'l Type<'l>,
	pub(crate) generic_arity: u32,
	pub(crate) body: Option<MethodBody<'l>>,
}

impl<'l> Method<'l> {
	#[inline]
	pub fn name(&self) -> &InternedString<'l> {
		&self.name
	}

	#[inline]
	pub fn metadata_token(&self) -> MethodDef {
		self.metadata_token
	}

	#[inline]
	pub fn attributes(&self) -> MethodAttributes {
		self.attributes
	}

	#[inline]
	pub fn declaring_type(&self) -> &'l Type<'l> {
		self.declaring_type
	}

	#[inline]
	pub fn parameters(&self) -> &'l [&'l Type<'l>] {
		self.parameters
	}

	#[inline]
	pub fn return_type(&self) -> &'l Type<'l> {
		self.return_type
	}

	#[inline]
	pub fn generic_arity(&self) -> u32 {
		self.generic_arity
	}

	#[inline]
	pub fn body(&self) -> Option<&MethodBody<'l>> {
		self.body.as_ref()
	}

	pub fn is_static(&self) -> bool {
		self.attributes.contains(MethodAttributes::STATIC)
	}

	pub fn is_virtual(&self) -> bool {
		self.attributes.contains(MethodAttributes::VIRTUAL)
	}

	pub fn is_abstract(&self) -> bool {
		self.attributes.contains(MethodAttributes::ABSTRACT)
	}

	/// A method is interpretable when it carries a managed CIL body, as
	/// opposed to a runtime-provided or unmanaged implementation.
	pub fn is_interpretable(&self) -> bool {
		self.body.is_some()
			&& !self.attributes.contains(MethodAttributes::PINVOKE_IMPL)
			&& self.impl_attributes.contains(MethodImplAttributes::IL)
			&& !self.impl_attributes.contains(MethodImplAttributes::INTERNAL_CALL)
	}
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct MethodBody<'l> {
	pub max_stack_size: u16,
	pub init_locals: bool,
	pub locals: &'l [&'l Type<'l>],
	pub code: InternedBytes<'l>,
	pub exception_clauses: &'l [crate::raw::il::ExceptionClause],
}
