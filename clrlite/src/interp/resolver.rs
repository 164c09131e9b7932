//! Translates metadata tokens embedded in instruction operands into concrete
//! type/method/field descriptors bound to a [`GenericScope`], caching results
//! (design notes §9, component design §4.2).
//!
//! Cross-assembly references (`TypeRef`, `MemberRef`, `TypeSpec`, `MethodSpec`)
//! are out of scope here for the same reason the schema layer never loads a
//! referenced assembly: there is no assembly-path map collaborator wired in.
//! Encountering one surfaces a `TypeLoad`/`MissingMethod`/`MissingField` error
//! carrying the token rather than panicking.

use std::cell::RefCell;

use fxhash::FxHashMap;

use crate::interp::errors::InterpError;
use crate::interp::scope::GenericScope;
use crate::raw::indices::metadata_token::{self, MetadataToken, MetadataTokenKind};
use crate::schema::assembly::Assembly;
use crate::schema::method::Method;
use crate::schema::r#type::{GenericParamKind, Type};

pub struct Resolver<'l> {
	assembly: &'l Assembly<'l>,
	type_cache: RefCell<FxHashMap<MetadataToken, &'l Type<'l>>>,
	method_cache: RefCell<FxHashMap<MetadataToken, &'l Method<'l>>>,
}

impl<'l> Resolver<'l> {
	pub fn new(assembly: &'l Assembly<'l>) -> Self {
		Self {
			assembly,
			type_cache: RefCell::new(FxHashMap::default()),
			method_cache: RefCell::new(FxHashMap::default()),
		}
	}

	pub fn resolve_type(&self, token: MetadataToken, scope: &GenericScope<'l>) -> Result<&'l Type<'l>, InterpError> {
		if let Some(ty) = self.type_cache.borrow().get(&token) {
			return Ok(concretize(ty, scope));
		}
		let ty = match token.kind() {
			MetadataTokenKind::TypeDef => {
				let def = metadata_token::TypeDef(token.index());
				self.assembly.get_type(def).ok_or_else(|| InterpError::TypeLoad(format!("{token:?}")))?
			}
			MetadataTokenKind::TypeRef => {
				return Err(InterpError::TypeLoad(format!("external type reference {token:?}")));
			}
			_ => return Err(InterpError::TypeLoad(format!("unsupported type token {token:?}"))),
		};
		self.type_cache.borrow_mut().insert(token, ty);
		Ok(concretize(ty, scope))
	}

	pub fn resolve_method(&self, token: MetadataToken, scope: &GenericScope<'l>) -> Result<&'l Method<'l>, InterpError> {
		let _ = scope;
		if let Some(m) = self.method_cache.borrow().get(&token) {
			return Ok(m);
		}
		let m = match token.kind() {
			MetadataTokenKind::MethodDef => {
				let def = metadata_token::MethodDef(token.index());
				self.assembly.get_method(def).ok_or_else(|| InterpError::MissingMethod(format!("{token:?}")))?
			}
			_ => return Err(InterpError::MissingMethod(format!("unsupported method token {token:?}"))),
		};
		self.method_cache.borrow_mut().insert(token, m);
		Ok(m)
	}

	pub fn resolve_field(&self, token: MetadataToken, scope: &GenericScope<'l>) -> Result<&'l crate::schema::r#type::Field<'l>, InterpError> {
		let _ = scope;
		match token.kind() {
			MetadataTokenKind::Field => {
				let def = metadata_token::Field(token.index());
				self.assembly.get_field(def).ok_or_else(|| InterpError::MissingField(format!("{token:?}")))
			}
			_ => Err(InterpError::MissingField(format!("unsupported field token {token:?}"))),
		}
	}

	pub fn assembly(&self) -> &'l Assembly<'l> {
		self.assembly
	}
}

/// Substitutes an open generic-parameter type for its binding in `scope`.
/// Any other type kind passes through unchanged: the schema layer only ever
/// produces `TypeGeneric`/`MethodGeneric` for unresolved parameters (`!0`/`!!0`).
pub fn concretize<'l>(ty: &'l Type<'l>, scope: &GenericScope<'l>) -> &'l Type<'l> {
	match ty.generic_param_kind() {
		Some(GenericParamKind::Type(idx)) => scope.type_param(idx).unwrap_or(ty),
		Some(GenericParamKind::Method(idx)) => scope.method_param(idx).unwrap_or(ty),
		None => ty,
	}
}
