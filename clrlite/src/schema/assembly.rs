use std::cell::Cell;
use std::fmt::Debug;
use std::io::Cursor;
use std::path::Path;

use bumpalo::Bump;
use derivative::Derivative;

use crate::raw::assembly::Assembly as RawAssembly;
use crate::raw::FromByteStream;
use crate::raw::heaps::{BlobHeap as RawBlobHeap, StringHeap as RawStringHeap};
use crate::raw::heaps::table::{FieldAttributes, FieldTable, MethodDefTable, StandAloneSigTable, TableHeap, TypeAttributes, TypeDefTable};
use crate::raw::il::{MethodBody as RawMethodBody, MethodSignature, OpCodeIterator, TypeSignature, TypeSignatureTag};
use crate::raw::indices::metadata_token;
use crate::raw::indices::metadata_token::{MethodDef, TypeDef};
use crate::raw::pe::PEFile;
use crate::schema::errors::ReadError;
use crate::schema::heaps::{BlobHeap, DataPool, StringHeap};
use crate::schema::method::{Method, MethodBody};
use crate::schema::r#type::{Field, GenericTypeInstantiationError, PrimitiveType, Type, TypeData, TypeKind, TypePool};
use crate::utilities::get_string_from_heap;

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Assembly<'l> {
	#[derivative(Debug="ignore")]
	data_pool: &'l DataPool<'l>,
	string_heap: StringHeap<'l>,
	method_defs: &'l [Method<'l>],
	type_defs: &'l [&'l Type<'l>],
	field_defs: &'l [&'l Field<'l>],
	user_strings: &'l [u8],
}

impl<'l> Assembly<'l> {
	#[cfg(feature = "memmap2")]
	pub fn from_path(pool: &'l DataPool<'l>, path: impl AsRef<Path>) -> Result<Self, ReadError> {
		let file = std::fs::File::open(path)?;
		let bytes = unsafe { memmap2::Mmap::map(&file) }?;
		Self::from_bytes(pool, bytes.as_ref())
	}

	#[cfg(not(feature = "memmap2"))]
	pub fn from_path(pool: &'l DataPool<'l>, path: impl AsRef<Path>) -> Result<Self, ReadError> {
		let bytes = std::fs::read(path)?;
		Self::from_bytes(pool, bytes.as_slice())
	}

	#[inline]
	pub fn from_bytes(pool: &'l DataPool<'l>, bytes: &[u8]) -> Result<Self, ReadError> {
		let mut cursor = Cursor::new(bytes);
		let pe = PEFile::read(&mut cursor, &())?;
		let raw = RawAssembly::try_from(pe)?;
		Self::from_raw_assembly(pool, &raw)
	}

	#[inline(never)]
	#[tracing::instrument(skip_all)]
	pub fn from_raw_assembly(data_pool: &'l DataPool<'l>, raw: &RawAssembly) -> Result<Self, ReadError> {
		let bump = data_pool.bump();

		let tables = raw
			.metadata_root()
			.get_heap::<TableHeap>()
			.ok_or(ReadError::MissingMetadataHeap("#~"))?;

		let blobs = raw
			.metadata_root()
			.get_heap::<RawBlobHeap>()
			.ok_or(ReadError::MissingMetadataHeap("#Blob"))?;

		let strings = raw
			.metadata_root()
			.get_heap::<RawStringHeap>()
			.ok_or(ReadError::MissingMetadataHeap("#String"))?;

		let user_strings = raw
			.metadata_root()
			.get_heap::<crate::raw::heaps::UserStringHeap>()
			.map(|heap| bump.alloc_slice_copy(heap.data()) as &[u8])
			.unwrap_or(&[]);

		let mut blob_heap = BlobHeap::new(bump);
		let mut string_heap = StringHeap::new(bump);

		let (types, field_defs) = read_types(ReadTypesDependencies {
			pool: data_pool,
			tables,
			blobs,
			strings,
			string_heap: &mut string_heap,
		})?;

		let methods = read_methods(ReadMethodsDependencies {
			pool: data_pool,
			pe_file: raw.pe_file(),
			tables,
			blobs,
			strings,
			blob_heap: &mut blob_heap,
			string_heap: &mut string_heap,
			types,
		})?;

		Ok(Self { data_pool, string_heap, method_defs: methods, type_defs: types, field_defs, user_strings })
	}

	#[inline]
	pub fn data_pool(&self) -> &'l DataPool<'l> {
		self.data_pool
	}

	#[inline]
	pub fn methods(&self) -> &'l [Method<'l>] {
		self.method_defs
	}

	#[inline]
	pub fn types(&self) -> &'l [&'l Type<'l>] {
		self.type_defs
	}

	/// Looks up a method by its `MethodDef` token. Tokens are 1-based row
	/// indices into the `MethodDef` table (ECMA-335 §II.22.26).
	pub fn get_method(&self, token: MethodDef) -> Option<&Method<'l>> {
		token.0.checked_sub(1).and_then(|idx| self.method_defs.get(idx))
	}

	/// Looks up a type by its `TypeDef` token. Tokens are 1-based row indices
	/// into the `TypeDef` table (ECMA-335 §II.22.37).
	pub fn get_type(&self, token: TypeDef) -> Option<&'l Type<'l>> {
		token.0.checked_sub(1).and_then(|idx| self.type_defs.get(idx)).copied()
	}

	/// Looks up a field by its `Field` token. Tokens are 1-based row indices
	/// into the `Field` table (ECMA-335 §II.22.15).
	pub fn get_field(&self, token: metadata_token::Field) -> Option<&'l Field<'l>> {
		token.0.checked_sub(1).and_then(|idx| self.field_defs.get(idx)).copied()
	}

	/// Reads the string literal a `ldstr` token addresses. Unlike the other
	/// token kinds, a `String` token's value is a direct byte offset into the
	/// `#US` heap rather than a table row index (ECMA-335 §II.24.2.4).
	pub fn get_user_string(&self, offset: usize) -> Option<String> {
		crate::raw::heaps::UserStringHeap::from(self.user_strings).get(offset)
	}
}

#[cfg(test)]
impl<'l> Assembly<'l> {
	/// Builds an `Assembly` straight from already-constructed method/type
	/// tables, bypassing PE/metadata parsing entirely. `token.index()`
	/// for a `MethodDef`/`TypeDef` must match the 1-based position the
	/// fixture's bytecode references via `get_method`/`get_type`.
	pub(crate) fn for_test(
		data_pool: &'l DataPool<'l>,
		bump: &'l Bump,
		method_defs: &'l [Method<'l>],
		type_defs: &'l [&'l Type<'l>],
	) -> Self {
		Self::for_test_with_fields(data_pool, bump, method_defs, type_defs, &[])
	}

	/// Same as [`Self::for_test`], plus a `Field` table so fixtures exercising
	/// `ldsfld`/`stsfld` can resolve a `Field` token via `get_field`.
	pub(crate) fn for_test_with_fields(
		data_pool: &'l DataPool<'l>,
		bump: &'l Bump,
		method_defs: &'l [Method<'l>],
		type_defs: &'l [&'l Type<'l>],
		field_defs: &'l [&'l Field<'l>],
	) -> Self {
		Self {
			data_pool,
			string_heap: StringHeap::new(bump),
			method_defs,
			type_defs,
			field_defs,
			user_strings: &[],
		}
	}
}

struct ReadTypesDependencies<'l, 'r> {
	pool: &'l DataPool<'l>,
	tables: &'r TableHeap,
	blobs: &'r RawBlobHeap<'r>,
	strings: &'r RawStringHeap<'r>,
	string_heap: &'r mut StringHeap<'l>,
}

#[tracing::instrument(skip_all)]
fn read_types<'l, 'r>(
	ReadTypesDependencies {
  		pool, tables, blobs, strings, string_heap
	}: ReadTypesDependencies<'l, 'r>
) -> Result<(&'l [&'l Type<'l>], &'l [&'l Field<'l>]), ReadError> {
	let Some(type_defs) = tables.get_table::<TypeDefTable>() else {
		return Ok((&[], &[]));
	};

	let fields = match tables.get_table::<FieldTable>() {
		Some(fields) => fields.rows(),
		None if type_defs.rows().iter().all(|t| t.field_list.index().is_none()) => &[],
		None => return Err(ReadError::MissingMetadataTable("Field")),
	};

	let type_defs = type_defs.rows();
	let types = pool.types().declare_types(type_defs, strings, string_heap)?;
	let mut all_fields: Vec<&'l Field<'l>> = Vec::new();

	for i in 0..types.len() {
		let def = &type_defs[i];
		let metadata_token: metadata_token::MetadataToken = metadata_token::TypeDef(i + 1).into();

		let field_start = def.field_list.index();
		let field_end = field_start.map(|start| match type_defs.get(i + 1) {
			None => fields.len(),
			Some(next) => next.field_list.index().unwrap_or(fields.len()).max(start),
		});

		// Reborrow as shared: no exclusive access to this type is taken again
		// before the pool outlives this function, so 'l is sound here.
		let declaring_type: &'l Type<'l> = unsafe { &*(&*types[i] as *const Type<'l>) };

		let mut schema_fields = Vec::new();
		if let (Some(start), Some(end)) = (field_start, field_end) {
			schema_fields.reserve(end - start);
			for (j, raw_field) in fields[start..end].iter().enumerate() {
				let name = string_heap.intern(get_string_from_heap(strings, raw_field.name)?).as_str();

				let Some(sig_bytes) = blobs.get(raw_field.signature) else {
					return Err(ReadError::InvalidTypeSignature);
				};
				let mut sig_stream = Cursor::new(sig_bytes);
				if u8::read(&mut sig_stream, &())? != 0x06 {
					return Err(ReadError::InvalidTypeSignature);
				}
				let signature = crate::raw::il::TypeSignature::read(&mut sig_stream, tables.index_sizes())
					.map_err(|_| ReadError::InvalidTypeSignature)?;
				let field_type = resolve_type_signature(&signature, types, pool.types())?;

				schema_fields.push(Field {
					metadata_token: metadata_token::Field(start + j + 1).into(),
					name,
					declaring_type,
					field_type,
					is_static: raw_field.flags.contains(FieldAttributes::STATIC),
				});
			}
		}
		let fields_slice: &'l [Field<'l>] = pool.bump().alloc_slice_fill_iter(schema_fields);
		all_fields.extend(fields_slice.iter());

		let base_type = resolve_base_type(def.extends, types);
		let is_value_type = is_value_type_base(def.extends, tables, strings)?;

		let ty = &mut types[i];
		match ty.kind {
			TypeKind::Class => {
				ty.data.set(TypeData::Init {
					metadata_token,
					name: ty.name(),
					namespace: ty.namespace(),
					fields: fields_slice,
					methods: &[],
					is_value_type,
					element_type: None,
					base_type,
				});
			}
			TypeKind::Interface => {
				ty.data.set(TypeData::Init {
					metadata_token,
					name: ty.name(),
					namespace: ty.namespace(),
					fields: fields_slice,
					methods: &[],
					is_value_type: false,
					element_type: None,
					base_type,
				});
			}
			_ => unreachable!(),
		}
	}

	let all_fields: &'l [&'l Field<'l>] = pool.bump().alloc_slice_fill_iter(all_fields);

	// This is fine, it's just the typesystem being iffy
	unsafe { Ok((std::mem::transmute(types), all_fields)) }
}

/// Resolves a `TypeDef.extends` coded index to the base type, when the base
/// lies in this same module. Bases in other modules (almost always the case
/// for `System.Object`, since that lives in a referenced assembly) resolve to
/// `None`: cross-assembly loading is out of scope here, so such types are
/// simply treated as roots of their own inheritance chain.
fn resolve_base_type<'l>(
	extends: crate::raw::indices::coded_index::TypeDefOrRef,
	types: &[&'l mut Type<'l>],
) -> Option<&'l Type<'l>> {
	let token: metadata_token::TypeDef = extends.try_into().ok()?;
	let idx = token.0.checked_sub(1)?;
	let ty = types.get(idx)?;
	Some(unsafe { &*(&**ty as *const Type<'l>) })
}

/// A type is a value type if its (possibly external) base is `System.ValueType`
/// or `System.Enum`. External bases are recognized by name via the `TypeRef`
/// table without needing to load the referenced assembly.
fn is_value_type_base(
	extends: crate::raw::indices::coded_index::TypeDefOrRef,
	tables: &TableHeap,
	strings: &RawStringHeap,
) -> Result<bool, ReadError> {
	let Ok(token) = TryInto::<metadata_token::TypeRef>::try_into(extends) else {
		return Ok(false);
	};
	let Some(idx) = token.0.checked_sub(1) else {
		return Ok(false);
	};
	let Some(type_refs) = tables.get_table::<crate::raw::heaps::table::TypeRefTable>() else {
		return Ok(false);
	};
	let Some(row) = type_refs.rows().get(idx) else {
		return Ok(false);
	};
	let name = get_string_from_heap(strings, row.type_name)?;
	let namespace = get_string_from_heap(strings, row.type_namespace)?;
	Ok(namespace == "System" && (name == "ValueType" || name == "Enum"))
}

struct ReadMethodsDependencies<'l, 'r> {
	pool: &'l DataPool<'l>,
	pe_file: &'r PEFile,
	tables: &'r TableHeap,
	blobs: &'r RawBlobHeap<'r>,
	strings: &'r RawStringHeap<'r>,
	blob_heap: &'r mut BlobHeap<'l>,
	string_heap: &'r mut StringHeap<'l>,
	types: &'l [&'l Type<'l>]
}

/// Finds the `Type` that owns the method at `method_index`, by locating the
/// `TypeDef` row whose `method_list` range contains it (ECMA-335 §II.22.37).
fn find_declaring_type<'l>(
	method_index: usize,
	type_defs: &[crate::raw::heaps::table::TypeDef],
	types: &[&'l Type<'l>],
) -> Option<&'l Type<'l>> {
	let mut owner = None;
	for (i, def) in type_defs.iter().enumerate() {
		match def.method_list.index() {
			Some(start) if start <= method_index => owner = Some(types[i]),
			Some(_) => break,
			None => {}
		}
	}
	owner
}

#[tracing::instrument(skip_all)]
fn read_methods<'l, 'r>(
	ReadMethodsDependencies {
		pool, pe_file, blobs, strings, string_heap, blob_heap, tables, types, ..
	}: ReadMethodsDependencies<'l, 'r>,
) -> Result<&'l [Method<'l>], ReadError> {
	let method_defs = match tables.get_table::<MethodDefTable>() {
		None => return Ok(&[]),
		Some(fields) => fields.rows(),
	};

	let signatures = match tables.get_table::<StandAloneSigTable>() {
		Some(fields) => fields,
		None => return Err(ReadError::MissingMetadataTable("StandAloneSig")),
	};

	let type_defs = tables.get_table::<TypeDefTable>().map(|t| t.rows()).unwrap_or(&[]);
	let object = pool.types().get_primitive(PrimitiveType::Object);

	let mut methods = Vec::with_capacity(method_defs.len());
	for (i, def) in method_defs.iter().enumerate() {
		let name = get_string_from_heap(strings, def.name)?;
		let metadata_token = metadata_token::MethodDef(i + 1);

		let Some(sig_bytes) = blobs.get(def.signature) else {
			return Err(ReadError::InvalidMethodSignature(metadata_token.into()));
		};
		let mut sig_stream = Cursor::new(sig_bytes);
		let signature = MethodSignature::read(&mut sig_stream, tables.index_sizes())
			.map_err(|_| ReadError::InvalidMethodSignature(metadata_token.into()))?;

		let return_type = resolve_type_signature(signature.return_type(), types, pool.types())?;
		let parameter_count = signature.parameter_types().len();
		let parameters = pool.bump().alloc_slice_fill_copy(parameter_count, return_type);
		for (i, tag) in signature.parameter_types().signatures().enumerate() {
			parameters[i] = resolve_type_signature_tag(&tag, types, pool.types())?;
		}

		let declaring_type = find_declaring_type(i, type_defs, types).unwrap_or(object);

		let mut body = None;
		if def.rva != 0 {
			let Some((_, data, _)) = pe_file.resolve_rva(def.rva) else {
				return Err(ReadError::InvalidMethodRVA(def.rva))
			};

			let mut cursor = Cursor::new(data.as_ref());
			let raw_body = RawMethodBody::read(&mut cursor, blobs, signatures, tables.index_sizes())?;
			if let Some(err) = OpCodeIterator::new(raw_body.code).find_map(|(_, v)| v.err()) {
				return Err(ReadError::InvalidMethodCode(metadata_token.into(), err.into()));
			}

			let locals = pool.bump().alloc_slice_fill_copy(
				raw_body.locals.len(),
				pool.types().get_primitive(PrimitiveType::Void)
			);
			for (i, local_sig) in raw_body.locals.iter().enumerate() {
				locals[i] = resolve_type_signature(local_sig, types, pool.types())?;
			}

			let exception_clauses = pool.bump().alloc_slice_copy(&raw_body.exception_clauses);

			body = Some(
				MethodBody {
					max_stack_size: raw_body.max_stack_size,
					init_locals: raw_body.init_locals,
					code: blob_heap.intern(raw_body.code),
					locals,
					exception_clauses,
				}
			);
		}

		methods.push(Method {
			body,
			metadata_token,
			name: string_heap.intern(name),
			attributes: def.flags,
			impl_attributes: def.impl_flags,
			declaring_type,
			parameters,
			return_type,
			generic_arity: signature.generic_param_count(),
		});
	}

	let methods: &'l [Method<'l>] = pool.bump().alloc_slice_fill_iter(methods);
	link_methods_to_types(type_defs, types, methods);
	Ok(methods)
}

/// Slices `methods` (already grouped by declaring type, per ECMA-335's
/// contiguous `MethodList` ranges) back onto each `Type`'s `methods` field.
/// Runs after [`read_types`] has already initialized every type, so each
/// type's other `Init` fields are read back unchanged and only `methods`
/// is replaced.
fn link_methods_to_types<'l>(
	type_defs: &[crate::raw::heaps::table::TypeDef],
	types: &[&'l Type<'l>],
	methods: &'l [Method<'l>],
) {
	for (i, def) in type_defs.iter().enumerate() {
		let Some(start) = def.method_list.index() else { continue };
		let end = type_defs.get(i + 1)
			.and_then(|next| next.method_list.index())
			.map(|next_start| next_start.max(start))
			.unwrap_or(methods.len())
			.min(methods.len());
		let start = start.min(end);

		let ty = types[i];
		if let TypeData::Init { metadata_token, name, namespace, fields, is_value_type, element_type, base_type, .. } = ty.data.get() {
			ty.data.set(TypeData::Init {
				metadata_token, name, namespace, fields, is_value_type, element_type, base_type,
				methods: &methods[start..end],
			});
		}
	}
}

fn resolve_type_signature<'l>(
	sig: &TypeSignature,
	type_defs: &[&'l Type<'l>],
	pool: &'l TypePool<'l>,
) -> Result<&'l Type<'l>, ReadError> {
	resolve_type_signature_tag(&sig.as_tags_tree(), type_defs, pool)
}

fn resolve_type_signature_tag<'l>(
	sig: &TypeSignatureTag,
	type_defs: &[&'l Type<'l>],
	pool: &'l TypePool<'l>,
) -> Result<&'l Type<'l>, ReadError> {
	match sig {
		TypeSignatureTag::Void => Ok(pool.get_primitive(PrimitiveType::Void)),
		TypeSignatureTag::Char => Ok(pool.get_primitive(PrimitiveType::Char)),
		TypeSignatureTag::Bool => Ok(pool.get_primitive(PrimitiveType::Boolean)),
		TypeSignatureTag::Int1 => Ok(pool.get_primitive(PrimitiveType::Int8)),
		TypeSignatureTag::Int2 => Ok(pool.get_primitive(PrimitiveType::Int16)),
		TypeSignatureTag::Int4 => Ok(pool.get_primitive(PrimitiveType::Int32)),
		TypeSignatureTag::Int8 => Ok(pool.get_primitive(PrimitiveType::Int64)),
		TypeSignatureTag::UInt1 => Ok(pool.get_primitive(PrimitiveType::UInt8)),
		TypeSignatureTag::UInt2 => Ok(pool.get_primitive(PrimitiveType::UInt16)),
		TypeSignatureTag::UInt4 => Ok(pool.get_primitive(PrimitiveType::UInt32)),
		TypeSignatureTag::UInt8 => Ok(pool.get_primitive(PrimitiveType::UInt64)),
		TypeSignatureTag::Float => Ok(pool.get_primitive(PrimitiveType::Float)),
		TypeSignatureTag::Double => Ok(pool.get_primitive(PrimitiveType::Double)),
		TypeSignatureTag::String => Ok(pool.get_primitive(PrimitiveType::String)),
		TypeSignatureTag::IntPtr => Ok(pool.get_primitive(PrimitiveType::IntPtr)),
		TypeSignatureTag::UIntPtr => Ok(pool.get_primitive(PrimitiveType::UIntPtr)),
		TypeSignatureTag::Object => Ok(pool.get_primitive(PrimitiveType::Object)),
		TypeSignatureTag::TypedByRef => Ok(pool.get_primitive(PrimitiveType::TypedByRef)),

		TypeSignatureTag::Pointer(base) => {
			let base = resolve_type_signature(base, type_defs, pool)?;
			Ok(pool.get_pointer(base))
		},
		TypeSignatureTag::Reference(base) => {
			let base = resolve_type_signature(base, type_defs, pool)?;
			Ok(pool.get_reference(base))
		},

		TypeSignatureTag::ValueType(token) | TypeSignatureTag::ClassType(token) => {
			if let Ok(type_def) = TryInto::<metadata_token::TypeDef>::try_into(*token) {
				return match type_def.0 {
					0 => Err(ReadError::InvalidTypeSignature),
					_ => type_defs
						.get(type_def.0 - 1)
						.cloned()
						.ok_or(ReadError::InvalidTypeSignature),
				}
			}
			if let Ok(type_ref) = TryInto::<metadata_token::TypeRef>::try_into(*token) {
				unimplemented!()
			}
			unreachable!()
		},

		TypeSignatureTag::GenericInst(inst) => unsafe {
			// IDK what the hell is happening here, wonky borrow checker.
			let ty: &Type = std::mem::transmute(resolve_type_signature(inst.ty(), type_defs, pool)?);
			let mut params = Vec::with_capacity(inst.params_count());
			for sig in inst.params() {
				let ty = resolve_type_signature_tag(&sig, type_defs, pool)?;
				params.push(ty);
			}
			if !matches!(ty.kind, TypeKind::Class | TypeKind::Interface) {
				return Err(ReadError::InvalidTypeSignature);
			}
			match pool.get_generic_instantiation(ty, &params) {
				Ok(ty) => Ok(ty),
				Err(err) => match err {
					GenericTypeInstantiationError::TypeIsNotLoaded => Err(ReadError::InvalidTypeSignature),
					GenericTypeInstantiationError::TypeIsNotGeneric => Err(ReadError::InvalidTypeSignature),
					GenericTypeInstantiationError::InvalidGenericParameterCount => Err(ReadError::InvalidTypeSignature),
				}
			}
		},

		// TODO Make function pointer
		TypeSignatureTag::FnPointer(_) => {
			Ok(pool.get_primitive(PrimitiveType::Unimplemented))
		}

		// TODO Return variable signature flags
		TypeSignatureTag::SzArray(sig) => {
			let ty = resolve_type_signature(sig, type_defs, pool)?;
			Ok(pool.get_array(ty))
		},

		TypeSignatureTag::GenericParam(idx) => {
			// TODO Validate index
			Ok(pool.get_generic_type_param(*idx))
		}

		TypeSignatureTag::MethodGenericParam(idx) => {
			// TODO Validate index
			Ok(pool.get_generic_method_param(*idx))
		}

		// TODO Return variable signature flags
		TypeSignatureTag::Pinned(sig) => {
			resolve_type_signature(sig, type_defs, pool)
		},

		_ => unimplemented!("Unimplemented TypeSignatureTag {sig:#X?}"),
	}
}
