//! Runtime values and the interpreted object graph.
//!
//! Mirrors CIL's evaluation-stack promotion rules (ECMA-335 §III.1.5): values
//! narrower than 32 bits are not representable on the stack, only as locals,
//! fields, or array elements, where [`Value::Narrow`] carries them.

use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use crate::schema::method::Method;
use crate::schema::r#type::Type;

/// A value living on the evaluation stack, in a local, an argument slot, a
/// field, or an array element. Reference types and boxed value types are
/// shared via [`Rc`]; the host GC this interpreter delegates to is modeled by
/// simply letting the last `Rc` drop.
#[derive(Clone)]
pub enum Value<'l> {
	/// `int32` stack slot; also holds booleans and chars per ECMA-335 promotion.
	I32(i32),
	/// `int64` stack slot.
	I64(i64),
	/// `native int` stack slot (pointer-sized).
	NativeInt(isize),
	/// Floating-point stack slot (`F` in ECMA-335's notation); F32/F64 merge here.
	F(f64),
	/// A sub-32-bit value as stored in a local, field, or array element. Never
	/// appears directly on the evaluation stack; loads promote it to `I32`.
	Narrow(NarrowValue),
	/// Object reference, or `null`.
	ObjRef(Option<ObjectRef<'l>>),
	/// A managed pointer: an address of a local, argument, field, or array
	/// element, distinct from an object reference (ECMA-335 §III.1.1.1.3).
	ManagedRef(ManagedRef<'l>),
	/// A value-type instance, copied by value on load/store/pass/return.
	ValueType(ValueTypeInstance<'l>),
}

#[derive(Debug, Copy, Clone)]
pub enum NarrowValue {
	I8(i8),
	U8(u8),
	I16(i16),
	U16(u16),
	Bool(bool),
	Char(u16),
	F32(f32),
}

impl<'l> Value<'l> {
	pub fn default_for(ty: &'l Type<'l>) -> Self {
		use crate::schema::r#type::{PrimitiveType, TypeKind};
		if ty.is_value_type() {
			return Value::ValueType(ValueTypeInstance::zeroed(ty));
		}
		match ty.kind {
			TypeKind::Primitive => match primitive_kind(ty) {
				Some(PrimitiveType::Int64 | PrimitiveType::UInt64) => Value::I64(0),
				Some(PrimitiveType::Float | PrimitiveType::Double) => Value::F(0.0),
				Some(PrimitiveType::IntPtr | PrimitiveType::UIntPtr) => Value::NativeInt(0),
				_ => Value::I32(0),
			},
			_ => Value::ObjRef(None),
		}
	}

	pub fn as_i32(&self) -> Option<i32> {
		match self {
			Value::I32(v) => Some(*v),
			Value::NativeInt(v) => Some(*v as i32),
			_ => None,
		}
	}

	pub fn as_i64(&self) -> Option<i64> {
		match self {
			Value::I64(v) => Some(*v),
			Value::I32(v) => Some(*v as i64),
			Value::NativeInt(v) => Some(*v as i64),
			_ => None,
		}
	}

	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Value::F(v) => Some(*v),
			_ => None,
		}
	}

	pub fn is_truthy(&self) -> bool {
		match self {
			Value::I32(v) => *v != 0,
			Value::I64(v) => *v != 0,
			Value::NativeInt(v) => *v != 0,
			Value::F(v) => *v != 0.0,
			Value::ObjRef(v) => v.is_some(),
			Value::ManagedRef(_) => true,
			Value::Narrow(_) | Value::ValueType(_) => true,
		}
	}
}

impl Debug for Value<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Value::I32(v) => write!(f, "I32({v})"),
			Value::I64(v) => write!(f, "I64({v})"),
			Value::NativeInt(v) => write!(f, "NativeInt({v})"),
			Value::F(v) => write!(f, "F({v})"),
			Value::Narrow(v) => write!(f, "Narrow({v:?})"),
			Value::ObjRef(None) => write!(f, "null"),
			Value::ObjRef(Some(o)) => write!(f, "ObjRef({})", o.ty),
			Value::ManagedRef(_) => write!(f, "ManagedRef"),
			Value::ValueType(v) => write!(f, "ValueType({})", v.ty),
		}
	}
}

fn primitive_kind(ty: &Type) -> Option<crate::schema::r#type::PrimitiveType> {
	use crate::schema::r#type::PrimitiveType::*;
	Some(match (ty.namespace(), ty.name()) {
		("System", "Void") => Void,
		("System", "Boolean") => Boolean,
		("System", "Char") => Char,
		("System", "Int8") => Int8,
		("System", "UInt8") => UInt8,
		("System", "Int16") => Int16,
		("System", "UInt16") => UInt16,
		("System", "Int32") => Int32,
		("System", "UInt32") => UInt32,
		("System", "Int64") => Int64,
		("System", "UInt64") => UInt64,
		("System", "Float") => Float,
		("System", "Double") => Double,
		("System", "String") => String,
		("System", "IntPtr") => IntPtr,
		("System", "UIntPtr") => UIntPtr,
		("System", "Object") => Object,
		_ => return None,
	})
}

/// A value-type instance: an ordered, by-value snapshot of its declared
/// fields. Cloning deep-copies the payload, matching CIL's by-value local,
/// argument, and return semantics for value types.
#[derive(Clone)]
pub struct ValueTypeInstance<'l> {
	pub ty: &'l Type<'l>,
	pub fields: Box<[Value<'l>]>,
}

impl<'l> ValueTypeInstance<'l> {
	pub fn zeroed(ty: &'l Type<'l>) -> Self {
		let fields = ty.fields().iter()
			.filter(|f| !f.is_static())
			.map(|f| Value::default_for(f.field_type()))
			.collect();
		Self { ty, fields }
	}

	pub fn field_index(&self, name: &str) -> Option<usize> {
		self.ty.fields().iter().filter(|f| !f.is_static()).position(|f| f.name() == name)
	}
}

/// A managed reference: a by-ref pointer to a local, argument, field, or
/// array element. Unlike an object reference it may point into the middle of
/// an aggregate and is not itself a GC root in the host sense.
#[derive(Clone)]
pub enum ManagedRef<'l> {
	Local(Rc<RefCell<Value<'l>>>),
	Field { owner: ObjectRef<'l>, index: usize },
	ArrayElement { array: ObjectRef<'l>, index: usize },
}

impl<'l> ManagedRef<'l> {
	pub fn load(&self) -> Value<'l> {
		match self {
			ManagedRef::Local(cell) => cell.borrow().clone(),
			ManagedRef::Field { owner, index } => owner.data.borrow().field(*index).clone(),
			ManagedRef::ArrayElement { array, index } => array.data.borrow().element(*index).clone(),
		}
	}

	pub fn store(&self, value: Value<'l>) {
		match self {
			ManagedRef::Local(cell) => *cell.borrow_mut() = value,
			ManagedRef::Field { owner, index } => *owner.data.borrow_mut().field_mut(*index) = value,
			ManagedRef::ArrayElement { array, index } => *array.data.borrow_mut().element_mut(*index) = value,
		}
	}
}

pub type ObjectRef<'l> = Rc<Object<'l>>;

/// A heap entity: created by `newobj`, by boxing a value type, or by `newarr`.
pub struct Object<'l> {
	pub ty: &'l Type<'l>,
	pub data: RefCell<ObjectData<'l>>,
}

pub enum ObjectData<'l> {
	/// An ordinary instance: one slot per non-static declared field, base
	/// types' fields first (ECMA-335 reflection field-ordering, §4.1).
	Instance(Vec<Value<'l>>),
	/// A boxed value type: exactly one slot holding the unboxed payload.
	Boxed(ValueTypeInstance<'l>),
	/// A single-dimensional, zero-based array (`SzArray`).
	Array { element_type: &'l Type<'l>, elements: Vec<Value<'l>> },
	/// A `System.String` literal. Stored as UTF-16 code units, matching the
	/// `#US` heap's native representation.
	String(Rc<[u16]>),
	/// A delegate: a bound method, optional receiver, and multicast chain.
	Delegate { target: Option<ObjectRef<'l>>, method: &'l Method<'l>, next: Option<ObjectRef<'l>> },
}

impl<'l> ObjectData<'l> {
	pub fn field(&self, index: usize) -> &Value<'l> {
		match self {
			ObjectData::Instance(fields) => &fields[index],
			ObjectData::Boxed(v) => &v.fields[index],
			_ => panic!("field access on non-instance object"),
		}
	}

	pub fn field_mut(&mut self, index: usize) -> &mut Value<'l> {
		match self {
			ObjectData::Instance(fields) => &mut fields[index],
			ObjectData::Boxed(v) => &mut v.fields[index],
			_ => panic!("field access on non-instance object"),
		}
	}

	pub fn element(&self, index: usize) -> &Value<'l> {
		match self {
			ObjectData::Array { elements, .. } => &elements[index],
			_ => panic!("element access on non-array object"),
		}
	}

	pub fn element_mut(&mut self, index: usize) -> &mut Value<'l> {
		match self {
			ObjectData::Array { elements, .. } => &mut elements[index],
			_ => panic!("element access on non-array object"),
		}
	}

	pub fn len(&self) -> usize {
		match self {
			ObjectData::Array { elements, .. } => elements.len(),
			ObjectData::String(s) => s.len(),
			_ => 0,
		}
	}
}

impl<'l> Object<'l> {
	pub fn new_instance(ty: &'l Type<'l>) -> ObjectRef<'l> {
		let mut fields = Vec::new();
		for ancestor in ty.ancestors().collect::<Vec<_>>().into_iter().rev() {
			fields.extend(ancestor.fields().iter().filter(|f| !f.is_static()).map(|f| Value::default_for(f.field_type())));
		}
		Rc::new(Object { ty, data: RefCell::new(ObjectData::Instance(fields)) })
	}

	pub fn new_boxed(ty: &'l Type<'l>, value: ValueTypeInstance<'l>) -> ObjectRef<'l> {
		Rc::new(Object { ty, data: RefCell::new(ObjectData::Boxed(value)) })
	}

	pub fn new_array(element_type: &'l Type<'l>, array_type: &'l Type<'l>, length: usize) -> ObjectRef<'l> {
		let elements = (0..length).map(|_| Value::default_for(element_type)).collect();
		Rc::new(Object { ty: array_type, data: RefCell::new(ObjectData::Array { element_type, elements }) })
	}

	pub fn new_string(array_type: &'l Type<'l>, content: &str) -> ObjectRef<'l> {
		let units: Rc<[u16]> = content.encode_utf16().collect::<Vec<_>>().into();
		Rc::new(Object { ty: array_type, data: RefCell::new(ObjectData::String(units)) })
	}
}

/// Structural (field-wise) equality, used for `Equals` on value types and for
/// boxed-value comparisons (spec property: boxing the same value twice must
/// compare equal without being reference-equal).
pub fn values_structurally_equal(a: &Value, b: &Value) -> bool {
	match (a, b) {
		(Value::I32(x), Value::I32(y)) => x == y,
		(Value::I64(x), Value::I64(y)) => x == y,
		(Value::NativeInt(x), Value::NativeInt(y)) => x == y,
		(Value::F(x), Value::F(y)) => x == y,
		(Value::ObjRef(None), Value::ObjRef(None)) => true,
		(Value::ObjRef(Some(x)), Value::ObjRef(Some(y))) => Rc::ptr_eq(x, y) || objects_structurally_equal(x, y),
		(Value::ValueType(x), Value::ValueType(y)) => {
			std::ptr::eq(x.ty, y.ty) && x.fields.iter().zip(y.fields.iter()).all(|(a, b)| values_structurally_equal(a, b))
		}
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use bumpalo::Bump;

	use crate::schema::r#type::PrimitiveType;
	use crate::schema::DataPool;

	use super::*;

	#[test]
	fn boxing_the_same_value_twice_is_structurally_equal_but_not_reference_equal() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let int32 = pool.types().get_primitive(PrimitiveType::Int32);

		let boxed_a = Object::new_boxed(int32, ValueTypeInstance { ty: int32, fields: Box::new([Value::I32(42)]) });
		let boxed_b = Object::new_boxed(int32, ValueTypeInstance { ty: int32, fields: Box::new([Value::I32(42)]) });
		assert!(!Rc::ptr_eq(&boxed_a, &boxed_b));

		let a = Value::ObjRef(Some(boxed_a));
		let b = Value::ObjRef(Some(boxed_b));
		assert!(values_structurally_equal(&a, &b));
	}

	#[test]
	fn boxed_values_with_different_payloads_are_not_equal() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let int32 = pool.types().get_primitive(PrimitiveType::Int32);

		let boxed_a = Object::new_boxed(int32, ValueTypeInstance { ty: int32, fields: Box::new([Value::I32(1)]) });
		let boxed_b = Object::new_boxed(int32, ValueTypeInstance { ty: int32, fields: Box::new([Value::I32(2)]) });

		let a = Value::ObjRef(Some(boxed_a));
		let b = Value::ObjRef(Some(boxed_b));
		assert!(!values_structurally_equal(&a, &b));
	}

	#[test]
	fn null_references_are_structurally_equal() {
		let a: Value = Value::ObjRef(None);
		let b: Value = Value::ObjRef(None);
		assert!(values_structurally_equal(&a, &b));
	}

	#[test]
	fn default_for_primitive_kinds() {
		let bump = Bump::new();
		let pool = DataPool::new(&bump);
		let int32 = pool.types().get_primitive(PrimitiveType::Int32);
		let int64 = pool.types().get_primitive(PrimitiveType::Int64);
		let double = pool.types().get_primitive(PrimitiveType::Double);
		let object = pool.types().get_primitive(PrimitiveType::Object);

		assert!(matches!(Value::default_for(int32), Value::I32(0)));
		assert!(matches!(Value::default_for(int64), Value::I64(0)));
		assert!(matches!(Value::default_for(double), Value::F(f) if f == 0.0));
		assert!(matches!(Value::default_for(object), Value::ObjRef(None)));
	}
}

fn objects_structurally_equal(a: &ObjectRef, b: &ObjectRef) -> bool {
	if !std::ptr::eq(a.ty, b.ty) {
		return false;
	}
	match (&*a.data.borrow(), &*b.data.borrow()) {
		(ObjectData::Boxed(x), ObjectData::Boxed(y)) => {
			x.fields.iter().zip(y.fields.iter()).all(|(a, b)| values_structurally_equal(a, b))
		}
		(ObjectData::Instance(x), ObjectData::Instance(y)) => {
			x.iter().zip(y.iter()).all(|(a, b)| values_structurally_equal(a, b))
		}
		(ObjectData::String(x), ObjectData::String(y)) => x == y,
		_ => false,
	}
}
