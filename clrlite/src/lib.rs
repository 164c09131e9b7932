//! A managed-code interpreter for ECMA-335 (CIL) assemblies, without a JIT.
//!
//! [`raw`] exposes the PE/metadata reader: it turns assembly bytes into the
//! tables, heaps and method bodies defined by ECMA-335 with no semantic
//! interpretation attached. [`schema`] builds on top of it to produce a
//! linked, bump-allocated object model (types, methods, fields) suitable for
//! execution. [`interp`] walks that model and actually runs CIL.

pub mod raw;
pub mod schema;
pub mod interp;

mod utilities;
