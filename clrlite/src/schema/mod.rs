pub mod assembly;
pub mod r#type;
pub mod method;
mod errors;
mod heaps;

pub use heaps::{DataPool, InternedBytes, InternedString};
pub use errors::ReadError;

/// Test-only bridges into the private `heaps` module: `BlobHeap`/`StringHeap`
/// are `pub(crate)` but unreachable from outside `schema` since `heaps` itself
/// isn't `pub`. Fixture code elsewhere in the crate interns through these.
#[cfg(test)]
pub(crate) fn intern_test_code<'l>(bump: &'l bumpalo::Bump, bytes: &[u8]) -> InternedBytes<'l> {
	heaps::BlobHeap::new(bump).intern(bytes)
}

#[cfg(test)]
pub(crate) fn intern_test_name<'l>(bump: &'l bumpalo::Bump, name: &str) -> InternedString<'l> {
	heaps::StringHeap::new(bump).intern(name)
}
