use std::fmt::{Debug, Formatter};
use std::io::{Cursor, Error, ErrorKind};

use crate::raw::heaps::{SizeDebugWrapper, StringIndex};
use crate::utilities::read_compressed_u32;

#[derive(Copy, Clone)]
pub struct StringHeap<'l> {
	data: &'l [u8],
}

impl<'l> TryFrom<&'l [u8]> for StringHeap<'l> {
	type Error = Error;
	fn try_from(data: &'l [u8]) -> Result<Self, Self::Error> {
		match data.as_ref() {
			[0, ..] => Ok(Self { data }),
			_ => Err(ErrorKind::InvalidData.into()),
		}
	}
}

impl<'l> StringHeap<'l> {
	pub fn get(&self, idx: StringIndex) -> Option<&'l str> {
		let slice = self.data.as_ref().get(idx.0..)?;
		let end = slice.iter().position(|c| *c == 0)?;
		std::str::from_utf8(&slice[..end]).ok()
	}
}

impl Debug for StringHeap<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("StringHeap");
		dbg.field("data", &SizeDebugWrapper(self.data.len()));
		dbg.finish()
	}
}

pub struct UserStringHeap<'l> {
	data: &'l [u8],
}

impl<'l> From<&'l [u8]> for UserStringHeap<'l> {
	fn from(data: &'l [u8]) -> Self {
		Self { data }
	}
}

impl<'l> UserStringHeap<'l> {
	/// The heap's raw bytes, for callers that need to retain them past this
	/// heap's own borrow (e.g. copying into a longer-lived arena).
	pub fn data(&self) -> &'l [u8] {
		self.data
	}

	/// Reads the UTF-16LE string literal at byte offset `offset`, whose length
	/// (in bytes, including the trailing flag byte) is a compressed unsigned
	/// integer prefix (ECMA-335 §II.24.2.4). The trailing byte, unused here,
	/// flags whether any character requires non-Latin1 handling.
	pub fn get(&self, offset: usize) -> Option<String> {
		let slice = self.data.get(offset..)?;
		let mut stream = Cursor::new(slice);
		let len = read_compressed_u32(&mut stream).ok()? as usize;
		let start = stream.position() as usize;
		let bytes = slice.get(start..start + len)?;
		let chars = bytes.len().saturating_sub(1) / 2;
		let units: Vec<u16> = (0..chars)
			.map(|i| u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]))
			.collect();
		String::from_utf16(&units).ok()
	}
}

impl Debug for UserStringHeap<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("UserStringHeap");
		dbg.field("data", &SizeDebugWrapper(self.data.len()));
		dbg.finish()
	}
}
