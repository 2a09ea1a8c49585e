// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A very simple serialization framework which is used to serialize/deserialize the gossip wire
//! messages as well as the records handed to the network database. The encoding doubles as the
//! canonical form the channel-update checksum and the signature digests are computed over.

use std::io::{self, Read};

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::constants::COMPACT_SIGNATURE_SIZE;
use bitcoin::hashes::Hash;
use bitcoin::hash_types::BlockHash;

use crate::msgs::DecodeError;

/// A trait that is similar to std::io::Write but has one extra function which can be used to size
/// buffers being written into.
/// An impl is provided for any type that also impls std::io::Write which simply ignores size
/// hints.
pub trait Writer {
	/// Writes the given buf out. See std::io::Write::write_all for more
	fn write_all(&mut self, buf: &[u8]) -> Result<(), io::Error>;
	/// Hints that data of the given size is about to be written. This may not always be called
	/// prior to data being written and may be safely ignored.
	fn size_hint(&mut self, size: usize);
}

impl<W: io::Write> Writer for W {
	#[inline]
	fn write_all(&mut self, buf: &[u8]) -> Result<(), io::Error> {
		<Self as io::Write>::write_all(self, buf)
	}
	#[inline]
	fn size_hint(&mut self, _size: usize) { }
}

/// Writer that collects the written bytes into a Vec.
pub(crate) struct VecWriter(pub Vec<u8>);
impl Writer for VecWriter {
	fn write_all(&mut self, buf: &[u8]) -> Result<(), io::Error> {
		self.0.extend_from_slice(buf);
		Ok(())
	}
	fn size_hint(&mut self, size: usize) {
		self.0.reserve_exact(size);
	}
}

/// A trait that various routing message types implement allowing them to be written out to a
/// Writer
pub trait Writeable {
	/// Writes self out to the given Writer
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error>;

	/// Writes self out to a Vec<u8>
	fn encode(&self) -> Vec<u8> {
		let mut msg = VecWriter(Vec::new());
		self.write(&mut msg).unwrap();
		msg.0
	}
}

/// A trait that various routing message types implement allowing them to be read in from a Read
pub trait Readable where Self: Sized {
	/// Reads a Self in from the given Read
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError>;
}

macro_rules! impl_writeable_primitive {
	($val_type:ty, $len: expr) => {
		impl Writeable for $val_type {
			#[inline]
			fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
				writer.write_all(&self.to_be_bytes())
			}
		}
		impl Readable for $val_type {
			#[inline]
			fn read<R: Read>(reader: &mut R) -> Result<$val_type, DecodeError> {
				let mut buf = [0; $len];
				reader.read_exact(&mut buf)?;
				Ok(<$val_type>::from_be_bytes(buf))
			}
		}
	}
}

impl_writeable_primitive!(u64, 8);
impl_writeable_primitive!(u32, 4);
impl_writeable_primitive!(u16, 2);
impl_writeable_primitive!(u8, 1);

impl Writeable for bool {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&[if *self { 1 } else { 0 }])
	}
}
impl Readable for bool {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<bool, DecodeError> {
		let mut buf = [0; 1];
		reader.read_exact(&mut buf)?;
		match buf[0] {
			0 => Ok(false),
			1 => Ok(true),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

macro_rules! impl_writeable_array {
	($len: expr) => {
		impl Writeable for [u8; $len] {
			#[inline]
			fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
				writer.write_all(self)
			}
		}
		impl Readable for [u8; $len] {
			#[inline]
			fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
				let mut buf = [0; $len];
				reader.read_exact(&mut buf)?;
				Ok(buf)
			}
		}
	}
}

impl_writeable_array!(3);
impl_writeable_array!(4);
impl_writeable_array!(16);
impl_writeable_array!(32);

/// A variable-length unsigned integer as used by the gossip extension records. Values below 0xfd
/// are encoded in one byte, larger values get a marker byte followed by a big-endian u16, u32 or
/// u64. Non-minimal encodings are rejected on read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BigSize(pub u64);
impl Writeable for BigSize {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		match self.0 {
			0..=0xFC => (self.0 as u8).write(writer),
			0xFD..=0xFFFF => {
				0xFDu8.write(writer)?;
				(self.0 as u16).write(writer)
			},
			0x10000..=0xFFFF_FFFF => {
				0xFEu8.write(writer)?;
				(self.0 as u32).write(writer)
			},
			_ => {
				0xFFu8.write(writer)?;
				self.0.write(writer)
			},
		}
	}
}
impl Readable for BigSize {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<BigSize, DecodeError> {
		let n: u8 = Readable::read(reader)?;
		match n {
			0xFF => {
				let x: u64 = Readable::read(reader)?;
				if x < 0x1_0000_0000 { Err(DecodeError::InvalidValue) } else { Ok(BigSize(x)) }
			},
			0xFE => {
				let x: u32 = Readable::read(reader)?;
				if x < 0x1_0000 { Err(DecodeError::InvalidValue) } else { Ok(BigSize(x as u64)) }
			},
			0xFD => {
				let x: u16 = Readable::read(reader)?;
				if x < 0xFD { Err(DecodeError::InvalidValue) } else { Ok(BigSize(x as u64)) }
			},
			n => Ok(BigSize(n as u64)),
		}
	}
}

impl Writeable for Vec<u8> {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		(self.len() as u16).write(writer)?;
		writer.write_all(&self)
	}
}
impl Readable for Vec<u8> {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<Vec<u8>, DecodeError> {
		let len: u16 = Readable::read(reader)?;
		let mut buf = vec![0; len as usize];
		reader.read_exact(&mut buf)?;
		Ok(buf)
	}
}

impl Writeable for Signature {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&self.serialize_compact())
	}
}
impl Readable for Signature {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<Signature, DecodeError> {
		let mut buf = [0; COMPACT_SIGNATURE_SIZE];
		reader.read_exact(&mut buf)?;
		Signature::from_compact(&buf).map_err(|_| DecodeError::InvalidValue)
	}
}

impl Writeable for BlockHash {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&self.into_inner())
	}
}
impl Readable for BlockHash {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<BlockHash, DecodeError> {
		let mut buf = [0; 32];
		reader.read_exact(&mut buf)?;
		Ok(BlockHash::from_slice(&buf).expect("32 bytes"))
	}
}

#[cfg(test)]
mod tests {
	use super::{BigSize, Readable, Writeable};
	use crate::msgs::DecodeError;

	fn bigsize_encode_decode(value: u64, expected_bytes: &[u8]) {
		let encoded = BigSize(value).encode();
		assert_eq!(&encoded[..], expected_bytes);
		let decoded: BigSize = Readable::read(&mut &encoded[..]).unwrap();
		assert_eq!(decoded.0, value);
	}

	#[test]
	fn bigsize_boundaries() {
		bigsize_encode_decode(0, &[0x00]);
		bigsize_encode_decode(0xfc, &[0xfc]);
		bigsize_encode_decode(0xfd, &[0xfd, 0x00, 0xfd]);
		bigsize_encode_decode(0xffff, &[0xfd, 0xff, 0xff]);
		bigsize_encode_decode(0x10000, &[0xfe, 0x00, 0x01, 0x00, 0x00]);
		bigsize_encode_decode(0xffff_ffff, &[0xfe, 0xff, 0xff, 0xff, 0xff]);
		bigsize_encode_decode(0x1_0000_0000, &[0xff, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
	}

	#[test]
	fn bigsize_rejects_non_minimal() {
		// 0xfc encoded with the 0xfd marker is non-minimal
		match <BigSize as Readable>::read(&mut &[0xfdu8, 0x00, 0xfc][..]) {
			Err(DecodeError::InvalidValue) => {},
			_ => panic!(),
		}
		match <BigSize as Readable>::read(&mut &[0xfeu8, 0x00, 0x00, 0xff, 0xff][..]) {
			Err(DecodeError::InvalidValue) => {},
			_ => panic!(),
		}
	}

	#[test]
	fn bigsize_short_read() {
		match <BigSize as Readable>::read(&mut &[0xfdu8, 0x01][..]) {
			Err(DecodeError::ShortRead) => {},
			_ => panic!(),
		}
	}
}
