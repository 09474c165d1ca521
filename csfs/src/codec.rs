use std::io::{Error, ErrorKind, Result};

use bincode::{
	config::{Configuration, Fixint, LittleEndian, NoLimit},
	Decode, Encode,
};

/// Every on-disk record is fixed-int little-endian; padding fields in the
/// record types pin each field to its mandated byte offset.
const LE: Configuration<LittleEndian, Fixint, NoLimit> = bincode::config::standard()
	.with_fixed_int_encoding()
	.with_little_endian();

/// Decode a record from the front of `buf`; trailing bytes are ignored.
pub fn decode<T: Decode<()>>(buf: &[u8]) -> Result<T> {
	bincode::decode_from_slice(buf, LE)
		.map(|(v, _)| v)
		.map_err(|_| Error::new(ErrorKind::InvalidInput, "failed to decode"))
}

/// Encode a record into the front of `buf`, returning the encoded size.
pub fn encode<T: Encode>(val: &T, buf: &mut [u8]) -> Result<usize> {
	bincode::encode_into_slice(val, buf, LE)
		.map_err(|e| Error::new(ErrorKind::InvalidInput, e.to_string()))
}
