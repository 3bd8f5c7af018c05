//! Low-level codecs shared by the file format: variable-length integers, the
//! ASCII key=value header map, the Fletcher-32 checksum, block compression,
//! and the big-endian write buffer / reader pair.

pub mod buffer;
pub mod checksum;
pub mod compress;
pub mod kvmap;
pub mod varint;

pub use buffer::{ByteReader, WriteBuffer};
pub use checksum::fletcher32;
pub use compress::{Compressor, Lz4Compressor};
pub use varint::{decode_varint, encode_varint, varint_len};
