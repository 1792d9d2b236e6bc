//! Reed-Solomon erasure coding over GF(2^n) and Fermat prime fields.
//!
//! This library takes k data fragments and produces m parity fragments such
//! that any k of the k + m fragments suffice to reconstruct the originals.
//! Codes are built from Vandermonde or Cauchy generator matrices over a
//! binary extension field GF(2^n) or a Fermat prime field (F3 = 257,
//! F4 = 65537), with vectorized modular kernels on the Fermat hot path and
//! a streaming driver that carries a per-fragment properties sidecar for
//! values that do not fit the packed stream word.
//!
//! # Example
//!
//! ```rust
//! use quadfec::{Field, FecType, GeneratorKind, Properties, ReedSolomon};
//! use std::io::Cursor;
//!
//! // GF(2^8), 3 data fragments, 2 parities, one byte per word.
//! let field = Field::<u32>::binary_extension(8).unwrap();
//! let mut code = ReedSolomon::new(
//!     field,
//!     FecType::Systematic,
//!     GeneratorKind::Vandermonde,
//!     3,
//!     2,
//!     1,
//!     1024,
//! )
//! .unwrap();
//!
//! let mut inputs = vec![
//!     Cursor::new(b"ABCD".to_vec()),
//!     Cursor::new(b"EFGH".to_vec()),
//!     Cursor::new(b"IJKL".to_vec()),
//! ];
//! let mut parities: Vec<Vec<u8>> = vec![Vec::new(); 2];
//! let mut props = vec![Properties::new(); 2];
//! code.encode_streams(&mut inputs, &mut parities, &mut props).unwrap();
//!
//! // Lose fragment 0; rebuild it from the survivors.
//! let mut data_in = vec![
//!     None,
//!     Some(Cursor::new(b"EFGH".to_vec())),
//!     Some(Cursor::new(b"IJKL".to_vec())),
//! ];
//! let mut parity_in = vec![Some(Cursor::new(parities[0].clone())), None];
//! let mut data_out: Vec<Option<Vec<u8>>> = vec![Some(Vec::new()), None, None];
//! code.decode_streams(&mut data_in, &mut parity_in, &props, &mut data_out)
//!     .unwrap();
//! assert_eq!(data_out[0].as_ref().unwrap().as_slice(), b"ABCD");
//! ```

use std::fmt;

pub mod buffers;
pub mod code;
pub mod field;
pub mod matrix;
pub mod properties;
pub mod simd;
pub mod streaming;

pub use buffers::{pack, unpack, Buffers, ALIGN_SIZE};
pub use code::{FecType, GeneratorKind, ReedSolomon};
pub use field::{Field, FieldKind, Word, F3, F4};
pub use matrix::{Matrix, Vector};
pub use properties::{Marker, Properties};
pub use streaming::Stats;

/// Error type for all fallible operations. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Arithmetic on an invalid element (e.g. inverse of zero).
    Domain,
    /// Matrix inversion attempted on a non-invertible matrix.
    Singular,
    /// Fewer than k fragments available for decoding.
    DecodeUnrecoverable,
    /// A stream ended unexpectedly mid-chunk.
    ShortRead,
    /// A stream refused bytes mid-chunk.
    ShortWrite,
    /// Streams disagree in length, or a buffer violates the alignment
    /// contract.
    SizeMismatch,
    /// Invalid code parameters: zero counts, unsupported word size, or a
    /// field that does not fit the word width.
    InvalidConfig,
    /// The same fragment row was registered twice for decoding.
    DuplicateIndex,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Domain => write!(f, "arithmetic on an invalid field element"),
            Error::Singular => write!(f, "matrix is not invertible"),
            Error::DecodeUnrecoverable => write!(f, "not enough fragments to decode"),
            Error::ShortRead => write!(f, "stream ended mid-chunk"),
            Error::ShortWrite => write!(f, "stream refused bytes mid-chunk"),
            Error::SizeMismatch => write!(f, "stream or buffer size mismatch"),
            Error::InvalidConfig => write!(f, "invalid code configuration"),
            Error::DuplicateIndex => write!(f, "duplicate fragment index"),
        }
    }
}

impl std::error::Error for Error {}
