//! Per-fragment sidecar metadata.
//!
//! A parity fragment is stored as raw packed words. For Fermat fields the
//! largest element (card - 1 = 2^w) is one bit too wide for the packed word
//! and truncates to zero on the wire; a [`Properties`] map records the byte
//! offsets where that happened so decode can restore the true value before
//! the inverse transform.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::ops::Range;

/// Mark tags. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// The element at this offset equals card - 1 and was stored as zero.
    OutOfRange,
}

impl Marker {
    fn to_tag(self) -> u8 {
        match self {
            Marker::OutOfRange => 0,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Marker::OutOfRange),
            _ => None,
        }
    }
}

/// Ordered map from fragment byte offset to mark.
///
/// Offsets are multiples of the stream word size. Marks are produced in
/// offset order during encode and consulted during decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    marks: BTreeMap<u64, Marker>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mark at `offset`.
    pub fn add(&mut self, offset: u64, marker: Marker) {
        self.marks.insert(offset, marker);
    }

    #[inline]
    pub fn get(&self, offset: u64) -> Option<Marker> {
        self.marks.get(&offset).copied()
    }

    #[inline]
    pub fn is_marked(&self, offset: u64) -> bool {
        self.marks.contains_key(&offset)
    }

    /// Marks in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, Marker)> + '_ {
        self.marks.iter().map(|(&off, &m)| (off, m))
    }

    /// Marks whose offsets fall in `range`, in offset order.
    pub fn iter_range(&self, range: Range<u64>) -> impl Iterator<Item = (u64, Marker)> + '_ {
        self.marks.range(range).map(|(&off, &m)| (off, m))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.marks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn clear(&mut self) {
        self.marks.clear();
    }

    // =========================================================================
    // Sidecar serialization
    // =========================================================================
    //
    // Length-prefixed sequence of fixed-width little-endian records:
    // u64 count, then per mark a u64 offset and a u8 tag.

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&(self.marks.len() as u64).to_le_bytes())?;
        for (&offset, &marker) in &self.marks {
            w.write_all(&offset.to_le_bytes())?;
            w.write_all(&[marker.to_tag()])?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut count_buf = [0u8; 8];
        r.read_exact(&mut count_buf)?;
        let count = u64::from_le_bytes(count_buf);

        let mut props = Self::new();
        let mut rec = [0u8; 9];
        for _ in 0..count {
            r.read_exact(&mut rec)?;
            let offset = u64::from_le_bytes(rec[..8].try_into().unwrap());
            let marker = Marker::from_tag(rec[8]).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "unknown property tag")
            })?;
            props.add(offset, marker);
        }
        Ok(props)
    }
}

// =============================================================================
// Tests
// =============================================================================
