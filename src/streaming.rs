//! Streaming encode and decode drivers.
//!
//! The drivers feed fixed-size chunks from byte streams through a
//! [`ReedSolomon`] code while maintaining the per-fragment properties
//! sidecar. Two shapes exist:
//!
//! - the *word* drivers move one field word per fragment per iteration and
//!   carry the scalar encode/decode path;
//! - the *packed* drivers move whole packets through aligned [`Buffers`],
//!   with an explicit pack/unpack step for narrow stream words and a
//!   zero-copy byte view when the stream word width equals the host
//!   element width (little-endian hosts, like the wire format).
//!
//! Per stream, the byte offset is strictly monotonic and chunk-granular;
//! the generator matrix and the inverted decoding matrix are immutable
//! while a stream is in flight. A clean end of input is only recognized at
//! a chunk boundary on the first stream; anything else is a short read.

use std::io::{Read, Write};
use std::time::Instant;

use tracing::debug;

use crate::buffers::{self, Buffers};
use crate::code::{FecType, ReedSolomon};
use crate::field::Word;
use crate::matrix::Vector;
use crate::properties::Properties;
use crate::Error;

// =============================================================================
// Stats
// =============================================================================

/// Timing counters for one driver call. Opt-in observability: the driver
/// returns them, nothing is stored on the code object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of encode/decode kernel invocations.
    pub ops: u64,
    /// Bytes consumed per stream (the normalization denominator).
    pub bytes: u64,
    /// Microseconds spent inside the kernels.
    pub usec: u64,
}

impl Stats {
    /// Kernel throughput in bytes per microsecond (i.e. MB/s).
    pub fn throughput(&self) -> f64 {
        if self.usec == 0 {
            0.0
        } else {
            self.bytes as f64 / self.usec as f64
        }
    }
}

// =============================================================================
// Stream word I/O
// =============================================================================

/// Read one little-endian word of `word_size` bytes. `Ok(None)` is a clean
/// end of stream; a partial word is a short read.
fn read_word<T: Word, R: Read>(stream: &mut R, word_size: usize) -> Result<Option<T>, Error> {
    let mut buf = [0u8; 16];
    let buf = &mut buf[..word_size];
    let mut filled = 0;
    while filled < word_size {
        let n = stream.read(&mut buf[filled..]).map_err(|_| Error::ShortRead)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    if filled < word_size {
        return Err(Error::ShortRead);
    }
    let mut v = 0u64;
    for (b, &byte) in buf.iter().enumerate() {
        v |= (byte as u64) << (8 * b);
    }
    Ok(Some(T::from_u64(v)))
}

/// Write one little-endian word, truncated to `word_size` bytes.
fn write_word<T: Word, W: Write>(stream: &mut W, v: T, word_size: usize) -> Result<(), Error> {
    let bytes = v.to_u64().to_le_bytes();
    stream.write_all(&bytes[..word_size]).map_err(|_| Error::ShortWrite)
}

/// Fill `buf` from the stream. `Ok(false)` is a clean end of stream before
/// any byte; a partial chunk is a short read.
fn read_chunk<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<bool, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).map_err(|_| Error::ShortRead)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(false);
    }
    if filled < buf.len() {
        return Err(Error::ShortRead);
    }
    Ok(true)
}

// =============================================================================
// Drivers
// =============================================================================

impl<T: Word> ReedSolomon<T> {
    /// Encode `n_data` input streams into `n_outputs` parity streams, one
    /// word per fragment per iteration.
    ///
    /// All input streams must have the same length, a multiple of the word
    /// size; outputs that were already written stay as-is on error.
    ///
    /// # Errors
    ///
    /// `Error::InvalidConfig` on stream-count mismatches, `ShortRead` /
    /// `ShortWrite` on stream trouble.
    pub fn encode_streams<R: Read, W: Write>(
        &self,
        inputs: &mut [R],
        outputs: &mut [W],
        props: &mut [Properties],
    ) -> Result<Stats, Error> {
        if inputs.len() != self.n_data()
            || outputs.len() != self.n_outputs()
            || props.len() != self.n_outputs()
        {
            return Err(Error::InvalidConfig);
        }

        let ws = self.word_size();
        let mut words = Vector::new(self.field().clone(), self.n_data());
        let mut output = Vector::new(self.field().clone(), self.n_outputs());
        let mut offset = 0u64;
        let mut stats = Stats::default();

        'stream: loop {
            words.zero_fill();
            for (i, input) in inputs.iter_mut().enumerate() {
                match read_word::<T, R>(input, ws)? {
                    Some(v) => words.set(i, v),
                    None if i == 0 => break 'stream,
                    None => return Err(Error::ShortRead),
                }
            }

            let t = Instant::now();
            self.encode(&mut output, props, offset, &words);
            stats.usec += t.elapsed().as_micros() as u64;

            for (i, out) in outputs.iter_mut().enumerate() {
                write_word(out, output.get(i), ws)?;
            }
            offset += ws as u64;
            stats.ops += 1;
            stats.bytes += ws as u64;
        }

        debug!(ops = stats.ops, bytes = stats.bytes, usec = stats.usec, "encode stream done");
        Ok(stats)
    }

    /// Encode through the packed kernels, one packet per fragment per
    /// iteration. Stream lengths must be a multiple of the packet byte
    /// size.
    pub fn encode_streams_packed<R: Read, W: Write>(
        &self,
        inputs: &mut [R],
        outputs: &mut [W],
        props: &mut [Properties],
    ) -> Result<Stats, Error> {
        if inputs.len() != self.n_data()
            || outputs.len() != self.n_outputs()
            || props.len() != self.n_outputs()
        {
            return Err(Error::InvalidConfig);
        }

        let ws = self.word_size();
        let pkt = self.pkt_size();
        let full_width = ws == T::SIZE;
        let mut words = Buffers::<T>::new(self.n_data(), pkt)?;
        let mut output = Buffers::<T>::new(self.n_outputs(), pkt)?;
        let mut words_bytes = if full_width {
            None
        } else {
            Some(Buffers::<u8>::new(self.n_data(), self.buf_size())?)
        };
        let mut output_bytes = if full_width {
            None
        } else {
            Some(Buffers::<u8>::new(self.n_outputs(), self.buf_size())?)
        };

        let mut offset = 0u64;
        let mut stats = Stats::default();

        'stream: loop {
            for i in 0..self.n_data() {
                let dst = match &mut words_bytes {
                    None => words.get_bytes_mut(i),
                    Some(wb) => wb.get_mut(i),
                };
                match read_chunk(&mut inputs[i], dst)? {
                    true => {}
                    false if i == 0 => break 'stream,
                    false => return Err(Error::ShortRead),
                }
            }
            if let Some(wb) = &words_bytes {
                buffers::pack(wb, &mut words, ws)?;
            }

            let t = Instant::now();
            self.encode_bufs(&mut output, props, offset, &words);
            stats.usec += t.elapsed().as_micros() as u64;

            if let Some(ob) = &mut output_bytes {
                buffers::unpack(&output, ob, ws)?;
            }
            for (i, out) in outputs.iter_mut().enumerate() {
                let src = match &output_bytes {
                    None => output.get_bytes(i),
                    Some(ob) => ob.get(i),
                };
                out.write_all(src).map_err(|_| Error::ShortWrite)?;
            }
            offset += self.buf_size() as u64;
            stats.ops += 1;
            stats.bytes += self.buf_size() as u64;
        }

        debug!(ops = stats.ops, bytes = stats.bytes, usec = stats.usec, "packed encode done");
        Ok(stats)
    }

    /// Select k surviving streams, build the decoding matrix, and stream
    /// the reconstruction into the requested outputs.
    ///
    /// `data_inputs[i]` is the surviving data stream for fragment i (for
    /// systematic codes), `parity_inputs[p]` the surviving parity stream
    /// for output p, `None` marking a missing fragment. Reconstructed data
    /// is written to every `Some` entry of `data_outputs`.
    ///
    /// Systematic survivors are preferred: their rows of the decoding
    /// matrix are identity rows, which collapse to copies.
    ///
    /// # Errors
    ///
    /// `Error::DecodeUnrecoverable` when fewer than k fragments survive,
    /// detected before any output is produced. `Error::Singular` cannot
    /// happen for the shipped generators but is propagated from the build.
    pub fn decode_streams<R: Read, W: Write>(
        &mut self,
        data_inputs: &mut [Option<R>],
        parity_inputs: &mut [Option<R>],
        parity_props: &[Properties],
        data_outputs: &mut [Option<W>],
    ) -> Result<Stats, Error> {
        let systematic = self.fec_type() == FecType::Systematic;
        if systematic && data_inputs.len() != self.n_data() {
            return Err(Error::InvalidConfig);
        }
        if parity_inputs.len() != self.n_outputs()
            || parity_props.len() != self.n_outputs()
            || data_outputs.len() != self.n_data()
        {
            return Err(Error::InvalidConfig);
        }

        let (chosen_data, chosen_parity) = self.select_survivors(data_inputs, parity_inputs)?;
        if chosen_data.len() == self.n_data() {
            debug!("all data fragments present, nothing to rebuild");
            return Ok(Stats::default());
        }
        let ids = self.decode_ids().expect("decode matrix built").to_vec();

        let ws = self.word_size();
        let mut words = Vector::new(self.field().clone(), self.n_data());
        let mut output = Vector::new(self.field().clone(), self.n_data());
        let mut offset = 0u64;
        let mut stats = Stats::default();

        'stream: loop {
            words.zero_fill();
            let mut slot = 0;
            for &i in &chosen_data {
                let stream = data_inputs[i].as_mut().expect("selected stream");
                match read_word::<T, R>(stream, ws)? {
                    Some(v) => words.set(slot, v),
                    None if slot == 0 => break 'stream,
                    None => return Err(Error::ShortRead),
                }
                slot += 1;
            }
            for &p in &chosen_parity {
                let stream = parity_inputs[p].as_mut().expect("selected stream");
                match read_word::<T, R>(stream, ws)? {
                    Some(v) => words.set(slot, v),
                    None if slot == 0 => break 'stream,
                    None => return Err(Error::ShortRead),
                }
                slot += 1;
            }

            let t = Instant::now();
            self.decode(&mut output, parity_props, offset, &ids, &words)?;
            stats.usec += t.elapsed().as_micros() as u64;

            for (i, out) in data_outputs.iter_mut().enumerate() {
                if let Some(w) = out.as_mut() {
                    write_word(w, output.get(i), ws)?;
                }
            }
            offset += ws as u64;
            stats.ops += 1;
            stats.bytes += ws as u64;
        }

        debug!(ops = stats.ops, bytes = stats.bytes, usec = stats.usec, "decode stream done");
        Ok(stats)
    }

    /// Packed variant of [`ReedSolomon::decode_streams`]. Stream lengths
    /// must be a multiple of the packet byte size.
    pub fn decode_streams_packed<R: Read, W: Write>(
        &mut self,
        data_inputs: &mut [Option<R>],
        parity_inputs: &mut [Option<R>],
        parity_props: &[Properties],
        data_outputs: &mut [Option<W>],
    ) -> Result<Stats, Error> {
        let systematic = self.fec_type() == FecType::Systematic;
        if systematic && data_inputs.len() != self.n_data() {
            return Err(Error::InvalidConfig);
        }
        if parity_inputs.len() != self.n_outputs()
            || parity_props.len() != self.n_outputs()
            || data_outputs.len() != self.n_data()
        {
            return Err(Error::InvalidConfig);
        }

        let (chosen_data, chosen_parity) = self.select_survivors(data_inputs, parity_inputs)?;
        if chosen_data.len() == self.n_data() {
            debug!("all data fragments present, nothing to rebuild");
            return Ok(Stats::default());
        }

        let ws = self.word_size();
        let pkt = self.pkt_size();
        let full_width = ws == T::SIZE;
        let mut words = Buffers::<T>::new(self.n_data(), pkt)?;
        let mut output = Buffers::<T>::new(self.n_data(), pkt)?;
        let mut words_bytes = if full_width {
            None
        } else {
            Some(Buffers::<u8>::new(self.n_data(), self.buf_size())?)
        };
        let mut output_bytes = if full_width {
            None
        } else {
            Some(Buffers::<u8>::new(self.n_data(), self.buf_size())?)
        };

        let mut offset = 0u64;
        let mut stats = Stats::default();

        'stream: loop {
            let mut slot = 0;
            let mut ended = false;
            for &i in &chosen_data {
                let stream = data_inputs[i].as_mut().expect("selected stream");
                let dst = match &mut words_bytes {
                    None => words.get_bytes_mut(slot),
                    Some(wb) => wb.get_mut(slot),
                };
                match read_chunk(stream, dst)? {
                    true => {}
                    false if slot == 0 => {
                        ended = true;
                        break;
                    }
                    false => return Err(Error::ShortRead),
                }
                slot += 1;
            }
            if ended {
                break 'stream;
            }
            for &p in &chosen_parity {
                let stream = parity_inputs[p].as_mut().expect("selected stream");
                let dst = match &mut words_bytes {
                    None => words.get_bytes_mut(slot),
                    Some(wb) => wb.get_mut(slot),
                };
                match read_chunk(stream, dst)? {
                    true => {}
                    false if slot == 0 => {
                        ended = true;
                        break;
                    }
                    false => return Err(Error::ShortRead),
                }
                slot += 1;
            }
            if ended {
                break 'stream;
            }
            if let Some(wb) = &words_bytes {
                buffers::pack(wb, &mut words, ws)?;
            }

            let t = Instant::now();
            self.decode_bufs(&mut output, parity_props, offset, &mut words)?;
            stats.usec += t.elapsed().as_micros() as u64;

            if let Some(ob) = &mut output_bytes {
                buffers::unpack(&output, ob, ws)?;
            }
            for (i, out) in data_outputs.iter_mut().enumerate() {
                if let Some(w) = out.as_mut() {
                    let src = match &output_bytes {
                        None => output.get_bytes(i),
                        Some(ob) => ob.get(i),
                    };
                    w.write_all(src).map_err(|_| Error::ShortWrite)?;
                }
            }
            offset += self.buf_size() as u64;
            stats.ops += 1;
            stats.bytes += self.buf_size() as u64;
        }

        debug!(ops = stats.ops, bytes = stats.bytes, usec = stats.usec, "packed decode done");
        Ok(stats)
    }

    /// First decode pass: register survivors data-first and build the
    /// decoding matrix. Returns the chosen stream indices.
    fn select_survivors<R: Read>(
        &mut self,
        data_inputs: &[Option<R>],
        parity_inputs: &[Option<R>],
    ) -> Result<(Vec<usize>, Vec<usize>), Error> {
        self.decode_reset();
        let mut chosen_data = Vec::new();
        let mut chosen_parity = Vec::new();
        let mut frag = 0;

        if self.fec_type() == FecType::Systematic {
            for (i, input) in data_inputs.iter().enumerate() {
                if input.is_some() {
                    self.decode_add_data(frag, i)?;
                    chosen_data.push(i);
                    frag += 1;
                }
            }
            // Data is in the clear; nothing to rebuild.
            if frag == self.n_data() {
                return Ok((chosen_data, chosen_parity));
            }
        }

        for (p, input) in parity_inputs.iter().enumerate() {
            if frag == self.n_data() {
                break;
            }
            if input.is_some() {
                self.decode_add_parities(frag, p)?;
                chosen_parity.push(p);
                frag += 1;
            }
        }
        if frag < self.n_data() {
            return Err(Error::DecodeUnrecoverable);
        }

        self.decode_build()?;
        debug!(
            data = chosen_data.len(),
            parity = chosen_parity.len(),
            "decode matrix built"
        );
        Ok((chosen_data, chosen_parity))
    }
}

// =============================================================================
// Tests
// =============================================================================
