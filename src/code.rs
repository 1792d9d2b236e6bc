//! The Reed-Solomon code object.
//!
//! A [`ReedSolomon`] binds a field, a generator matrix and the decode-side
//! state machine. The generator G is `(k + m) x k`; systematic codes carry
//! the identity as the first k rows (Vandermonde rewritten for erasure
//! coding, or Cauchy parity rows below an identity block) and emit only the
//! last m rows on encode, non-systematic codes emit all k + m rows.
//!
//! Decoding selects k surviving rows of G, inverts the resulting square
//! matrix once per stream, and then multiplies each chunk of surviving
//! words by the inverse:
//!
//! | State      | Transition                       | Next               |
//! |------------|----------------------------------|--------------------|
//! | Idle       | `decode_add_data` / `_parities`  | Collecting         |
//! | Collecting | k rows gathered, `decode_build`  | Ready (or Failed)  |
//! | Ready      | `decode` (stateless per chunk)   | Ready              |

use std::sync::Arc;

use crate::buffers::Buffers;
use crate::field::{Field, FieldKind, Word};
use crate::matrix::{Matrix, Vector};
use crate::properties::{Marker, Properties};
use crate::simd;
use crate::Error;

/// Systematic codes emit parities only; non-systematic codes emit all
/// `k + m` outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecType {
    Systematic,
    NonSystematic,
}

/// Which generator-matrix family to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    /// Vandermonde; systematic codes use the rewritten
    /// identity-on-top form.
    Vandermonde,
    /// Cauchy; systematic codes use an identity block over Cauchy
    /// parity rows.
    Cauchy,
}

#[derive(Debug)]
enum DecodeState<T: Word> {
    Idle,
    Collecting { mat: Matrix<T>, ids: Vec<usize> },
    Ready { inverse: Matrix<T>, ids: Vec<usize> },
    Failed,
}

/// A Reed-Solomon erasure code over a finite field.
#[derive(Debug)]
pub struct ReedSolomon<T: Word> {
    field: Arc<Field<T>>,
    fec_type: FecType,
    n_data: usize,
    n_parities: usize,
    code_len: usize,
    n_outputs: usize,
    /// Bytes per word on the wire.
    word_size: usize,
    /// Words per packet in the chunked paths.
    pkt_size: usize,
    /// Bytes per packet on the wire.
    buf_size: usize,
    generator: Matrix<T>,
    /// The element that does not fit a packed word (card - 1 = 2^w of a
    /// Fermat field), when one exists for this word size.
    oor_threshold: Option<T>,
    decode: DecodeState<T>,
}

impl<T: Word> ReedSolomon<T> {
    /// Create a code with `n_data` data fragments and `n_parities` parity
    /// fragments.
    ///
    /// `word_size` is the wire width of one field word in bytes and
    /// `pkt_size` the number of words per chunk in the packed paths
    /// (must be a multiple of 32 to satisfy the buffer alignment
    /// contract).
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for zero counts, an unsupported word
    /// size, a field that does not fit the word size, or too many fragments
    /// for the field.
    pub fn new(
        field: Arc<Field<T>>,
        fec_type: FecType,
        generator: GeneratorKind,
        n_data: usize,
        n_parities: usize,
        word_size: usize,
        pkt_size: usize,
    ) -> Result<Self, Error> {
        if n_data == 0 || n_parities == 0 {
            return Err(Error::InvalidConfig);
        }
        if !matches!(word_size, 1 | 2 | 4 | 8 | 16) || word_size > T::SIZE {
            return Err(Error::InvalidConfig);
        }
        if pkt_size == 0 || pkt_size % 32 != 0 {
            return Err(Error::InvalidConfig);
        }

        // The largest element must fit the packed word, except for the
        // Fermat value 2^w which truncates to zero and is tracked through
        // properties.
        let max_packed = 1u128 << (8 * word_size as u32);
        let card_minus_one = (field.card() - 1) as u128;
        if card_minus_one > max_packed {
            return Err(Error::InvalidConfig);
        }
        let oor_threshold = if card_minus_one == max_packed {
            if field.kind() != FieldKind::FermatPrime {
                return Err(Error::InvalidConfig);
            }
            Some(field.card_minus_one())
        } else {
            None
        };

        let code_len = n_data + n_parities;
        let n_outputs = match fec_type {
            FecType::Systematic => n_parities,
            FecType::NonSystematic => code_len,
        };

        let gen = Self::build_generator(&field, fec_type, generator, n_data, n_parities)?;

        Ok(Self {
            field,
            fec_type,
            n_data,
            n_parities,
            code_len,
            n_outputs,
            word_size,
            pkt_size,
            buf_size: pkt_size * word_size,
            generator: gen,
            oor_threshold,
            decode: DecodeState::Idle,
        })
    }

    fn build_generator(
        field: &Arc<Field<T>>,
        fec_type: FecType,
        kind: GeneratorKind,
        n_data: usize,
        n_parities: usize,
    ) -> Result<Matrix<T>, Error> {
        let code_len = n_data + n_parities;
        let mut gen = Matrix::new(field.clone(), code_len, n_data);
        match (fec_type, kind) {
            (FecType::Systematic, GeneratorKind::Vandermonde) => {
                gen.vandermonde_suitable_for_ec()?;
            }
            (FecType::Systematic, GeneratorKind::Cauchy) => {
                let mut parity = Matrix::new(field.clone(), n_parities, n_data);
                parity.cauchy()?;
                let one = field.one();
                for i in 0..n_data {
                    gen.set(i, i, one);
                }
                for i in 0..n_parities {
                    for j in 0..n_data {
                        gen.set(n_data + i, j, parity.get(i, j));
                    }
                }
            }
            (FecType::NonSystematic, GeneratorKind::Vandermonde) => {
                gen.vandermonde()?;
            }
            (FecType::NonSystematic, GeneratorKind::Cauchy) => {
                gen.cauchy()?;
            }
        }
        Ok(gen)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn field(&self) -> &Arc<Field<T>> {
        &self.field
    }

    #[inline]
    pub fn fec_type(&self) -> FecType {
        self.fec_type
    }

    #[inline]
    pub fn n_data(&self) -> usize {
        self.n_data
    }

    #[inline]
    pub fn n_parities(&self) -> usize {
        self.n_parities
    }

    #[inline]
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// Number of encoded output fragments.
    #[inline]
    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    #[inline]
    pub fn word_size(&self) -> usize {
        self.word_size
    }

    #[inline]
    pub fn pkt_size(&self) -> usize {
        self.pkt_size
    }

    /// Bytes per packet on the wire.
    #[inline]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    #[inline]
    pub fn generator(&self) -> &Matrix<T> {
        &self.generator
    }

    /// Generator row backing output `out`.
    #[inline]
    fn output_row(&self, out: usize) -> usize {
        match self.fec_type {
            FecType::Systematic => self.n_data + out,
            FecType::NonSystematic => out,
        }
    }

    /// Properties slot for a generator row id, when that row is an encoded
    /// output (data rows of a systematic code carry no marks).
    pub(crate) fn props_index(&self, row_id: usize) -> Option<usize> {
        match self.fec_type {
            FecType::Systematic => row_id.checked_sub(self.n_data),
            FecType::NonSystematic => Some(row_id),
        }
    }

    // =========================================================================
    // Encode
    // =========================================================================

    /// Encode one word per fragment: `output = G * words`, recording an
    /// out-of-range mark at `offset` for any output equal to card - 1 when
    /// that value does not fit the packed word.
    pub fn encode(
        &self,
        output: &mut Vector<T>,
        props: &mut [Properties],
        offset: u64,
        words: &Vector<T>,
    ) {
        debug_assert_eq!(words.len(), self.n_data);
        debug_assert_eq!(output.len(), self.n_outputs);
        debug_assert_eq!(props.len(), self.n_outputs);

        let gf = &self.field;
        for out in 0..self.n_outputs {
            let row = self.generator.row(self.output_row(out));
            let mut acc = gf.zero();
            for (coeff, w) in row.iter().zip(words.as_slice()) {
                acc = gf.add(acc, gf.mul(*coeff, *w));
            }
            output.set(out, acc);
            if self.oor_threshold == Some(acc) {
                props[out].add(offset, Marker::OutOfRange);
            }
        }
    }

    /// Encode one packet per fragment through the columnwise kernels.
    ///
    /// Each data column is folded into each output with a single
    /// coefficient, which amortizes loads across the whole packet; the
    /// out-of-range scan then sweeps the outputs.
    pub fn encode_bufs(
        &self,
        output: &mut Buffers<T>,
        props: &mut [Properties],
        offset: u64,
        words: &Buffers<T>,
    ) {
        debug_assert_eq!(words.n(), self.n_data);
        debug_assert_eq!(output.n(), self.n_outputs);
        debug_assert_eq!(props.len(), self.n_outputs);
        debug_assert_eq!(words.len(), output.len());

        for out in 0..self.n_outputs {
            let row = self.output_row(out);
            let dest = output.get_mut(out);
            mult_row_bufs(&self.field, &self.generator, row, words, dest);
        }
        self.post_process(output, props, offset);
    }

    /// Scan encoded outputs for values that will not round-trip through the
    /// packed word and record their offsets.
    fn post_process(&self, output: &Buffers<T>, props: &mut [Properties], offset: u64) {
        let threshold = match self.oor_threshold {
            Some(t) => t,
            None => return,
        };
        for frag in 0..output.n() {
            let words = output.get(frag);
            if let Some(lanes) = T::as_u32_slice(words) {
                simd::scan_out_of_range(
                    lanes,
                    threshold.to_u64() as u32,
                    &mut props[frag],
                    offset,
                    self.word_size,
                );
            } else {
                for (i, &v) in words.iter().enumerate() {
                    if v == threshold {
                        props[frag].add(offset + (i * self.word_size) as u64, Marker::OutOfRange);
                    }
                }
            }
        }
    }

    // =========================================================================
    // Decode state machine
    // =========================================================================

    /// Register an available data fragment: row `row` of the generator
    /// becomes row `fragment_index` of the decoding matrix.
    ///
    /// Rows must be added sequentially, starting from a fresh (Idle) state.
    ///
    /// # Errors
    ///
    /// `Error::DuplicateIndex` when the row was already added,
    /// `Error::InvalidConfig` on out-of-order or out-of-range rows.
    pub fn decode_add_data(&mut self, fragment_index: usize, row: usize) -> Result<(), Error> {
        if row >= self.n_data {
            return Err(Error::InvalidConfig);
        }
        self.decode_push(fragment_index, row)
    }

    /// Register an available parity fragment; `row` indexes the encoded
    /// outputs.
    pub fn decode_add_parities(&mut self, fragment_index: usize, row: usize) -> Result<(), Error> {
        if row >= self.n_outputs {
            return Err(Error::InvalidConfig);
        }
        let row_id = match self.fec_type {
            FecType::Systematic => self.n_data + row,
            FecType::NonSystematic => row,
        };
        self.decode_push(fragment_index, row_id)
    }

    fn decode_push(&mut self, fragment_index: usize, row_id: usize) -> Result<(), Error> {
        if matches!(self.decode, DecodeState::Idle) {
            self.decode = DecodeState::Collecting {
                mat: Matrix::new(self.field.clone(), self.n_data, self.n_data),
                ids: Vec::with_capacity(self.n_data),
            };
        }
        match &mut self.decode {
            DecodeState::Collecting { mat, ids } => {
                if fragment_index != ids.len() || fragment_index >= self.n_data {
                    return Err(Error::InvalidConfig);
                }
                if ids.contains(&row_id) {
                    return Err(Error::DuplicateIndex);
                }
                for j in 0..self.n_data {
                    mat.set(fragment_index, j, self.generator.get(row_id, j));
                }
                ids.push(row_id);
                Ok(())
            }
            _ => Err(Error::InvalidConfig),
        }
    }

    /// Invert the collected decoding matrix. Requires exactly `n_data`
    /// registered fragments.
    ///
    /// # Errors
    ///
    /// `Error::DecodeUnrecoverable` with fewer than `n_data` rows;
    /// `Error::Singular` when the matrix cannot be inverted (the state
    /// moves to Failed).
    pub fn decode_build(&mut self) -> Result<(), Error> {
        let state = std::mem::replace(&mut self.decode, DecodeState::Idle);
        match state {
            DecodeState::Collecting { mut mat, ids } if ids.len() == self.n_data => {
                match mat.inv() {
                    Ok(()) => {
                        self.decode = DecodeState::Ready { inverse: mat, ids };
                        Ok(())
                    }
                    Err(e) => {
                        self.decode = DecodeState::Failed;
                        Err(e)
                    }
                }
            }
            DecodeState::Ready { inverse, ids } => {
                self.decode = DecodeState::Ready { inverse, ids };
                Ok(())
            }
            other => {
                self.decode = other;
                Err(Error::DecodeUnrecoverable)
            }
        }
    }

    /// Forget any collected or built decode state.
    pub fn decode_reset(&mut self) {
        self.decode = DecodeState::Idle;
    }

    /// Row ids of the fragments the built decoder consumes, in input order.
    pub fn decode_ids(&self) -> Option<&[usize]> {
        match &self.decode {
            DecodeState::Ready { ids, .. } => Some(ids),
            _ => None,
        }
    }

    /// Decode one word per surviving fragment into the original data words.
    ///
    /// `words[j]` is the word read from the fragment with generator row id
    /// `fragments_ids[j]`; marked parity words are reinflated to card - 1
    /// before the inverse transform.
    ///
    /// # Errors
    ///
    /// `Error::DecodeUnrecoverable` unless [`ReedSolomon::decode_build`]
    /// succeeded.
    pub fn decode(
        &self,
        output: &mut Vector<T>,
        props: &[Properties],
        offset: u64,
        fragments_ids: &[usize],
        words: &Vector<T>,
    ) -> Result<(), Error> {
        let (inverse, ids) = match &self.decode {
            DecodeState::Ready { inverse, ids } => (inverse, ids),
            _ => return Err(Error::DecodeUnrecoverable),
        };
        debug_assert_eq!(fragments_ids, &ids[..]);
        debug_assert_eq!(words.len(), self.n_data);
        debug_assert_eq!(output.len(), self.n_data);

        let gf = &self.field;
        let vals: Vec<T> = (0..self.n_data)
            .map(|j| {
                if self.oor_threshold.is_some() {
                    if let Some(p) = self.props_index(ids[j]) {
                        if props[p].is_marked(offset) {
                            return gf.card_minus_one();
                        }
                    }
                }
                words.get(j)
            })
            .collect();

        for i in 0..self.n_data {
            let row = inverse.row(i);
            let mut acc = gf.zero();
            for (coeff, w) in row.iter().zip(&vals) {
                acc = gf.add(acc, gf.mul(*coeff, *w));
            }
            output.set(i, acc);
        }
        Ok(())
    }

    /// Decode one packet per surviving fragment. `words` is modified in
    /// place by mark reinflation.
    ///
    /// # Errors
    ///
    /// `Error::DecodeUnrecoverable` unless [`ReedSolomon::decode_build`]
    /// succeeded.
    pub fn decode_bufs(
        &self,
        output: &mut Buffers<T>,
        props: &[Properties],
        offset: u64,
        words: &mut Buffers<T>,
    ) -> Result<(), Error> {
        let (inverse, ids) = match &self.decode {
            DecodeState::Ready { inverse, ids } => (inverse, ids),
            _ => return Err(Error::DecodeUnrecoverable),
        };
        debug_assert_eq!(words.n(), self.n_data);
        debug_assert_eq!(output.n(), self.n_data);
        debug_assert_eq!(words.len(), output.len());

        if let Some(threshold) = self.oor_threshold {
            let chunk_bytes = (words.len() * self.word_size) as u64;
            for j in 0..self.n_data {
                let p = match self.props_index(ids[j]) {
                    Some(p) => p,
                    None => continue,
                };
                let frag = words.get_mut(j);
                for (mark_off, _) in props[p].iter_range(offset..offset + chunk_bytes) {
                    let idx = ((mark_off - offset) as usize) / self.word_size;
                    frag[idx] = threshold;
                }
            }
        }

        for i in 0..self.n_data {
            let dest = output.get_mut(i);
            mult_row_bufs(&self.field, inverse, i, words, dest);
        }
        Ok(())
    }
}

// =============================================================================
// Columnwise matrix-buffer multiply
// =============================================================================

/// `dest = sum_j mat[row][j] * words[j]`, one packet at a time.
///
/// Zero and one coefficients collapse to skips and adds; Fermat fields with
/// 32-bit storage go through the vectorized kernels, everything else
/// through the field scalar ops. A card - 1 coefficient is routed to the
/// scalar path because the vector multiply assumes one operand <= card - 2.
fn mult_row_bufs<T: Word>(
    field: &Arc<Field<T>>,
    mat: &Matrix<T>,
    row: usize,
    words: &Buffers<T>,
    dest: &mut [T],
) {
    let zero = field.zero();
    let one = field.one();
    let mut first = true;
    for j in 0..mat.n_cols() {
        let coef = mat.get(row, j);
        let src = words.get(j);
        if first {
            first = false;
            if coef == zero {
                dest.fill(zero);
            } else if coef == one {
                dest.copy_from_slice(src);
            } else {
                mul_into(field, coef, src, dest);
            }
        } else if coef == zero {
            continue;
        } else if coef == one {
            add_into(field, src, dest);
        } else {
            muladd_into(field, coef, src, dest);
        }
    }
}

fn fermat_lanes<'a, T: Word>(
    field: &Arc<Field<T>>,
    src: &'a [T],
    dest: &'a mut [T],
) -> Option<(&'a [u32], &'a mut [u32], u32)> {
    if field.kind() != FieldKind::FermatPrime {
        return None;
    }
    match (T::as_u32_slice(src), T::as_u32_slice_mut(dest)) {
        (Some(s), Some(d)) => Some((s, d, field.card() as u32)),
        _ => None,
    }
}

fn add_into<T: Word>(field: &Arc<Field<T>>, src: &[T], dest: &mut [T]) {
    if let Some((s, d, card)) = fermat_lanes(field, src, dest) {
        simd::add_two_bufs(s, d, card);
        return;
    }
    for (d, &s) in dest.iter_mut().zip(src) {
        *d = field.add(*d, s);
    }
}

fn mul_into<T: Word>(field: &Arc<Field<T>>, coef: T, src: &[T], dest: &mut [T]) {
    if coef != field.card_minus_one() {
        if let Some((s, d, card)) = fermat_lanes(field, src, dest) {
            simd::mul_coef_to_buf(coef.to_u64() as u32, s, d, card);
            return;
        }
    }
    for (d, &s) in dest.iter_mut().zip(src) {
        *d = field.mul(coef, s);
    }
}

fn muladd_into<T: Word>(field: &Arc<Field<T>>, coef: T, src: &[T], dest: &mut [T]) {
    if coef != field.card_minus_one() {
        if let Some((s, d, card)) = fermat_lanes(field, src, dest) {
            simd::mul_coef_add_to_buf(coef.to_u64() as u32, s, d, card);
            return;
        }
    }
    for (d, &s) in dest.iter_mut().zip(src) {
        *d = field.add(*d, field.mul(coef, s));
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{F3, F4};
    use rand::{Rng, SeedableRng};

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(0x5eed_c0de)
    }

    fn random_words(rng: &mut impl Rng, gf: &Field<u32>, n: usize, max: u64) -> Vec<u32> {
        let bound = max.min(gf.card() - 1);
        (0..n).map(|_| rng.gen_range(0..=bound) as u32).collect()
    }

    /// Encode a data vector, keep only the fragments in `survivors`
    /// (generator row ids), decode, and return the recovered data.
    fn roundtrip(code: &mut ReedSolomon<u32>, data: &[u32], survivors: &[usize]) -> Vec<u32> {
        let k = code.n_data();
        let mut words = Vector::new(code.field().clone(), k);
        for (i, &w) in data.iter().enumerate() {
            words.set(i, w);
        }
        let mut encoded = Vector::new(code.field().clone(), code.n_outputs());
        let mut props = vec![Properties::new(); code.n_outputs()];
        code.encode(&mut encoded, &mut props, 0, &words);

        code.decode_reset();
        let mut frag = 0;
        for &id in survivors {
            if id < k && code.fec_type() == FecType::Systematic {
                code.decode_add_data(frag, id).unwrap();
            } else {
                let out = match code.fec_type() {
                    FecType::Systematic => id - k,
                    FecType::NonSystematic => id,
                };
                code.decode_add_parities(frag, out).unwrap();
            }
            frag += 1;
        }
        code.decode_build().unwrap();

        let mut chosen = Vector::new(code.field().clone(), k);
        for (j, &id) in survivors.iter().enumerate() {
            let w = if id < k && code.fec_type() == FecType::Systematic {
                data[id]
            } else {
                let out = match code.fec_type() {
                    FecType::Systematic => id - k,
                    FecType::NonSystematic => id,
                };
                encoded.get(out)
            };
            chosen.set(j, w);
        }
        let mut output = Vector::new(code.field().clone(), k);
        let ids: Vec<usize> = survivors.to_vec();
        code.decode(&mut output, &props, 0, &ids, &chosen).unwrap();
        output.as_slice().to_vec()
    }

    #[test]
    fn systematic_generator_has_identity_top() {
        // k = 4, m = 2: first four rows are the identity and the parity
        // rows stay invertible against any two identity rows.
        let gf = Field::<u32>::binary_extension(8).unwrap();
        let code = ReedSolomon::new(
            gf.clone(),
            FecType::Systematic,
            GeneratorKind::Vandermonde,
            4,
            2,
            1,
            32,
        )
        .unwrap();
        let gen = code.generator();
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1 } else { 0 };
                assert_eq!(gen.get(i, j), expected);
            }
        }

        // Every selection of 4 rows mixing the two parity rows with two
        // identity rows must be invertible.
        for a in 0..4 {
            for b in (a + 1)..4 {
                let rows = [a, b, 4, 5];
                let mut sub = Matrix::new(gf.clone(), 4, 4);
                for (r, &src) in rows.iter().enumerate() {
                    for j in 0..4 {
                        sub.set(r, j, gen.get(src, j));
                    }
                }
                assert!(sub.inv().is_ok(), "rows {:?}", rows);
            }
        }
    }

    #[test]
    fn cauchy_all_erasure_patterns() {
        // k = 5, m = 3 over GF(2^16): every C(8,3) deletion must decode.
        let gf = Field::<u32>::binary_extension(16).unwrap();
        let mut code = ReedSolomon::new(
            gf.clone(),
            FecType::Systematic,
            GeneratorKind::Cauchy,
            5,
            3,
            2,
            32,
        )
        .unwrap();
        let mut rng = rng();
        let data = random_words(&mut rng, &gf, 5, u64::MAX);

        for d0 in 0..8 {
            for d1 in (d0 + 1)..8 {
                for d2 in (d1 + 1)..8 {
                    let survivors: Vec<usize> =
                        (0..8).filter(|i| *i != d0 && *i != d1 && *i != d2).collect();
                    let got = roundtrip(&mut code, &data, &survivors);
                    assert_eq!(got, data, "deleted {{{}, {}, {}}}", d0, d1, d2);
                }
            }
        }
    }

    #[test]
    fn non_systematic_any_k_outputs() {
        let gf = Field::<u32>::fermat_prime(F4).unwrap();
        let mut code = ReedSolomon::new(
            gf.clone(),
            FecType::NonSystematic,
            GeneratorKind::Vandermonde,
            3,
            2,
            2,
            32,
        )
        .unwrap();
        let mut rng = rng();
        let data = random_words(&mut rng, &gf, 3, 65535);

        for a in 0..5 {
            for b in (a + 1)..5 {
                for c in (b + 1)..5 {
                    let got = roundtrip(&mut code, &data, &[a, b, c]);
                    assert_eq!(got, data, "outputs {},{},{}", a, b, c);
                }
            }
        }
    }

    #[test]
    fn f3_roundtrip() {
        let gf = Field::<u32>::fermat_prime(F3).unwrap();
        let mut code = ReedSolomon::new(
            gf.clone(),
            FecType::Systematic,
            GeneratorKind::Vandermonde,
            3,
            2,
            1,
            32,
        )
        .unwrap();
        let mut rng = rng();
        let data = random_words(&mut rng, &gf, 3, 255);
        let got = roundtrip(&mut code, &data, &[1, 3, 4]);
        assert_eq!(got, data);
    }

    #[test]
    fn encode_records_out_of_range_outputs() {
        // Arrange data so the first parity word lands exactly on 2^16.
        let gf = Field::<u32>::fermat_prime(F4).unwrap();
        let code = ReedSolomon::new(
            gf.clone(),
            FecType::Systematic,
            GeneratorKind::Vandermonde,
            4,
            2,
            2,
            32,
        )
        .unwrap();
        let row = code.generator().row(4).to_vec();

        // words = [w0, 1, 1, 1] with w0 solving
        // row[0]*w0 = 65536 - row[1] - row[2] - row[3].
        let mut rest = gf.zero();
        for &c in &row[1..] {
            rest = gf.add(rest, c);
        }
        let target = gf.sub(gf.card_minus_one(), rest);
        let w0 = gf.mul(gf.inv(row[0]).unwrap(), target);
        assert!(w0 <= 65535, "unlucky generator row for this construction");

        let mut words = Vector::new(gf.clone(), 4);
        words.set(0, w0);
        for i in 1..4 {
            words.set(i, 1);
        }
        let mut encoded = Vector::new(gf.clone(), 2);
        let mut props = vec![Properties::new(); 2];
        code.encode(&mut encoded, &mut props, 6, &words);

        assert_eq!(encoded.get(0), 65536);
        assert!(props[0].is_marked(6));
    }

    #[test]
    fn decode_state_machine_guards() {
        let gf = Field::<u32>::binary_extension(8).unwrap();
        let mut code = ReedSolomon::new(
            gf.clone(),
            FecType::Systematic,
            GeneratorKind::Vandermonde,
            3,
            2,
            1,
            32,
        )
        .unwrap();

        // Too few fragments.
        code.decode_add_data(0, 0).unwrap();
        code.decode_add_data(1, 2).unwrap();
        assert_eq!(code.decode_build().unwrap_err(), Error::DecodeUnrecoverable);

        // Duplicate row.
        code.decode_reset();
        code.decode_add_data(0, 0).unwrap();
        assert_eq!(code.decode_add_data(1, 0).unwrap_err(), Error::DuplicateIndex);

        // Out-of-order fragment index.
        code.decode_reset();
        assert_eq!(code.decode_add_data(1, 0).unwrap_err(), Error::InvalidConfig);

        // Decode before build.
        code.decode_reset();
        let words = Vector::new(gf.clone(), 3);
        let mut output = Vector::new(gf, 3);
        assert_eq!(
            code.decode(&mut output, &[], 0, &[0, 1, 2], &words)
                .unwrap_err(),
            Error::DecodeUnrecoverable
        );
    }

    #[test]
    fn config_validation() {
        let gf = Field::<u32>::binary_extension(8).unwrap();
        let bad = |k, m, ws, pkt| {
            ReedSolomon::new(
                gf.clone(),
                FecType::Systematic,
                GeneratorKind::Vandermonde,
                k,
                m,
                ws,
                pkt,
            )
            .unwrap_err()
        };
        assert_eq!(bad(0, 2, 1, 32), Error::InvalidConfig);
        assert_eq!(bad(3, 0, 1, 32), Error::InvalidConfig);
        assert_eq!(bad(3, 2, 3, 32), Error::InvalidConfig); // word size not in set
        assert_eq!(bad(3, 2, 1, 17), Error::InvalidConfig); // unaligned packet
        assert_eq!(bad(3, 2, 8, 32), Error::InvalidConfig); // wider than storage

        // GF(2^16) elements cannot travel in single-byte words.
        let gf16 = Field::<u32>::binary_extension(16).unwrap();
        assert_eq!(
            ReedSolomon::new(
                gf16,
                FecType::Systematic,
                GeneratorKind::Vandermonde,
                3,
                2,
                1,
                32,
            )
            .unwrap_err(),
            Error::InvalidConfig
        );

        // F4 in 16-bit words is exactly the tracked out-of-range case.
        let f4 = Field::<u32>::fermat_prime(F4).unwrap();
        assert!(ReedSolomon::new(
            f4,
            FecType::Systematic,
            GeneratorKind::Vandermonde,
            3,
            2,
            2,
            32,
        )
        .is_ok());
    }

    #[test]
    fn encode_bufs_matches_encode() {
        // The columnwise packet path and the word path must agree.
        for (field, ws) in [
            (Field::<u32>::fermat_prime(F4).unwrap(), 2usize),
            (Field::<u32>::binary_extension(8).unwrap(), 1),
        ] {
            let code = ReedSolomon::new(
                field.clone(),
                FecType::Systematic,
                GeneratorKind::Vandermonde,
                4,
                3,
                ws,
                32,
            )
            .unwrap();
            let pkt = code.pkt_size();
            let mut rng = rng();
            let max_word = (1u64 << (8 * ws)) - 1;

            let mut words = Buffers::<u32>::new(4, pkt).unwrap();
            for i in 0..4 {
                let vals = random_words(&mut rng, &field, pkt, max_word);
                words.get_mut(i).copy_from_slice(&vals);
            }
            let mut output = Buffers::<u32>::new(3, pkt).unwrap();
            let mut props = vec![Properties::new(); 3];
            code.encode_bufs(&mut output, &mut props, 0, &words);

            let mut wv = Vector::new(field.clone(), 4);
            let mut ov = Vector::new(field.clone(), 3);
            let mut props_w = vec![Properties::new(); 3];
            for idx in 0..pkt {
                for i in 0..4 {
                    wv.set(i, words.get(i)[idx]);
                }
                code.encode(&mut ov, &mut props_w, (idx * ws) as u64, &wv);
                for out in 0..3 {
                    assert_eq!(output.get(out)[idx], ov.get(out), "word {} out {}", idx, out);
                }
            }
            for out in 0..3 {
                assert_eq!(
                    props[out].iter().collect::<Vec<_>>(),
                    props_w[out].iter().collect::<Vec<_>>()
                );
            }
        }
    }

    #[test]
    fn decode_bufs_roundtrip_with_reinflation() {
        // Drive the packet decode path over data crafted to produce an
        // out-of-range parity word, losing two data fragments.
        let gf = Field::<u32>::fermat_prime(F4).unwrap();
        let mut code = ReedSolomon::new(
            gf.clone(),
            FecType::Systematic,
            GeneratorKind::Vandermonde,
            4,
            2,
            2,
            32,
        )
        .unwrap();
        let pkt = code.pkt_size();
        let mut rng = rng();

        let mut data = Buffers::<u32>::new(4, pkt).unwrap();
        for i in 0..4 {
            let vals = random_words(&mut rng, &gf, pkt, 65535);
            data.get_mut(i).copy_from_slice(&vals);
        }
        // Force word 5 of parity 0 out of range: solve for data[0][5].
        let row = code.generator().row(4).to_vec();
        loop {
            let mut rest = gf.zero();
            for j in 1..4 {
                rest = gf.add(rest, gf.mul(row[j], data.get(j)[5]));
            }
            let target = gf.sub(gf.card_minus_one(), rest);
            let w0 = gf.mul(gf.inv(row[0]).unwrap(), target);
            if w0 <= 65535 {
                data.get_mut(0)[5] = w0;
                break;
            }
            // w0 = 65536 is the one value that cannot travel as data;
            // nudging a neighbour shifts the target.
            let v = data.get(1)[5];
            data.get_mut(1)[5] = gf.add(v, 1);
        }

        let mut parity = Buffers::<u32>::new(2, pkt).unwrap();
        let mut props = vec![Properties::new(); 2];
        code.encode_bufs(&mut parity, &mut props, 0, &data);
        assert!(props[0].is_marked(10), "expected an out-of-range mark");

        // Survivors: d2, d3, c0, c1. The packed stream stores the marked
        // word as zero, which is what the truncating writer would emit.
        code.decode_reset();
        code.decode_add_data(0, 2).unwrap();
        code.decode_add_data(1, 3).unwrap();
        code.decode_add_parities(2, 0).unwrap();
        code.decode_add_parities(3, 1).unwrap();
        code.decode_build().unwrap();

        let mut chosen = Buffers::<u32>::new(4, pkt).unwrap();
        chosen.get_mut(0).copy_from_slice(data.get(2));
        chosen.get_mut(1).copy_from_slice(data.get(3));
        for (slot, out) in [(2usize, 0usize), (3, 1)] {
            let src: Vec<u32> = parity
                .get(out)
                .iter()
                .map(|&v| if v == 65536 { 0 } else { v })
                .collect();
            chosen.get_mut(slot).copy_from_slice(&src);
        }

        let mut recovered = Buffers::<u32>::new(4, pkt).unwrap();
        code.decode_bufs(&mut recovered, &props, 0, &mut chosen).unwrap();
        for i in 0..4 {
            assert_eq!(recovered.get(i), data.get(i), "fragment {}", i);
        }
    }
}
