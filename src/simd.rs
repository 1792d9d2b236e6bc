//! Vectorized modular kernels over the Fermat prime fields.
//!
//! Every operation has a scalar reference implementation; the AVX2 (x86-64)
//! and NEON (aarch64) paths are compiled behind the `simd` feature and the
//! matching `target_feature`, and dispatchers fall through to scalar
//! otherwise. Lane widths follow the fields: 32-bit lanes carry F3 or F4
//! elements, 16-bit lanes carry F3 elements.
//!
//! The modular reductions rely on the Fermat structure p = 2^w + 1:
//!
//! - ADD/SUB/NEG reduce branchlessly with an unsigned `min` against the
//!   wrapped candidate.
//! - MUL splits the raw product into `hi * 2^w + lo`; since 2^w = -1 mod p
//!   the result is `(lo - hi) mod p`. One operand must be <= card - 2 so
//!   the product cannot overflow the lane.
//! - MULFULL has no operand precondition: when both operands are card - 1
//!   the raw product wraps the lane (F4 in 32-bit lanes, F3 in 16-bit
//!   lanes) and is corrected by adding one before the split.

use crate::buffers::Buffers;
use crate::properties::{Marker, Properties};

#[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
mod x86;

#[cfg(all(feature = "simd", target_arch = "aarch64"))]
mod neon;

// =============================================================================
// Scalar reference kernels
// =============================================================================

/// `(x + y) mod card`; inputs must be valid elements.
#[inline(always)]
pub fn scalar_add_mod(x: u32, y: u32, card: u32) -> u32 {
    let r = x + y;
    if r >= card {
        r - card
    } else {
        r
    }
}

/// `(x - y) mod card`; inputs must be valid elements.
#[inline(always)]
pub fn scalar_sub_mod(x: u32, y: u32, card: u32) -> u32 {
    if x >= y {
        x - y
    } else {
        card - (y - x)
    }
}

/// `(-x) mod card`; maps zero to zero.
#[inline(always)]
pub fn scalar_neg_mod(x: u32, card: u32) -> u32 {
    if x == 0 {
        0
    } else {
        card - x
    }
}

/// `(x * y) mod card` through a double-width product.
#[inline(always)]
pub fn scalar_mul_mod(x: u32, y: u32, card: u32) -> u32 {
    ((x as u64 * y as u64) % card as u64) as u32
}

// =============================================================================
// Element-wise buffer routines, 32-bit lanes
// =============================================================================

/// `dest[i] = (dest[i] + src[i]) mod card`
pub fn add_two_bufs(src: &[u32], dest: &mut [u32], card: u32) {
    debug_assert_eq!(src.len(), dest.len());

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::add_two_bufs(src, dest, card) };
        return;
    }

    #[cfg(all(feature = "simd", target_arch = "aarch64"))]
    {
        unsafe { neon::add_two_bufs(src, dest, card) };
        return;
    }

    #[cfg(not(all(
        feature = "simd",
        any(
            all(target_arch = "x86_64", target_feature = "avx2"),
            target_arch = "aarch64"
        )
    )))]
    for (d, &s) in dest.iter_mut().zip(src) {
        *d = scalar_add_mod(*d, s, card);
    }
}

/// `res[i] = (bufa[i] - bufb[i]) mod card`
pub fn sub_two_bufs(bufa: &[u32], bufb: &[u32], res: &mut [u32], card: u32) {
    debug_assert_eq!(bufa.len(), bufb.len());
    debug_assert_eq!(bufa.len(), res.len());

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::sub_two_bufs(bufa, bufb, res, card) };
        return;
    }

    #[cfg(all(feature = "simd", target_arch = "aarch64"))]
    {
        unsafe { neon::sub_two_bufs(bufa, bufb, res, card) };
        return;
    }

    #[cfg(not(all(
        feature = "simd",
        any(
            all(target_arch = "x86_64", target_feature = "avx2"),
            target_arch = "aarch64"
        )
    )))]
    for i in 0..res.len() {
        res[i] = scalar_sub_mod(bufa[i], bufb[i], card);
    }
}

/// `dest[i] = (coef * src[i]) mod card`
///
/// `coef` must be <= card - 2; the caller routes card - 1 (i.e. -1)
/// coefficients elsewhere.
pub fn mul_coef_to_buf(coef: u32, src: &[u32], dest: &mut [u32], card: u32) {
    debug_assert_eq!(src.len(), dest.len());
    debug_assert!(coef <= card - 2);

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::mul_coef_to_buf(coef, src, dest, card) };
        return;
    }

    #[cfg(all(feature = "simd", target_arch = "aarch64"))]
    {
        unsafe { neon::mul_coef_to_buf(coef, src, dest, card) };
        return;
    }

    #[cfg(not(all(
        feature = "simd",
        any(
            all(target_arch = "x86_64", target_feature = "avx2"),
            target_arch = "aarch64"
        )
    )))]
    for (d, &s) in dest.iter_mut().zip(src) {
        *d = scalar_mul_mod(coef, s, card);
    }
}

/// `dest[i] = (dest[i] + coef * src[i]) mod card`
///
/// Same coefficient precondition as [`mul_coef_to_buf`].
pub fn mul_coef_add_to_buf(coef: u32, src: &[u32], dest: &mut [u32], card: u32) {
    debug_assert_eq!(src.len(), dest.len());
    debug_assert!(coef <= card - 2);

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::mul_coef_add_to_buf(coef, src, dest, card) };
        return;
    }

    #[cfg(all(feature = "simd", target_arch = "aarch64"))]
    {
        unsafe { neon::mul_coef_add_to_buf(coef, src, dest, card) };
        return;
    }

    #[cfg(not(all(
        feature = "simd",
        any(
            all(target_arch = "x86_64", target_feature = "avx2"),
            target_arch = "aarch64"
        )
    )))]
    for (d, &s) in dest.iter_mut().zip(src) {
        *d = scalar_add_mod(*d, scalar_mul_mod(coef, s, card), card);
    }
}

/// `dest[i] = (src[i] * dest[i]) mod card`, no operand precondition.
pub fn mul_two_bufs(src: &[u32], dest: &mut [u32], card: u32) {
    debug_assert_eq!(src.len(), dest.len());

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::mul_two_bufs(src, dest, card) };
        return;
    }

    #[cfg(all(feature = "simd", target_arch = "aarch64"))]
    {
        unsafe { neon::mul_two_bufs(src, dest, card) };
        return;
    }

    #[cfg(not(all(
        feature = "simd",
        any(
            all(target_arch = "x86_64", target_feature = "avx2"),
            target_arch = "aarch64"
        )
    )))]
    for (d, &s) in dest.iter_mut().zip(src) {
        *d = scalar_mul_mod(s, *d, card);
    }
}

/// `buf[i] = (-buf[i]) mod card`
pub fn neg_buf(buf: &mut [u32], card: u32) {
    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::neg_buf(buf, card) };
        return;
    }

    #[cfg(all(feature = "simd", target_arch = "aarch64"))]
    {
        unsafe { neon::neg_buf(buf, card) };
        return;
    }

    #[cfg(not(all(
        feature = "simd",
        any(
            all(target_arch = "x86_64", target_feature = "avx2"),
            target_arch = "aarch64"
        )
    )))]
    for v in buf.iter_mut() {
        *v = scalar_neg_mod(*v, card);
    }
}

// =============================================================================
// Element-wise buffer routines, 16-bit lanes (F3)
// =============================================================================

/// `dest[i] = (dest[i] + src[i]) mod card`, 16-bit lanes.
pub fn add_two_bufs_u16(src: &[u16], dest: &mut [u16], card: u16) {
    debug_assert_eq!(src.len(), dest.len());

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::add_two_bufs_u16(src, dest, card) };
        return;
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    for (d, &s) in dest.iter_mut().zip(src) {
        *d = scalar_add_mod(*d as u32, s as u32, card as u32) as u16;
    }
}

/// `res[i] = (bufa[i] - bufb[i]) mod card`, 16-bit lanes.
pub fn sub_two_bufs_u16(bufa: &[u16], bufb: &[u16], res: &mut [u16], card: u16) {
    debug_assert_eq!(bufa.len(), bufb.len());
    debug_assert_eq!(bufa.len(), res.len());

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::sub_two_bufs_u16(bufa, bufb, res, card) };
        return;
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    for i in 0..res.len() {
        res[i] = scalar_sub_mod(bufa[i] as u32, bufb[i] as u32, card as u32) as u16;
    }
}

/// `dest[i] = (coef * src[i]) mod card`, 16-bit lanes; `coef <= card - 2`.
pub fn mul_coef_to_buf_u16(coef: u16, src: &[u16], dest: &mut [u16], card: u16) {
    debug_assert_eq!(src.len(), dest.len());
    debug_assert!(coef <= card - 2);

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::mul_coef_to_buf_u16(coef, src, dest, card) };
        return;
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    for (d, &s) in dest.iter_mut().zip(src) {
        *d = scalar_mul_mod(coef as u32, s as u32, card as u32) as u16;
    }
}

/// `dest[i] = (src[i] * dest[i]) mod card`, 16-bit lanes, no precondition.
pub fn mul_two_bufs_u16(src: &[u16], dest: &mut [u16], card: u16) {
    debug_assert_eq!(src.len(), dest.len());

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::mul_two_bufs_u16(src, dest, card) };
        return;
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    for (d, &s) in dest.iter_mut().zip(src) {
        *d = scalar_mul_mod(s as u32, *d as u32, card as u32) as u16;
    }
}

/// `buf[i] = (-buf[i]) mod card`, 16-bit lanes.
pub fn neg_buf_u16(buf: &mut [u16], card: u16) {
    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::neg_buf_u16(buf, card) };
        return;
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    for v in buf.iter_mut() {
        *v = scalar_neg_mod(*v as u32, card as u32) as u16;
    }
}

// =============================================================================
// Butterfly pair kernels
// =============================================================================

/// Scalar butterfly with the twiddle dispatch shared by all drivers:
/// r = 1 pairs to (x + y, x - y), r = card - 1 to (x - y, x + y),
/// otherwise z = r * y and the pair is (x + z, x - z).
#[inline(always)]
pub fn scalar_butterfly_ct(r: u32, x: u32, y: u32, card: u32) -> (u32, u32) {
    if r == 1 {
        (scalar_add_mod(x, y, card), scalar_sub_mod(x, y, card))
    } else if r == card - 1 {
        (scalar_sub_mod(x, y, card), scalar_add_mod(x, y, card))
    } else {
        let z = scalar_mul_mod(r, y, card);
        (scalar_add_mod(x, z, card), scalar_sub_mod(x, z, card))
    }
}

/// Cooley-Tukey pair with r = 1: `(x, y) <- (x + y, x - y)`.
pub fn butterfly_add_pair(x: &mut [u32], y: &mut [u32], card: u32) {
    debug_assert_eq!(x.len(), y.len());

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::butterfly_add_pair(x, y, card) };
        return;
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    for i in 0..x.len() {
        let (a, b) = (x[i], y[i]);
        x[i] = scalar_add_mod(a, b, card);
        y[i] = scalar_sub_mod(a, b, card);
    }
}

/// Cooley-Tukey pair with r = card - 1: `(x, y) <- (x - y, x + y)`.
pub fn butterfly_sub_pair(x: &mut [u32], y: &mut [u32], card: u32) {
    debug_assert_eq!(x.len(), y.len());

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::butterfly_sub_pair(x, y, card) };
        return;
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    for i in 0..x.len() {
        let (a, b) = (x[i], y[i]);
        x[i] = scalar_sub_mod(a, b, card);
        y[i] = scalar_add_mod(a, b, card);
    }
}

/// Cooley-Tukey pair with a general twiddle:
/// `z = coef * y; (x, y) <- (x + z, x - z)`. `coef` must be in 2..card-1.
pub fn butterfly_muladd_pair(coef: u32, x: &mut [u32], y: &mut [u32], card: u32) {
    debug_assert_eq!(x.len(), y.len());
    debug_assert!(coef > 1 && coef < card - 1);

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::butterfly_muladd_pair(coef, x, y, card) };
        return;
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    for i in 0..x.len() {
        let z = scalar_mul_mod(coef, y[i], card);
        let a = x[i];
        x[i] = scalar_add_mod(a, z, card);
        y[i] = scalar_sub_mod(a, z, card);
    }
}

/// Gentleman-Sande pair with r = card - 1: `(x, y) <- (x + y, y - x)`.
pub fn butterfly_gs_pair(x: &mut [u32], y: &mut [u32], card: u32) {
    debug_assert_eq!(x.len(), y.len());

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::butterfly_gs_pair(x, y, card) };
        return;
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    for i in 0..x.len() {
        let (a, b) = (x[i], y[i]);
        x[i] = scalar_add_mod(a, b, card);
        y[i] = scalar_sub_mod(b, a, card);
    }
}

/// Gentleman-Sande pair with a general twiddle:
/// `(x, y) <- (x + y, coef * (x - y))`. `coef` must be in 2..card-1.
pub fn butterfly_addmul_pair(coef: u32, x: &mut [u32], y: &mut [u32], card: u32) {
    debug_assert_eq!(x.len(), y.len());
    debug_assert!(coef > 1 && coef < card - 1);

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::butterfly_addmul_pair(coef, x, y, card) };
        return;
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    for i in 0..x.len() {
        let (a, b) = (x[i], y[i]);
        let d = scalar_sub_mod(a, b, card);
        x[i] = scalar_add_mod(a, b, card);
        y[i] = scalar_mul_mod(coef, d, card);
    }
}

// =============================================================================
// Butterfly sweeps over fragment groups
// =============================================================================

/// CT butterfly with r = 1 on each pair `(buf[i], buf[i + m])` for
/// i = start, start + step, ...
pub fn butterfly_ct_1(buf: &mut Buffers<u32>, start: usize, m: usize, step: usize, card: u32) {
    let n = buf.n();
    let mut i = start;
    while i + m < n {
        let (x, y) = buf.get_pair_mut(i, i + m);
        butterfly_add_pair(x, y, card);
        i += step;
    }
}

/// CT butterfly with r = card - 1 on each pair `(buf[i], buf[i + m])`.
pub fn butterfly_ct_2(buf: &mut Buffers<u32>, start: usize, m: usize, step: usize, card: u32) {
    let n = buf.n();
    let mut i = start;
    while i + m < n {
        let (x, y) = buf.get_pair_mut(i, i + m);
        butterfly_sub_pair(x, y, card);
        i += step;
    }
}

/// CT butterfly with a general twiddle on each pair `(buf[i], buf[i + m])`.
pub fn butterfly_ct_3(
    coef: u32,
    buf: &mut Buffers<u32>,
    start: usize,
    m: usize,
    step: usize,
    card: u32,
) {
    let n = buf.n();
    let mut i = start;
    while i + m < n {
        let (x, y) = buf.get_pair_mut(i, i + m);
        butterfly_muladd_pair(coef, x, y, card);
        i += step;
    }
}

/// GS butterfly with r = card - 1 on each pair `(buf[i], buf[i + m])`.
pub fn butterfly_gs_2(buf: &mut Buffers<u32>, start: usize, m: usize, step: usize, card: u32) {
    let n = buf.n();
    let mut i = start;
    while i + m < n {
        let (x, y) = buf.get_pair_mut(i, i + m);
        butterfly_gs_pair(x, y, card);
        i += step;
    }
}

/// GS butterfly with a general twiddle on each pair `(buf[i], buf[i + m])`.
pub fn butterfly_gs_3(
    coef: u32,
    buf: &mut Buffers<u32>,
    start: usize,
    m: usize,
    step: usize,
    card: u32,
) {
    let n = buf.n();
    let mut i = start;
    while i + m < n {
        let (x, y) = buf.get_pair_mut(i, i + m);
        butterfly_addmul_pair(coef, x, y, card);
        i += step;
    }
}

/// Fused CT butterfly over two FFT layers.
///
/// For each quadruple
/// `(P, Q, R, S) = (buf[i], buf[i+m], buf[i+2m], buf[i+3m])` with
/// i = start, start + 4m, ...:
///
/// - first layer, twiddle r1: butterfly on (P, Q) and on (R, S);
/// - second layer, twiddles r2 and r3: butterfly on (P, R) and on (Q, S).
///
/// Both layers are applied in a single pass with four loads and four
/// stores per lane iteration, which is what makes this the hot path of
/// large transforms.
pub fn butterfly_ct_two_layers(
    buf: &mut Buffers<u32>,
    r1: u32,
    r2: u32,
    r3: u32,
    start: usize,
    m: usize,
    card: u32,
) {
    let step = m << 2;
    let n = buf.n();
    let mut i = start;
    while i + 3 * m < n {
        let (p, q, r, s) = buf.get_quad_mut(i, i + m, i + 2 * m, i + 3 * m);
        two_layers_quad(p, q, r, s, r1, r2, r3, card);
        i += step;
    }
}

fn two_layers_quad(
    p: &mut [u32],
    q: &mut [u32],
    r: &mut [u32],
    s: &mut [u32],
    r1: u32,
    r2: u32,
    r3: u32,
    card: u32,
) {
    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::two_layers_quad(p, q, r, s, r1, r2, r3, card) };
        return;
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    for j in 0..p.len() {
        let (x, y) = scalar_butterfly_ct(r1, p[j], q[j], card);
        let (u, v) = scalar_butterfly_ct(r1, r[j], s[j], card);
        let (x, u) = scalar_butterfly_ct(r2, x, u, card);
        let (y, v) = scalar_butterfly_ct(r3, y, v, card);
        p[j] = x;
        q[j] = y;
        r[j] = u;
        s[j] = v;
    }
}

// =============================================================================
// Post-encode property scan
// =============================================================================

/// Record an out-of-range mark for every lane of `buf` equal to
/// `threshold` (= card - 1 = 2^w).
///
/// `offset` is the byte offset of the first lane in the fragment stream and
/// `word_size` the stream word width in bytes.
pub fn scan_out_of_range(
    buf: &[u32],
    threshold: u32,
    props: &mut Properties,
    offset: u64,
    word_size: usize,
) {
    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { x86::scan_out_of_range(buf, threshold, props, offset, word_size) };
        return;
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    for (i, &v) in buf.iter().enumerate() {
        if v == threshold {
            props.add(offset + (i * word_size) as u64, Marker::OutOfRange);
        }
    }
}

/// Sweep the property scan over every fragment of an encoded output.
pub fn encode_post_process(
    output: &Buffers<u32>,
    props: &mut [Properties],
    offset: u64,
    threshold: u32,
    word_size: usize,
) {
    debug_assert_eq!(props.len(), output.n());
    for (frag_id, frag_props) in props.iter_mut().enumerate() {
        scan_out_of_range(output.get(frag_id), threshold, frag_props, offset, word_size);
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
        rand::rngs::StdRng::seed_from_u64(0x0f3c_1a2b)
    }

    fn random_elems(rng: &mut impl Rng, len: usize, card: u32) -> Vec<u32> {
        (0..len).map(|_| rng.gen_range(0..card)).collect()
    }

    #[test]
    fn add_sub_neg_match_scalar() {
        let mut rng = rng();
        for card in [F3 as u32, F4 as u32] {
            // Lengths around the lane width to exercise the tails.
            for len in [1usize, 7, 8, 9, 64, 201] {
                let a = random_elems(&mut rng, len, card);
                let b = random_elems(&mut rng, len, card);

                let mut dest = b.clone();
                add_two_bufs(&a, &mut dest, card);
                for i in 0..len {
                    assert_eq!(dest[i], scalar_add_mod(b[i], a[i], card));
                }

                let mut res = vec![0u32; len];
                sub_two_bufs(&a, &b, &mut res, card);
                for i in 0..len {
                    assert_eq!(res[i], scalar_sub_mod(a[i], b[i], card));
                }

                let mut buf = a.clone();
                neg_buf(&mut buf, card);
                for i in 0..len {
                    assert_eq!(buf[i], scalar_neg_mod(a[i], card));
                }
            }
        }
    }

    #[test]
    fn mul_kernels_match_scalar() {
        let mut rng = rng();
        for card in [F3 as u32, F4 as u32] {
            for len in [8usize, 33, 1024] {
                let src = random_elems(&mut rng, len, card);
                let coef = rng.gen_range(2..card - 1);

                let mut dest = vec![0u32; len];
                mul_coef_to_buf(coef, &src, &mut dest, card);
                for i in 0..len {
                    assert_eq!(dest[i], scalar_mul_mod(coef, src[i], card));
                }

                let acc0 = random_elems(&mut rng, len, card);
                let mut acc = acc0.clone();
                mul_coef_add_to_buf(coef, &src, &mut acc, card);
                for i in 0..len {
                    let expected =
                        scalar_add_mod(acc0[i], scalar_mul_mod(coef, src[i], card), card);
                    assert_eq!(acc[i], expected);
                }
            }
        }
    }

    #[test]
    fn mulfull_handles_extreme_operands() {
        for card in [F3 as u32, F4 as u32] {
            let max = card - 1;
            // Every combination of the edge values plus a few interior ones.
            let edge = [0u32, 1, 2, max - 1, max];
            for &a in &edge {
                for &b in &edge {
                    let src = vec![a; 16];
                    let mut dest = vec![b; 16];
                    mul_two_bufs(&src, &mut dest, card);
                    assert_eq!(
                        dest[0],
                        scalar_mul_mod(a, b, card),
                        "card={} {}*{}",
                        card,
                        a,
                        b
                    );
                }
            }
        }
    }

    #[test]
    fn u16_kernels_match_scalar() {
        let card = F3 as u16;
        let mut rng = rng();
        for len in [8usize, 31, 300] {
            let a: Vec<u16> = (0..len).map(|_| rng.gen_range(0..card)).collect();
            let b: Vec<u16> = (0..len).map(|_| rng.gen_range(0..card)).collect();

            let mut dest = b.clone();
            add_two_bufs_u16(&a, &mut dest, card);
            for i in 0..len {
                assert_eq!(
                    dest[i] as u32,
                    scalar_add_mod(b[i] as u32, a[i] as u32, card as u32)
                );
            }

            let mut res = vec![0u16; len];
            sub_two_bufs_u16(&a, &b, &mut res, card);
            for i in 0..len {
                assert_eq!(
                    res[i] as u32,
                    scalar_sub_mod(a[i] as u32, b[i] as u32, card as u32)
                );
            }

            let coef = rng.gen_range(2..card - 1);
            let mut dest = vec![0u16; len];
            mul_coef_to_buf_u16(coef, &a, &mut dest, card);
            for i in 0..len {
                assert_eq!(
                    dest[i] as u32,
                    scalar_mul_mod(coef as u32, a[i] as u32, card as u32)
                );
            }

            // 256 * 256 wraps a 16-bit lane; must still reduce to 1.
            let src = vec![256u16; len];
            let mut dest = vec![256u16; len];
            mul_two_bufs_u16(&src, &mut dest, card);
            assert!(dest.iter().all(|&v| v == 1));

            let mut buf = a.clone();
            neg_buf_u16(&mut buf, card);
            for i in 0..len {
                assert_eq!(buf[i] as u32, scalar_neg_mod(a[i] as u32, card as u32));
            }
        }
    }

    #[test]
    fn pair_butterflies_match_formulas() {
        let card = F4 as u32;
        let mut rng = rng();
        let len = 40;
        let x0 = random_elems(&mut rng, len, card);
        let y0 = random_elems(&mut rng, len, card);

        let (mut x, mut y) = (x0.clone(), y0.clone());
        butterfly_add_pair(&mut x, &mut y, card);
        for i in 0..len {
            assert_eq!(x[i], scalar_add_mod(x0[i], y0[i], card));
            assert_eq!(y[i], scalar_sub_mod(x0[i], y0[i], card));
        }

        let (mut x, mut y) = (x0.clone(), y0.clone());
        butterfly_sub_pair(&mut x, &mut y, card);
        for i in 0..len {
            assert_eq!(x[i], scalar_sub_mod(x0[i], y0[i], card));
            assert_eq!(y[i], scalar_add_mod(x0[i], y0[i], card));
        }

        let coef = 1234;
        let (mut x, mut y) = (x0.clone(), y0.clone());
        butterfly_muladd_pair(coef, &mut x, &mut y, card);
        for i in 0..len {
            let z = scalar_mul_mod(coef, y0[i], card);
            assert_eq!(x[i], scalar_add_mod(x0[i], z, card));
            assert_eq!(y[i], scalar_sub_mod(x0[i], z, card));
        }

        let (mut x, mut y) = (x0.clone(), y0.clone());
        butterfly_gs_pair(&mut x, &mut y, card);
        for i in 0..len {
            assert_eq!(x[i], scalar_add_mod(x0[i], y0[i], card));
            assert_eq!(y[i], scalar_sub_mod(y0[i], x0[i], card));
        }

        let (mut x, mut y) = (x0.clone(), y0.clone());
        butterfly_addmul_pair(coef, &mut x, &mut y, card);
        for i in 0..len {
            let d = scalar_sub_mod(x0[i], y0[i], card);
            assert_eq!(x[i], scalar_add_mod(x0[i], y0[i], card));
            assert_eq!(y[i], scalar_mul_mod(coef, d, card));
        }
    }

    #[test]
    fn two_layers_equals_two_single_layers() {
        let card = F4 as u32;
        let mut rng = rng();
        // 8 fragments of 16 words, m = 1: two quads.
        let mut fused = Buffers::<u32>::new(8, 16).unwrap();
        for i in 0..8 {
            let vals = random_elems(&mut rng, 16, card);
            fused.get_mut(i).copy_from_slice(&vals);
        }

        for (r1, r2, r3) in [(1u32, 1, 7), (7, 9, 1), (card - 1, 7, card - 1), (5, 3, 11)] {
            let mut a = Buffers::<u32>::new(8, 16).unwrap();
            let mut b = Buffers::<u32>::new(8, 16).unwrap();
            for i in 0..8 {
                let src = fused.get(i).to_vec();
                a.get_mut(i).copy_from_slice(&src);
                b.get_mut(i).copy_from_slice(&src);
            }

            butterfly_ct_two_layers(&mut a, r1, r2, r3, 0, 1, card);

            // First layer on (P, Q) and (R, S) at stride 2m, second layer on
            // (P, R) and (Q, S) at stride 4m.
            apply_single(&mut b, r1, 0, 1, 2, card);
            apply_single(&mut b, r2, 0, 2, 4, card);
            apply_single(&mut b, r3, 1, 2, 4, card);

            for i in 0..8 {
                assert_eq!(a.get(i), b.get(i), "r=({},{},{}) frag {}", r1, r2, r3, i);
            }
        }
    }

    fn apply_single(buf: &mut Buffers<u32>, r: u32, start: usize, m: usize, step: usize, card: u32) {
        if r == 1 {
            butterfly_ct_1(buf, start, m, step, card);
        } else if r == card - 1 {
            butterfly_ct_2(buf, start, m, step, card);
        } else {
            butterfly_ct_3(r, buf, start, m, step, card);
        }
    }

    #[test]
    fn out_of_range_scan_finds_planted_lanes() {
        let card = F4 as u32;
        let threshold = card - 1;
        let mut bufs = Buffers::<u32>::new(2, 24).unwrap();
        bufs.get_mut(0)[3] = threshold;
        bufs.get_mut(0)[8] = threshold;
        bufs.get_mut(1)[23] = threshold;
        bufs.get_mut(1)[0] = threshold - 1; // near miss

        let mut props = vec![Properties::new(), Properties::new()];
        encode_post_process(&bufs, &mut props, 1000, threshold, 2);

        let offsets0: Vec<u64> = props[0].iter().map(|(o, _)| o).collect();
        assert_eq!(offsets0, vec![1000 + 6, 1000 + 16]);
        let offsets1: Vec<u64> = props[1].iter().map(|(o, _)| o).collect();
        assert_eq!(offsets1, vec![1000 + 46]);
    }

    #[test]
    fn simd_mul_f4_reference_vector() {
        // [0..8] times a half-extreme vector over F4.
        let card = F4 as u32;
        let a: Vec<u32> = (0..8).collect();
        let b = [65536u32, 65536, 65536, 65536, 1, 1, 1, 1];
        let mut dest = b.to_vec();
        mul_two_bufs(&a, &mut dest, card);
        // 0 * 65536 = 0; k * 65536 = -k; k * 1 = k.
        assert_eq!(dest, vec![0, 65536, 65535, 65534, 4, 5, 6, 7]);
    }
}
