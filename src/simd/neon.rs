//! NEON kernels for the Fermat prime fields, 32-bit lanes.
//!
//! Covers the element-wise buffer routines; the butterfly sweeps and the
//! property scan take the scalar path on aarch64. Each routine finishes
//! with a scalar tail for the lanes past the last full vector.

#![allow(clippy::missing_safety_doc)]

use core::arch::aarch64::*;

use crate::field::F4;

use super::{scalar_add_mod, scalar_mul_mod, scalar_neg_mod, scalar_sub_mod};

const LANES: usize = 4;

#[inline(always)]
unsafe fn add_mod(x: uint32x4_t, y: uint32x4_t, card: uint32x4_t) -> uint32x4_t {
    let r = vaddq_u32(x, y);
    vminq_u32(r, vsubq_u32(r, card))
}

#[inline(always)]
unsafe fn sub_mod(x: uint32x4_t, y: uint32x4_t, card: uint32x4_t) -> uint32x4_t {
    let r = vsubq_u32(x, y);
    vminq_u32(r, vaddq_u32(r, card))
}

/// `(x * y) mod card`, assuming at least one operand <= card - 2.
#[inline(always)]
unsafe fn mul_mod(
    x: uint32x4_t,
    y: uint32x4_t,
    card: uint32x4_t,
    lo_mask: uint32x4_t,
    shift: int32x4_t,
) -> uint32x4_t {
    let r = vmulq_u32(x, y);
    let lo = vandq_u32(r, lo_mask);
    let hi = vshlq_u32(r, shift);
    sub_mod(lo, hi, card)
}

#[target_feature(enable = "neon")]
pub unsafe fn add_two_bufs(src: &[u32], dest: &mut [u32], card: u32) {
    let vcard = vdupq_n_u32(card);
    let len = dest.len();
    let chunks = len / LANES;
    for i in 0..chunks {
        let off = i * LANES;
        let r = add_mod(
            vld1q_u32(src.as_ptr().add(off)),
            vld1q_u32(dest.as_ptr().add(off)),
            vcard,
        );
        vst1q_u32(dest.as_mut_ptr().add(off), r);
    }
    for i in chunks * LANES..len {
        dest[i] = scalar_add_mod(dest[i], src[i], card);
    }
}

#[target_feature(enable = "neon")]
pub unsafe fn sub_two_bufs(bufa: &[u32], bufb: &[u32], res: &mut [u32], card: u32) {
    let vcard = vdupq_n_u32(card);
    let len = res.len();
    let chunks = len / LANES;
    for i in 0..chunks {
        let off = i * LANES;
        let r = sub_mod(
            vld1q_u32(bufa.as_ptr().add(off)),
            vld1q_u32(bufb.as_ptr().add(off)),
            vcard,
        );
        vst1q_u32(res.as_mut_ptr().add(off), r);
    }
    for i in chunks * LANES..len {
        res[i] = scalar_sub_mod(bufa[i], bufb[i], card);
    }
}

#[target_feature(enable = "neon")]
pub unsafe fn mul_coef_to_buf(coef: u32, src: &[u32], dest: &mut [u32], card: u32) {
    let vcard = vdupq_n_u32(card);
    let lo_mask = vdupq_n_u32(card - 2);
    let shift = vdupq_n_s32(if card as u64 == F4 { -16 } else { -8 });
    let vcoef = vdupq_n_u32(coef);
    let len = dest.len();
    let chunks = len / LANES;
    for i in 0..chunks {
        let off = i * LANES;
        let r = mul_mod(vcoef, vld1q_u32(src.as_ptr().add(off)), vcard, lo_mask, shift);
        vst1q_u32(dest.as_mut_ptr().add(off), r);
    }
    for i in chunks * LANES..len {
        dest[i] = scalar_mul_mod(coef, src[i], card);
    }
}

#[target_feature(enable = "neon")]
pub unsafe fn mul_coef_add_to_buf(coef: u32, src: &[u32], dest: &mut [u32], card: u32) {
    let vcard = vdupq_n_u32(card);
    let lo_mask = vdupq_n_u32(card - 2);
    let shift = vdupq_n_s32(if card as u64 == F4 { -16 } else { -8 });
    let vcoef = vdupq_n_u32(coef);
    let len = dest.len();
    let chunks = len / LANES;
    for i in 0..chunks {
        let off = i * LANES;
        let p = mul_mod(vcoef, vld1q_u32(src.as_ptr().add(off)), vcard, lo_mask, shift);
        let r = add_mod(vld1q_u32(dest.as_ptr().add(off)), p, vcard);
        vst1q_u32(dest.as_mut_ptr().add(off), r);
    }
    for i in chunks * LANES..len {
        dest[i] = scalar_add_mod(dest[i], scalar_mul_mod(coef, src[i], card), card);
    }
}

#[target_feature(enable = "neon")]
pub unsafe fn mul_two_bufs(src: &[u32], dest: &mut [u32], card: u32) {
    let vcard = vdupq_n_u32(card);
    let vcardm1 = vdupq_n_u32(card - 1);
    let one = vdupq_n_u32(1);
    let lo_mask = vdupq_n_u32(card - 2);
    let is_f4 = card as u64 == F4;
    let shift = vdupq_n_s32(if is_f4 { -16 } else { -8 });
    let len = dest.len();
    let chunks = len / LANES;
    for i in 0..chunks {
        let off = i * LANES;
        let x = vld1q_u32(src.as_ptr().add(off));
        let y = vld1q_u32(dest.as_ptr().add(off));
        let mut r = vmulq_u32(x, y);
        if is_f4 {
            // card-1 squared wraps the lane to zero; add one back.
            let cmp = vandq_u32(vceqq_u32(x, vcardm1), vceqq_u32(y, vcardm1));
            r = vaddq_u32(r, vandq_u32(one, cmp));
        }
        let lo = vandq_u32(r, lo_mask);
        let hi = vshlq_u32(r, shift);
        vst1q_u32(dest.as_mut_ptr().add(off), sub_mod(lo, hi, vcard));
    }
    for i in chunks * LANES..len {
        dest[i] = scalar_mul_mod(src[i], dest[i], card);
    }
}

#[target_feature(enable = "neon")]
pub unsafe fn neg_buf(buf: &mut [u32], card: u32) {
    let vcard = vdupq_n_u32(card);
    let len = buf.len();
    let chunks = len / LANES;
    for i in 0..chunks {
        let off = i * LANES;
        let x = vld1q_u32(buf.as_ptr().add(off));
        let r = vsubq_u32(vcard, x);
        let r = vminq_u32(r, vsubq_u32(r, vcard));
        vst1q_u32(buf.as_mut_ptr().add(off), r);
    }
    for i in chunks * LANES..len {
        buf[i] = scalar_neg_mod(buf[i], card);
    }
}
