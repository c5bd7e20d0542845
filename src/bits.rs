//! Arbitrary-precision bit-vectors.
//!
//! A [`Bits`] value is a fixed-width, signed-or-unsigned integer stored as a
//! sequence of 64-bit limbs. Every operation preserves the invariant that the
//! representation is normalized to exactly `width` bits: the high limb is
//! always masked so that no bits above `width` are set.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

const LIMB_BITS: u32 = 64;

/// A signed or unsigned bit-vector of a fixed declared width.
#[derive(Clone, Eq)]
pub struct Bits {
    width: u32,
    signed: bool,
    limbs: Vec<u64>,
}

/// Failure produced when parsing a [`Bits`] value from text.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MalformedLiteral {
    /// A digit was out of range for the declared base, at the given byte offset.
    #[error("malformed literal: invalid digit at offset {offset}")]
    InvalidDigit {
        /// Byte offset of the offending character within the parsed text.
        offset: usize,
    },
    /// The literal contained no digits at all.
    #[error("malformed literal: no digits present")]
    NoDigits,
}

fn limb_count(width: u32) -> usize {
    (width as usize).div_ceil(LIMB_BITS as usize)
}

fn high_limb_mask(width: u32) -> u64 {
    let rem = width % LIMB_BITS;
    if rem == 0 {
        u64::MAX
    } else {
        (1u64 << rem) - 1
    }
}

impl Bits {
    /// Construct a zero-valued `Bits` of the given width.
    pub fn zero(width: u32, signed: bool) -> Self {
        assert!(width > 0, "Bits width must be non-zero");
        Self {
            width,
            signed,
            limbs: vec![0; limb_count(width)],
        }
    }

    /// Construct from an unsigned machine integer, truncating or zero-extending to `width`.
    pub fn from_u64(value: u64, width: u32) -> Self {
        let mut b = Self::zero(width, false);
        b.limbs[0] = value;
        b.normalize();
        b
    }

    /// Construct from a signed machine integer, truncating or sign-extending to `width`.
    pub fn from_i64(value: i64, width: u32) -> Self {
        let mut b = Self::zero(width, true);
        b.limbs[0] = value as u64;
        if value < 0 {
            for limb in b.limbs.iter_mut().skip(1) {
                *limb = u64::MAX;
            }
        }
        b.normalize();
        b
    }

    /// Width in bits.
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Whether this value is interpreted as two's-complement signed.
    pub const fn is_signed(&self) -> bool {
        self.signed
    }

    /// Parse a `Bits` value from text. `base` must be 2, 10, or 16. Digits are
    /// most-significant-bit/digit-first, matching the declared base.
    ///
    /// Digits are folded in with width-independent scalar arithmetic (not by
    /// building a `base`-valued `Bits` of the target width): a base of 16
    /// doesn't fit in a 3-bit destination, so a same-width radix would itself
    /// wrap to zero and corrupt every digit.
    pub fn parse(text: &str, base: u32, width: u32, signed: bool) -> Result<Self, MalformedLiteral> {
        assert!(matches!(base, 2 | 10 | 16), "unsupported base {base}");
        if text.is_empty() {
            return Err(MalformedLiteral::NoDigits);
        }
        let mut acc = Self::zero(width, signed);
        let mut seen_digit = false;
        for (offset, ch) in text.char_indices() {
            let digit = ch
                .to_digit(base)
                .ok_or(MalformedLiteral::InvalidDigit { offset })?;
            seen_digit = true;
            acc = acc.mul_small(base as u64).add_small(digit as u64);
        }
        if !seen_digit {
            return Err(MalformedLiteral::NoDigits);
        }
        Ok(acc)
    }

    /// Render as text with a leading base tag (`0b`, `0d`, or `0x`), most-significant-digit-first.
    pub fn format(&self, base: u32) -> String {
        let tag = match base {
            2 => "0b",
            10 => "0d",
            16 => "0x",
            _ => panic!("unsupported base {base}"),
        };
        if self.is_zero() {
            return format!("{tag}0");
        }
        let mut digits = Vec::new();
        let mut rem = self.clone();
        while !rem.is_zero() {
            let (q, r) = rem.div_rem_small(base as u64);
            digits.push(std::char::from_digit(r as u32, base).unwrap());
            rem = q;
        }
        digits.reverse();
        format!("{tag}{}", digits.into_iter().collect::<String>())
    }

    /// Multiply by a small scalar, carrying across limbs at full precision
    /// before wrapping to `width` (unlike [`Bits::wrapping_mul`], whose other
    /// operand is itself a same-width `Bits` that could already be truncated).
    fn mul_small(&self, scalar: u64) -> Self {
        let mut out = self.clone();
        let mut carry = 0u128;
        for limb in out.limbs.iter_mut() {
            let product = *limb as u128 * scalar as u128 + carry;
            *limb = product as u64;
            carry = product >> LIMB_BITS;
        }
        out.normalize();
        out
    }

    /// Add a small scalar, carrying across limbs.
    fn add_small(&self, scalar: u64) -> Self {
        let mut out = self.clone();
        let mut carry = scalar as u128;
        for limb in out.limbs.iter_mut() {
            if carry == 0 {
                break;
            }
            let sum = *limb as u128 + carry;
            *limb = sum as u64;
            carry = sum >> LIMB_BITS;
        }
        out.normalize();
        out
    }

    /// Divide by a small scalar (schoolbook long division limb by limb,
    /// most-significant first). Returns `(quotient, remainder)`.
    fn div_rem_small(&self, divisor: u64) -> (Self, u64) {
        let mut quotient = self.clone();
        let mut rem: u128 = 0;
        for limb in quotient.limbs.iter_mut().rev() {
            let cur = (rem << LIMB_BITS) | *limb as u128;
            *limb = (cur / divisor as u128) as u64;
            rem = cur % divisor as u128;
        }
        quotient.normalize();
        (quotient, rem as u64)
    }

    /// Parse text produced by [`Bits::format`]: a leading base tag (`0b`,
    /// `0d`, or `0x`) determines the base the remaining digits are read in.
    pub fn parse_tagged(text: &str, width: u32, signed: bool) -> Result<Self, MalformedLiteral> {
        let (base, rest) = match text.get(0..2) {
            Some("0b") => (2, &text[2..]),
            Some("0d") => (10, &text[2..]),
            Some("0x") => (16, &text[2..]),
            _ => (2, text),
        };
        Self::parse(rest, base, width, signed)
    }

    /// Resize to `new_width`, preserving the low bits and zero/sign-extending per the sign flag.
    pub fn resize(&self, new_width: u32) -> Self {
        assert!(new_width > 0);
        let mut out = Self::zero(new_width, self.signed);
        let extend_with_ones = self.signed && self.is_negative();
        for (i, limb) in out.limbs.iter_mut().enumerate() {
            *limb = if i < self.limbs.len() {
                self.limbs[i]
            } else if extend_with_ones {
                u64::MAX
            } else {
                0
            };
        }
        out.normalize();
        out
    }

    fn normalize(&mut self) {
        let n = limb_count(self.width);
        self.limbs.resize(n, 0);
        if let Some(last) = self.limbs.last_mut() {
            *last &= high_limb_mask(self.width);
        }
    }

    /// True iff every bit is zero.
    pub fn is_zero(&self) -> bool {
        self.limbs.iter().all(|&l| l == 0)
    }

    fn is_negative(&self) -> bool {
        if !self.signed {
            return false;
        }
        let top_bit = (self.width - 1) % LIMB_BITS;
        let top_limb = self.limbs[limb_count(self.width) - 1];
        (top_limb >> top_bit) & 1 == 1
    }

    fn same_width(&self, other: &Self) -> bool {
        self.width == other.width
    }

    /// Bitwise AND. Operands must share a width.
    pub fn and(&self, other: &Self) -> Self {
        self.zip_bitwise(other, |a, b| a & b)
    }

    /// Bitwise OR. Operands must share a width.
    pub fn or(&self, other: &Self) -> Self {
        self.zip_bitwise(other, |a, b| a | b)
    }

    /// Bitwise XOR. Operands must share a width.
    pub fn xor(&self, other: &Self) -> Self {
        self.zip_bitwise(other, |a, b| a ^ b)
    }

    /// Bitwise NOT.
    pub fn not(&self) -> Self {
        let mut out = self.clone();
        for limb in out.limbs.iter_mut() {
            *limb = !*limb;
        }
        out.normalize();
        out
    }

    fn zip_bitwise(&self, other: &Self, f: impl Fn(u64, u64) -> u64) -> Self {
        assert!(self.same_width(other), "width mismatch in bitwise op");
        let mut out = self.clone();
        for (a, b) in out.limbs.iter_mut().zip(other.limbs.iter()) {
            *a = f(*a, *b);
        }
        out.normalize();
        out
    }

    /// Logical left shift by `amount` bits, wrapping to `width`.
    pub fn shl(&self, amount: u32) -> Self {
        if amount >= self.width {
            return Self::zero(self.width, self.signed);
        }
        let mut out = Self::zero(self.width, self.signed);
        for bit in 0..self.width {
            if bit + amount < self.width && self.get_bit(bit) {
                out.set_bit(bit + amount);
            }
        }
        out.normalize();
        out
    }

    /// Logical right shift by `amount` bits (zero-filled).
    pub fn shr_logical(&self, amount: u32) -> Self {
        if amount >= self.width {
            return Self::zero(self.width, self.signed);
        }
        let mut out = Self::zero(self.width, self.signed);
        for bit in amount..self.width {
            if self.get_bit(bit) {
                out.set_bit(bit - amount);
            }
        }
        out.normalize();
        out
    }

    /// Arithmetic right shift by `amount` bits (sign-extended per [`Bits::is_signed`]).
    pub fn shr_arithmetic(&self, amount: u32) -> Self {
        if !self.signed {
            return self.shr_logical(amount);
        }
        let fill = self.is_negative();
        let mut out = Self::zero(self.width, self.signed);
        for bit in 0..self.width {
            let src = bit + amount;
            let value = if src >= self.width {
                fill
            } else {
                self.get_bit(src)
            };
            if value {
                out.set_bit(bit);
            }
        }
        out.normalize();
        out
    }

    fn get_bit(&self, bit: u32) -> bool {
        let limb = (bit / LIMB_BITS) as usize;
        let off = bit % LIMB_BITS;
        (self.limbs[limb] >> off) & 1 == 1
    }

    fn set_bit(&mut self, bit: u32) {
        let limb = (bit / LIMB_BITS) as usize;
        let off = bit % LIMB_BITS;
        self.limbs[limb] |= 1 << off;
    }

    /// Wrapping addition modulo 2^width.
    pub fn wrapping_add(&self, other: &Self) -> Self {
        assert!(self.same_width(other));
        let mut out = self.clone();
        let mut carry = 0u128;
        for (a, b) in out.limbs.iter_mut().zip(other.limbs.iter()) {
            let sum = *a as u128 + *b as u128 + carry;
            *a = sum as u64;
            carry = sum >> LIMB_BITS;
        }
        out.normalize();
        out
    }

    /// Wrapping subtraction modulo 2^width.
    pub fn wrapping_sub(&self, other: &Self) -> Self {
        assert!(self.same_width(other));
        let negated = other.not().wrapping_add(&Self::from_u64(1, self.width));
        self.wrapping_add(&negated)
    }

    /// Wrapping multiplication modulo 2^width.
    pub fn wrapping_mul(&self, other: &Self) -> Self {
        assert!(self.same_width(other));
        let mut acc = Self::zero(self.width, self.signed);
        let mut addend = self.clone();
        for bit in 0..other.width {
            if other.get_bit(bit) {
                acc = acc.wrapping_add(&addend);
            }
            addend = addend.shl(1);
        }
        acc
    }

    /// Unsigned division with remainder. Division by zero yields `(0, 0)`, not an error.
    pub fn div_rem_unsigned(&self, divisor: &Self) -> (Self, Self) {
        assert!(self.same_width(divisor));
        if divisor.is_zero() {
            return (
                Self::zero(self.width, self.signed),
                Self::zero(self.width, self.signed),
            );
        }
        let mut quotient = Self::zero(self.width, self.signed);
        let mut remainder = Self::zero(self.width, self.signed);
        for bit in (0..self.width).rev() {
            remainder = remainder.shl(1);
            if self.get_bit(bit) {
                remainder.set_bit(0);
            }
            if remainder.compare_unsigned(divisor) != Ordering::Less {
                remainder = remainder.wrapping_sub(divisor);
                quotient.set_bit(bit);
            }
        }
        (quotient, remainder)
    }

    /// Signed division with remainder (truncating toward zero). Division by zero yields `(0, 0)`.
    pub fn div_rem_signed(&self, divisor: &Self) -> (Self, Self) {
        if divisor.is_zero() {
            return (
                Self::zero(self.width, self.signed),
                Self::zero(self.width, self.signed),
            );
        }
        let neg_a = self.is_negative();
        let neg_b = divisor.is_negative();
        let abs_a = if neg_a { self.negate() } else { self.clone() };
        let abs_b = if neg_b { divisor.negate() } else { divisor.clone() };
        let (q, r) = abs_a.div_rem_unsigned(&abs_b);
        let q = if neg_a != neg_b { q.negate() } else { q };
        let r = if neg_a { r.negate() } else { r };
        (q, r)
    }

    fn negate(&self) -> Self {
        self.not().wrapping_add(&Self::from_u64(1, self.width))
    }

    fn compare_unsigned(&self, other: &Self) -> Ordering {
        assert!(self.same_width(other));
        for i in (0..self.limbs.len()).rev() {
            match self.limbs[i].cmp(&other.limbs[i]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }

    /// Compare as unsigned magnitudes regardless of the sign flag.
    pub fn compare_as_unsigned(&self, other: &Self) -> Ordering {
        self.compare_unsigned(other)
    }

    /// Compare honoring [`Bits::is_signed`] (two's-complement order when signed).
    pub fn compare_signed_aware(&self, other: &Self) -> Ordering {
        assert!(self.same_width(other));
        if !self.signed {
            return self.compare_unsigned(other);
        }
        match (self.is_negative(), other.is_negative()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => self.compare_unsigned(other),
        }
    }

    /// Concatenate `self` as the high bits and `low` as the low bits.
    pub fn concat(&self, low: &Self) -> Self {
        let new_width = self.width + low.width;
        let mut out = Self::zero(new_width, false);
        for bit in 0..low.width {
            if low.get_bit(bit) {
                out.set_bit(bit);
            }
        }
        for bit in 0..self.width {
            if self.get_bit(bit) {
                out.set_bit(bit + low.width);
            }
        }
        out.normalize();
        out
    }

    /// Extract the inclusive bit range `[hi:lo]` as a new `Bits` of width `hi - lo + 1`.
    pub fn slice(&self, hi: u32, lo: u32) -> Self {
        assert!(hi >= lo && hi < self.width, "invalid slice range");
        let new_width = hi - lo + 1;
        let mut out = Self::zero(new_width, false);
        for bit in lo..=hi {
            if self.get_bit(bit) {
                out.set_bit(bit - lo);
            }
        }
        out.normalize();
        out
    }

    /// Binary codec: little-endian width (u32), flags (u8, bit 0 = signed), then
    /// `ceil(width / 8)` little-endian bytes.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.width.to_le_bytes());
        out.push(self.signed as u8);
        let byte_len = (self.width as usize).div_ceil(8);
        let mut bytes = vec![0u8; limb_count(self.width) * 8];
        for (i, limb) in self.limbs.iter().enumerate() {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&limb.to_le_bytes());
        }
        out.extend_from_slice(&bytes[..byte_len]);
        out
    }

    /// Decode the binary form produced by [`Bits::to_binary`].
    pub fn from_binary(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < 5 {
            return None;
        }
        let width = u32::from_le_bytes(data[0..4].try_into().ok()?);
        let signed = data[4] != 0;
        let byte_len = (width as usize).div_ceil(8);
        if data.len() < 5 + byte_len {
            return None;
        }
        let mut out = Self::zero(width, signed);
        let mut bytes = vec![0u8; limb_count(width) * 8];
        bytes[..byte_len].copy_from_slice(&data[5..5 + byte_len]);
        for (i, limb) in out.limbs.iter_mut().enumerate() {
            *limb = u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().ok()?);
        }
        out.normalize();
        Some((out, 5 + byte_len))
    }
}

impl PartialEq for Bits {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width && self.signed == other.signed && self.limbs == other.limbs
    }
}

impl fmt::Debug for Bits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bits {{ width: {}, signed: {}, value: {} }}",
            self.width,
            self.signed,
            self.format(16)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_width_does_not_truncate_the_radix() {
        // width=1 can't hold a base-2 radix (2) or base-16 radix (16) as a
        // same-width `Bits`; formatting/parsing must not go through one.
        let one = Bits::from_u64(1, 1);
        assert_eq!(one.format(2), "0b1");
        assert_eq!(Bits::parse("1", 2, 1, false).unwrap(), one);

        let b = Bits::from_u64(0xf, 4);
        assert_eq!(b.format(16), "0xf");
        assert_eq!(Bits::parse("f", 16, 4, false).unwrap(), b);
    }

    #[test]
    fn round_trips_through_each_base() {
        for base in [2, 10, 16] {
            let b = Bits::from_u64(0x2b, 16);
            let text = b.format(base);
            let parsed = Bits::parse(&text[2..], base, 16, false).unwrap();
            assert_eq!(b, parsed);
        }
    }

    #[test]
    fn binary_round_trip_is_identity() {
        let b = Bits::from_i64(-17, 13);
        let bytes = b.to_binary();
        let (decoded, consumed) = Bits::from_binary(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(b, decoded);
    }

    #[test]
    fn arithmetic_wraps_modulo_2_to_w() {
        let w = 8;
        let a = Bits::from_u64(250, w);
        let b = Bits::from_u64(10, w);
        let sum = a.wrapping_add(&b);
        assert_eq!(sum, Bits::from_u64((250u64 + 10) % 256, w));
    }

    #[test]
    fn division_by_zero_yields_zero() {
        let a = Bits::from_u64(42, 8);
        let zero = Bits::zero(8, false);
        let (q, r) = a.div_rem_unsigned(&zero);
        assert!(q.is_zero());
        assert!(r.is_zero());
    }

    #[test]
    fn signed_compare_matches_twos_complement() {
        let neg_one = Bits::from_i64(-1, 8);
        let one = Bits::from_i64(1, 8);
        assert_eq!(neg_one.compare_signed_aware(&one), Ordering::Less);
    }

    #[test]
    fn malformed_literal_reports_offset() {
        let err = Bits::parse("1a1", 2, 8, false).unwrap_err();
        assert_eq!(err, MalformedLiteral::InvalidDigit { offset: 1 });
    }

    #[test]
    fn slice_and_concat_are_inverse() {
        let a = Bits::from_u64(0b1011_0110, 8);
        let hi = a.slice(7, 4);
        let lo = a.slice(3, 0);
        assert_eq!(hi.concat(&lo), a);
    }

    #[quickcheck_macros::quickcheck]
    fn add_matches_wrapping_u8(a: u8, b: u8) -> bool {
        let x = Bits::from_u64(a as u64, 8);
        let y = Bits::from_u64(b as u64, 8);
        let sum = x.wrapping_add(&y);
        sum == Bits::from_u64(a.wrapping_add(b) as u64, 8)
    }
}
