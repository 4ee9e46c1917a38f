//! The 160-bit short Weierstrass curve used for the handshake.
//!
//! This is `secp160r1`'s domain, but the device family does not speak
//! standard ECDH over a named curve from a TLS cipher suite: it wire-encodes
//! points as raw `X‖Y` without the `0x04` prefix a SEC1-compliant encoder
//! would add, and the curve choice is a protocol constant rather than
//! something a peer negotiates. None of the elliptic-curve crates in the
//! dependency graph expose `secp160r1`, so the arithmetic is implemented
//! directly on top of `num-bigint`'s arbitrary-precision integers, the way
//! the reference firmware leans on `mbedtls`'s generic `mbedtls_ecp_group`
//! rather than a curve-specific implementation.

use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::{One, Zero};
use std::fmt;

/// Number of bytes in a curve coordinate or scalar.
pub const FIELD_BYTES: usize = 20;

fn hex(s: &str) -> BigUint {
    BigUint::parse_bytes(s.as_bytes(), 16).expect("static curve constant is valid hex")
}

macro_rules! curve_const {
    ($name:ident, $hex:expr) => {
        fn $name() -> BigUint {
            hex($hex)
        }
    };
}

// secp160r1 domain parameters.
curve_const!(p, "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF7FFFFFFF");
curve_const!(a, "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF7FFFFFFC");
curve_const!(b, "1C97BEFC54BD7A8B65ACF89F81D4D4ADC565FA45");
curve_const!(gx, "4A96B5688EF573284664698968C38BB913CBFC82");
curve_const!(gy, "23A628553168947D59DCC912042351377AC5FB32");
curve_const!(n, "01000000000000000001F4C8F927AED3CA752257");

/// An affine point on the curve, or the point at infinity.
#[derive(Clone, PartialEq, Eq)]
pub enum Point {
    Infinity,
    Affine { x: BigUint, y: BigUint },
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Point::Infinity => f.write_str("Point::Infinity"),
            Point::Affine { .. } => f.write_str("Point::Affine"),
        }
    }
}

/// Returned when a peer-supplied point does not satisfy the curve equation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer public key is not a valid point on the curve")]
pub struct InvalidPoint;

impl Point {
    /// The curve's base point `G`.
    pub fn generator() -> Self {
        Point::Affine { x: gx(), y: gy() }
    }

    /// Decodes a 40-byte `X‖Y` wire encoding (no `0x04` prefix) into a point,
    /// rejecting anything not on the curve.
    pub fn from_uncompressed(bytes: &[u8; FIELD_BYTES * 2]) -> Result<Self, InvalidPoint> {
        let x = BigUint::from_bytes_be(&bytes[..FIELD_BYTES]);
        let y = BigUint::from_bytes_be(&bytes[FIELD_BYTES..]);
        let point = Point::Affine { x, y };
        if point.is_on_curve() {
            Ok(point)
        } else {
            Err(InvalidPoint)
        }
    }

    /// Encodes an affine point as the 40-byte `X‖Y` wire format.
    ///
    /// Panics if called on [`Point::Infinity`]; the handshake never sends
    /// the point at infinity.
    pub fn to_uncompressed(&self) -> [u8; FIELD_BYTES * 2] {
        let (x, y) = match self {
            Point::Affine { x, y } => (x, y),
            Point::Infinity => panic!("cannot encode point at infinity"),
        };
        let mut out = [0u8; FIELD_BYTES * 2];
        write_be(x, &mut out[..FIELD_BYTES]);
        write_be(y, &mut out[FIELD_BYTES..]);
        out
    }

    fn is_on_curve(&self) -> bool {
        let (x, y) = match self {
            Point::Infinity => return true,
            Point::Affine { x, y } => (x, y),
        };
        let p = p();
        if x >= &p || y >= &p {
            return false;
        }
        let lhs = y.modpow(&BigUint::from(2u8), &p);
        let rhs = (x.modpow(&BigUint::from(3u8), &p) + &a() * x + b()).mod_floor(&p);
        lhs == rhs
    }

    /// Scalar multiplication `k * self`, via double-and-add.
    pub fn scalar_mul(&self, k: &BigUint) -> Point {
        let mut result = Point::Infinity;
        let mut addend = self.clone();
        let mut k = k.clone();
        let p = p();
        while !k.is_zero() {
            if k.is_odd() {
                result = point_add(&result, &addend, &p);
            }
            addend = point_double(&addend, &p);
            k >>= 1;
        }
        result
    }

    /// The affine X coordinate, big-endian, zero-padded to [`FIELD_BYTES`].
    ///
    /// Panics on the point at infinity; ECDH never produces it for valid
    /// peer input short of a pathological key pair, which is rejected
    /// earlier as an [`InvalidPoint`].
    pub fn x_bytes(&self) -> [u8; FIELD_BYTES] {
        match self {
            Point::Affine { x, .. } => {
                let mut out = [0u8; FIELD_BYTES];
                write_be(x, &mut out);
                out
            }
            Point::Infinity => panic!("shared point is the point at infinity"),
        }
    }
}

fn write_be(value: &BigUint, out: &mut [u8]) {
    let bytes = value.to_bytes_be();
    assert!(bytes.len() <= out.len(), "curve value overflowed field width");
    let offset = out.len() - bytes.len();
    out[offset..].copy_from_slice(&bytes);
}

fn inverse_mod(value: &BigUint, modulus: &BigUint) -> BigUint {
    // modulus is prime, so Fermat's little theorem gives the inverse directly.
    value.modpow(&(modulus - BigUint::from(2u8)), modulus)
}

fn point_add(lhs: &Point, rhs: &Point, p: &BigUint) -> Point {
    match (lhs, rhs) {
        (Point::Infinity, other) | (other, Point::Infinity) => other.clone(),
        (Point::Affine { x: x1, y: y1 }, Point::Affine { x: x2, y: y2 }) => {
            if x1 == x2 {
                if (y1 + y2).mod_floor(p).is_zero() {
                    return Point::Infinity;
                }
                return point_double(lhs, p);
            }
            let num = if y2 >= y1 { y2 - y1 } else { p - (y1 - y2).mod_floor(p) };
            let den = if x2 >= x1 { x2 - x1 } else { p - (x1 - x2).mod_floor(p) };
            let lambda = (num.mod_floor(p) * inverse_mod(&den.mod_floor(p), p)).mod_floor(p);
            let x3 = (lambda.modpow(&BigUint::from(2u8), p) + p + p - x1 - x2).mod_floor(p);
            let y3 = sub_mod(&(lambda * sub_mod(x1, &x3, p)), y1, p);
            Point::Affine { x: x3, y: y3 }
        }
    }
}

fn sub_mod(lhs: &BigUint, rhs: &BigUint, p: &BigUint) -> BigUint {
    let lhs = lhs.mod_floor(p);
    let rhs = rhs.mod_floor(p);
    if lhs >= rhs {
        lhs - rhs
    } else {
        p - (rhs - lhs)
    }
}

fn point_double(point: &Point, p: &BigUint) -> Point {
    let (x, y) = match point {
        Point::Infinity => return Point::Infinity,
        Point::Affine { x, y } => (x, y),
    };
    if y.is_zero() {
        return Point::Infinity;
    }
    let three = BigUint::from(3u8);
    let two = BigUint::from(2u8);
    let num = (three * x.modpow(&two, p) + a()).mod_floor(p);
    let den = (two * y).mod_floor(p);
    let lambda = (num * inverse_mod(&den, p)).mod_floor(p);
    let x3 = sub_mod(&sub_mod(&lambda.modpow(&BigUint::from(2u8), p), x, p), x, p);
    let y3 = sub_mod(&(lambda * sub_mod(x, &x3, p)), y, p);
    Point::Affine { x: x3, y: y3 }
}

/// The curve order `n`, exposed for key generation (`d` must be in `[1, n-1]`).
pub fn order() -> BigUint {
    n()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_is_on_curve() {
        assert!(Point::generator().is_on_curve());
    }

    #[test]
    fn doubling_generator_is_on_curve() {
        let g = Point::generator();
        let two_g = g.scalar_mul(&BigUint::from(2u8));
        assert!(two_g.is_on_curve());
        assert_ne!(two_g, g);
    }

    #[test]
    fn scalar_mul_is_associative_with_addition() {
        let g = Point::generator();
        let three_g_direct = g.scalar_mul(&BigUint::from(3u8));
        let three_g_added = point_add(&g.scalar_mul(&BigUint::from(2u8)), &g, &p());
        assert_eq!(three_g_direct, three_g_added);
    }

    #[test]
    fn round_trips_through_wire_encoding() {
        let point = Point::generator().scalar_mul(&BigUint::from(7u8));
        let encoded = point.to_uncompressed();
        let decoded = Point::from_uncompressed(&encoded).unwrap();
        assert_eq!(point, decoded);
    }

    #[test]
    fn rejects_point_not_on_curve() {
        let mut bytes = Point::generator().to_uncompressed();
        bytes[0] ^= 0xFF;
        assert!(Point::from_uncompressed(&bytes).is_err());
    }

    #[test]
    fn ecdh_is_symmetric() {
        let g = Point::generator();
        let d_a = BigUint::from(12345u32);
        let d_b = BigUint::from(67890u32);
        let q_a = g.scalar_mul(&d_a);
        let q_b = g.scalar_mul(&d_b);

        let shared_ab = q_b.scalar_mul(&d_a);
        let shared_ba = q_a.scalar_mul(&d_b);
        assert_eq!(shared_ab.x_bytes(), shared_ba.x_bytes());
    }
}
