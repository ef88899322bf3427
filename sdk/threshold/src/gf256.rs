//! GF(256) arithmetic over the AES polynomial.

const AES_POLY: u8 = 0x1b;

/// Multiplication in GF(256)
pub fn mul(mut a: u8, mut b: u8) -> u8 {
    let mut acc: u8 = 0;
    while b != 0 {
        if b & 1 != 0 {
            acc ^= a;
        }
        let carry = a & 0x80 != 0;
        a <<= 1;
        if carry {
            a ^= AES_POLY;
        }
        b >>= 1;
    }
    acc
}

/// Multiplicative inverse, `a^254` since `a^255 = 1`. Zero maps to zero.
pub fn inv(a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    // 254 = 0b1111_1110
    let mut result: u8 = 1;
    let mut base = a;
    let mut exp: u8 = 254;
    while exp != 0 {
        if exp & 1 != 0 {
            result = mul(result, base);
        }
        base = mul(base, base);
        exp >>= 1;
    }
    result
}

/// Division in GF(256)
pub fn div(a: u8, b: u8) -> u8 {
    mul(a, inv(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_round_trips() {
        for a in 1..=255u8 {
            assert_eq!(mul(a, inv(a)), 1, "a = {a}");
        }
    }

    #[test]
    fn known_product() {
        // FIPS-197 worked example: {57} * {83} = {c1}
        assert_eq!(mul(0x57, 0x83), 0xc1);
    }
}
