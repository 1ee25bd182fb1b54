use crate::hash::CryptoHash;

/// A coordinate on the circular [0,1) keyspace. Both peers and keys map onto
/// this circle; requests are routed greedily toward the key's location.
#[derive(Clone, Copy, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct Location(f64);

impl Location {
    /// Wraps an arbitrary real number onto [0,1).
    pub fn normalize(x: f64) -> Location {
        let mut v = x.rem_euclid(1.0);
        // rem_euclid(1.0) of values like -1e-17 yields exactly 1.0.
        if v >= 1.0 {
            v = 0.0;
        }
        Location(v)
    }

    /// Deterministic hash-to-double mapping: big-endian first 8 bytes of the
    /// routing hash, scaled by 2^-64.
    pub fn from_hash(hash: &CryptoHash) -> Location {
        Location(hash.prefix_u64() as f64 / 2.0f64.powi(64))
    }

    pub fn as_f64(&self) -> f64 {
        self.0
    }

    /// Circular distance: `min(|a-b|, 1-|a-b|)`, at most 0.5.
    pub fn distance(&self, other: Location) -> f64 {
        let d = (self.0 - other.0).abs();
        d.min(1.0 - d)
    }

    /// Which of `a`, `b` is closer to `self`? `Less` means `a` is strictly
    /// closer. Exact ties are `Equal`; the caller breaks them (peer selection
    /// uses the numerically smaller peer id).
    pub fn closer_to(&self, a: Location, b: Location) -> std::cmp::Ordering {
        self.distance(a).partial_cmp(&self.distance(b)).unwrap_or(std::cmp::Ordering::Equal)
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

// Locations travel on the wire as raw f64 bits.
impl borsh::BorshSerialize for Location {
    fn serialize<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.to_bits().serialize(writer)
    }
}

impl borsh::BorshDeserialize for Location {
    fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        let bits = u64::deserialize_reader(reader)?;
        Ok(Location::normalize(f64::from_bits(bits)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_wraps_onto_circle() {
        assert_eq!(Location::normalize(1.25).as_f64(), 0.25);
        assert_eq!(Location::normalize(-0.25).as_f64(), 0.75);
        assert_eq!(Location::normalize(0.0).as_f64(), 0.0);
        let l = Location::normalize(-1e-17);
        assert!(l.as_f64() >= 0.0 && l.as_f64() < 1.0);
    }

    #[test]
    fn distance_is_circular() {
        let a = Location::normalize(0.9);
        let b = Location::normalize(0.1);
        assert!((a.distance(b) - 0.2).abs() < 1e-12);
        // Symmetric.
        assert_eq!(a.distance(b), b.distance(a));
        // Never exceeds half the circle.
        assert!(Location::normalize(0.0).distance(Location::normalize(0.5)) <= 0.5);
    }

    #[test]
    fn closer_to_orders_by_distance() {
        let target = Location::normalize(0.12);
        let near = Location::normalize(0.1);
        let far = Location::normalize(0.9);
        assert_eq!(target.closer_to(near, far), std::cmp::Ordering::Less);
        assert_eq!(target.closer_to(far, near), std::cmp::Ordering::Greater);
        assert_eq!(target.closer_to(near, near), std::cmp::Ordering::Equal);
    }

    #[test]
    fn from_hash_lands_in_unit_interval() {
        for i in 0..64u8 {
            let l = Location::from_hash(&CryptoHash::hash(&[i]));
            assert!(l.as_f64() >= 0.0 && l.as_f64() < 1.0);
        }
    }
}
