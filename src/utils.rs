use crate::types::NodeId;

/// [Szudzik pairing function][szudzik-pairing].
///
/// ```text
/// (a, b) -> if (a<b) then (b^2 + a) else (a^2 + a + b)
/// ```
///
/// [szudzik-pairing]: http://szudzik.com/ElegantPairing.pdf
pub fn pairing_szudzik(a: u64, b: u64) -> u64 {
    if a < b {
        // b * b + a
        b.wrapping_mul(b).wrapping_add(a)
    } else {
        // a * a + a + b
        a.wrapping_mul(a).wrapping_add(a).wrapping_add(b)
    }
}

/// [Pairing function][pairing] for two `u64` values.
///
/// [pairing]: https://en.wikipedia.org/wiki/Pairing_function
pub fn pairing2(a: u64, b: u64) -> u64 {
    pairing_szudzik(a, b)
}

/// Pairing function for three `u64` values.
pub fn pairing3(a: u64, b: u64, c: u64) -> u64 {
    pairing2(pairing2(a, b), c)
}

/// Incremental Jenkins-style hash state, used to hash node records.
///
/// Nodes are hashed by streaming the level followed by the
/// (index, child, edge-value) triple of every non-transparent entry, so a
/// full and a sparse encoding of the same node produce the same hash.
#[derive(Debug, Clone, Copy)]
pub struct NodeHasher {
    a: u64,
    b: u64,
    c: u64,
}

impl NodeHasher {
    pub fn new(seed: u64) -> Self {
        // Golden-ratio constant, as in the classic lookup2 initializer.
        NodeHasher {
            a: 0x9e37_79b9_7f4a_7c15,
            b: 0x9e37_79b9_7f4a_7c15,
            c: seed,
        }
    }

    #[inline]
    fn mix(&mut self) {
        let (mut a, mut b, mut c) = (self.a, self.b, self.c);
        a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 43);
        b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 9);
        c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 8);
        a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 38);
        b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 23);
        c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 5);
        self.a = a;
        self.b = b;
        self.c = c;
    }

    #[inline]
    pub fn push(&mut self, word: u64) {
        self.a = self.a.wrapping_add(word);
        self.mix();
    }

    #[inline]
    pub fn push2(&mut self, x: u64, y: u64) {
        self.a = self.a.wrapping_add(x);
        self.b = self.b.wrapping_add(y);
        self.mix();
    }

    #[inline]
    pub fn finish(self) -> u64 {
        self.c
    }
}

pub trait MyHash {
    fn hash(&self) -> u64;
}

impl MyHash for u64 {
    fn hash(&self) -> u64 {
        *self
    }
}

impl MyHash for (u64, u64) {
    fn hash(&self) -> u64 {
        pairing2(self.0, self.1)
    }
}

impl MyHash for (u64, u64, u64) {
    fn hash(&self) -> u64 {
        pairing3(self.0, self.1, self.2)
    }
}

impl MyHash for NodeId {
    fn hash(&self) -> u64 {
        self.raw() as u64
    }
}

impl MyHash for (NodeId, NodeId) {
    fn hash(&self) -> u64 {
        pairing2(self.0.raw() as u64, self.1.raw() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_szudzik() {
        // a\b  0  1  2  3  4
        // ------------------
        // 0    0  1  4  9 16
        // 1    2  3  5 10 17
        // 2    6  7  8 11 18
        // 3   12 13 14 15 19
        // 4   20 21 22 23 24
        assert_eq!(pairing_szudzik(0, 0), 0);
        assert_eq!(pairing_szudzik(0, 1), 1);
        assert_eq!(pairing_szudzik(1, 0), 2);
        assert_eq!(pairing_szudzik(1, 1), 3);
        assert_eq!(pairing_szudzik(0, 2), 4);
        assert_eq!(pairing_szudzik(1, 2), 5);
        assert_eq!(pairing_szudzik(2, 0), 6);
        assert_eq!(pairing_szudzik(2, 1), 7);
        assert_eq!(pairing_szudzik(2, 2), 8);
        assert_eq!(pairing_szudzik(0, 4), 16);
        assert_eq!(pairing_szudzik(4, 0), 20);
        assert_eq!(pairing_szudzik(4, 4), 24);
    }

    #[test]
    fn test_node_hasher_order_sensitive() {
        let mut h1 = NodeHasher::new(3);
        h1.push2(0, 17);
        h1.push2(1, 42);
        let mut h2 = NodeHasher::new(3);
        h2.push2(1, 42);
        h2.push2(0, 17);
        assert_ne!(h1.finish(), h2.finish());
    }

    #[test]
    fn test_node_hasher_seed_sensitive() {
        let mut h1 = NodeHasher::new(1);
        h1.push(99);
        let mut h2 = NodeHasher::new(2);
        h2.push(99);
        assert_ne!(h1.finish(), h2.finish());
    }
}
