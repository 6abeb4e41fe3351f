use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// 去重过滤器的统一接口
pub trait Filter: Send + Sync {
    /// 已经见过返回true，否则记录后返回false
    fn duplicate(&self, s: &str) -> bool;
    /// 只查询不记录
    fn has(&self, s: &str) -> bool;
}

/// 精确字符串过滤器
pub struct StringFilter {
    seen: Mutex<HashSet<String>>,
}

impl StringFilter {
    pub fn new() -> Self {
        StringFilter {
            seen: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for StringFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for StringFilter {
    fn duplicate(&self, s: &str) -> bool {
        !self.seen.lock().unwrap().insert(s.to_string())
    }

    fn has(&self, s: &str) -> bool {
        self.seen.lock().unwrap().contains(s)
    }
}

/// 固定容量的布隆过滤器
///
/// 双哈希模拟k个哈希函数，位数组按容量与1%误判率取尺寸。
/// 只增不减，容量超限后由持有者整体重建。
pub struct BloomFilter {
    bits: Mutex<Vec<u64>>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// capacity为预期插入条数
    pub fn new(capacity: u64) -> Self {
        // m = -n*ln(p)/(ln2)^2, p=0.01 时约等于 9.6n
        let num_bits = (capacity.saturating_mul(10)).max(64);
        let words = ((num_bits + 63) / 64) as usize;
        BloomFilter {
            bits: Mutex::new(vec![0u64; words]),
            num_bits,
            num_hashes: 7,
        }
    }

    fn hash_pair(s: &str) -> (u64, u64) {
        let mut h1 = DefaultHasher::new();
        s.hash(&mut h1);
        let a = h1.finish();
        let mut h2 = DefaultHasher::new();
        a.hash(&mut h2);
        s.hash(&mut h2);
        (a, h2.finish() | 1)
    }

    fn positions(&self, s: &str) -> Vec<u64> {
        let (a, b) = Self::hash_pair(s);
        (0..self.num_hashes)
            .map(|i| a.wrapping_add((i as u64).wrapping_mul(b)) % self.num_bits)
            .collect()
    }

    pub fn insert(&self, s: &str) {
        let mut bits = self.bits.lock().unwrap();
        for pos in self.positions(s) {
            bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
    }
}

impl Filter for BloomFilter {
    fn duplicate(&self, s: &str) -> bool {
        let positions = self.positions(s);
        let mut bits = self.bits.lock().unwrap();
        let mut present = true;
        for pos in &positions {
            if bits[(pos / 64) as usize] & (1 << (pos % 64)) == 0 {
                present = false;
            }
        }
        if !present {
            for pos in &positions {
                bits[(pos / 64) as usize] |= 1 << (pos % 64);
            }
        }
        present
    }

    fn has(&self, s: &str) -> bool {
        let bits = self.bits.lock().unwrap();
        self.positions(s)
            .iter()
            .all(|pos| bits[(pos / 64) as usize] & (1 << (pos % 64)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_filter_dedups() {
        let f = StringFilter::new();
        assert!(!f.duplicate("a.example.com"));
        assert!(f.duplicate("a.example.com"));
        assert!(!f.duplicate("b.example.com"));
        assert!(f.has("a.example.com"));
        assert!(!f.has("c.example.com"));
    }

    #[test]
    fn bloom_filter_dedups() {
        let f = BloomFilter::new(1 << 16);
        assert!(!f.duplicate("x.example.com"));
        assert!(f.duplicate("x.example.com"));
        assert!(f.has("x.example.com"));
    }

    #[test]
    fn bloom_filter_no_false_positives_small_set() {
        let f = BloomFilter::new(1 << 16);
        for i in 0..1000 {
            assert!(!f.duplicate(&format!("host{}.example.com", i)));
        }
        let mut fp = 0;
        for i in 1000..2000 {
            if f.has(&format!("host{}.example.com", i)) {
                fp += 1;
            }
        }
        // 1%误判率下1000条查询不应超过几十条
        assert!(fp < 50, "too many false positives: {}", fp);
    }
}
