// Per-room record cache: recent records per topic, bounded by resident
// bytes, evicting least-recently-used topics whole. An optional bloom
// filter short-circuits lookups for topics that were never cached.
use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use petrel_common::hash::murmur2_64;
use petrel_common::{MsgId, SequenceNumber};

#[derive(Debug, Clone)]
pub struct CachedRecord {
    pub seqno: SequenceNumber,
    pub msg_id: MsgId,
    pub payload: Bytes,
}

struct TopicCache {
    records: VecDeque<CachedRecord>,
    bytes: usize,
    last_use: u64,
}

/// Double-hashed bloom filter over topic keys. Only ever produces false
/// positives, so a miss is a definitive "never cached".
struct TopicBloom {
    bits: Vec<u64>,
    num_hashes: u32,
}

impl TopicBloom {
    fn new(num_bits: usize, num_hashes: u32) -> Self {
        TopicBloom {
            bits: vec![0; (num_bits / 64).max(1)],
            num_hashes: num_hashes.max(1),
        }
    }

    fn index(&self, key: &[u8], round: u32) -> (usize, u64) {
        let h1 = murmur2_64(key, 0xb10f);
        let h2 = murmur2_64(key, 0x5eed_cafe) | 1;
        let combined = h1.wrapping_add((round as u64).wrapping_mul(h2));
        let bit = combined % (self.bits.len() as u64 * 64);
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }

    fn insert(&mut self, key: &[u8]) {
        for round in 0..self.num_hashes {
            let (word, mask) = self.index(key, round);
            self.bits[word] |= mask;
        }
    }

    fn maybe_contains(&self, key: &[u8]) -> bool {
        (0..self.num_hashes).all(|round| {
            let (word, mask) = self.index(key, round);
            self.bits[word] & mask != 0
        })
    }

    fn clear(&mut self) {
        self.bits.fill(0);
    }
}

pub struct RecordCache {
    topics: HashMap<(String, String), TopicCache>,
    bloom: Option<TopicBloom>,
    bytes_used: usize,
    capacity_bytes: usize,
    use_counter: u64,
}

impl RecordCache {
    /// `bloom_bits` of zero disables the filter.
    pub fn new(capacity_bytes: usize, bloom_bits: usize) -> Self {
        RecordCache {
            topics: HashMap::new(),
            bloom: (bloom_bits > 0).then(|| TopicBloom::new(bloom_bits, 4)),
            bytes_used: 0,
            capacity_bytes,
            use_counter: 0,
        }
    }

    pub fn insert(
        &mut self,
        namespace: &str,
        topic: &str,
        seqno: SequenceNumber,
        msg_id: MsgId,
        payload: Bytes,
    ) {
        if self.capacity_bytes == 0 {
            return;
        }
        self.use_counter += 1;
        let use_counter = self.use_counter;
        if let Some(bloom) = &mut self.bloom {
            bloom.insert(topic_key_bytes(namespace, topic).as_slice());
        }
        let entry = self
            .topics
            .entry((namespace.to_string(), topic.to_string()))
            .or_insert_with(|| TopicCache {
                records: VecDeque::new(),
                bytes: 0,
                last_use: use_counter,
            });
        entry.last_use = use_counter;
        entry.bytes += payload.len();
        self.bytes_used += payload.len();
        entry.records.push_back(CachedRecord {
            seqno,
            msg_id,
            payload,
        });
        self.evict_to_capacity();
    }

    /// Contiguous cached records for a topic starting at `from`. Returns
    /// nothing when `from` predates the cached range, since a partial
    /// replay would hide a gap.
    pub fn lookup(&mut self, namespace: &str, topic: &str, from: SequenceNumber) -> Vec<CachedRecord> {
        if let Some(bloom) = &self.bloom {
            if !bloom.maybe_contains(topic_key_bytes(namespace, topic).as_slice()) {
                return Vec::new();
            }
        }
        self.use_counter += 1;
        let use_counter = self.use_counter;
        let Some(entry) = self
            .topics
            .get_mut(&(namespace.to_string(), topic.to_string()))
        else {
            return Vec::new();
        };
        entry.last_use = use_counter;
        let Some(first) = entry.records.front() else {
            return Vec::new();
        };
        if from < first.seqno {
            return Vec::new();
        }
        entry
            .records
            .iter()
            .filter(|record| record.seqno >= from)
            .cloned()
            .collect()
    }

    pub fn usage_bytes(&self) -> usize {
        self.bytes_used
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn set_capacity(&mut self, capacity_bytes: usize) {
        self.capacity_bytes = capacity_bytes;
        self.evict_to_capacity();
    }

    pub fn clear(&mut self) {
        self.topics.clear();
        self.bytes_used = 0;
        if let Some(bloom) = &mut self.bloom {
            bloom.clear();
        }
    }

    fn evict_to_capacity(&mut self) {
        while self.bytes_used > self.capacity_bytes && !self.topics.is_empty() {
            let coldest = self
                .topics
                .iter()
                .min_by_key(|(_, entry)| entry.last_use)
                .map(|(key, _)| key.clone())
                .expect("nonempty cache");
            if let Some(evicted) = self.topics.remove(&coldest) {
                self.bytes_used -= evicted.bytes;
            }
        }
        // The bloom filter intentionally keeps stale topics; it only exists
        // to rule out topics never seen, and clears wholesale.
    }
}

fn topic_key_bytes(namespace: &str, topic: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(namespace.len() + topic.len() + 1);
    key.extend_from_slice(namespace.as_bytes());
    key.push(0);
    key.extend_from_slice(topic.as_bytes());
    key
}
