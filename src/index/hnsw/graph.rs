//! In-memory HNSW graph
//!
//! Keys are row ids supplied by the caller. Removal leaves a tombstone that
//! keeps routing searches until its slot is reused by a later add or the graph
//! is compacted. Adds beyond `capacity()` fail; callers grow the graph with
//! `reserve` first.

use crate::config::HnswConfig;
use crate::distance::{DistanceMetric, MetricKind};
use crate::index::{LevelStats, SearchMatch, ThreadHint, VectorGraph};
use crate::storage::{ChecksumReader, ChecksumWriter};
use crate::types::{RowId, ScalarKind};
use crate::{Result, StorageError};
use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io::{Read, Write};
use tracing::trace;

/// Leading bytes of a serialized graph
pub const GRAPH_MAGIC: [u8; 4] = *b"HNSW";

/// Serialized graph format version
pub const GRAPH_FORMAT_VERSION: u32 = 1;

/// Upper bound on drawn levels
const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    key: RowId,
    vector: Vec<f32>,
    /// One neighbor list per level, `neighbors.len() == level + 1`
    neighbors: Vec<Vec<u32>>,
    deleted: bool,
}

impl Node {
    fn level(&self) -> usize {
        self.neighbors.len() - 1
    }
}

/// Candidate ordered by (distance, slot)
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    distance: f32,
    slot: u32,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

#[derive(Serialize, Deserialize)]
struct GraphHeader {
    dimensions: u64,
    metric: MetricKind,
    scalar: ScalarKind,
    config: HnswConfig,
    capacity: u64,
}

#[derive(Serialize)]
struct GraphBodyRef<'a> {
    nodes: &'a [Node],
    free_slots: &'a [u32],
    entry_point: Option<u32>,
    max_level: u64,
}

#[derive(Deserialize)]
struct GraphBody {
    nodes: Vec<Node>,
    free_slots: Vec<u32>,
    entry_point: Option<u32>,
    max_level: u64,
}

#[derive(Default)]
struct GraphState {
    nodes: Vec<Node>,
    /// Live keys only
    slots: AHashMap<RowId, u32>,
    /// Tombstoned slots available for reuse
    free_slots: Vec<u32>,
    entry_point: Option<u32>,
    max_level: usize,
}

impl GraphState {
    fn distance(&self, metric: MetricKind, query: &[f32], slot: u32) -> f32 {
        metric.distance(query, &self.nodes[slot as usize].vector)
    }

    fn neighbors(&self, slot: u32, level: usize) -> &[u32] {
        self.nodes[slot as usize]
            .neighbors
            .get(level)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Walk greedily towards `query` on one level
    fn greedy_closest(&self, metric: MetricKind, query: &[f32], entry: u32, level: usize) -> u32 {
        let mut best = Candidate { distance: self.distance(metric, query, entry), slot: entry };
        loop {
            let mut improved = false;
            for &n in self.neighbors(best.slot, level) {
                let c = Candidate { distance: self.distance(metric, query, n), slot: n };
                if c < best {
                    best = c;
                    improved = true;
                }
            }
            if !improved {
                return best.slot;
            }
        }
    }

    /// Beam search on one level, returned closest first
    fn search_layer(
        &self,
        metric: MetricKind,
        query: &[f32],
        entry_points: &[u32],
        ef: usize,
        level: usize,
    ) -> Vec<Candidate> {
        let ef = ef.max(1);
        let mut visited = AHashSet::new();
        let mut candidates = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        for &ep in entry_points {
            if visited.insert(ep) {
                let c = Candidate { distance: self.distance(metric, query, ep), slot: ep };
                candidates.push(Reverse(c));
                results.push(c);
                if results.len() > ef {
                    results.pop();
                }
            }
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if let Some(furthest) = results.peek() {
                if results.len() >= ef && current.distance > furthest.distance {
                    break;
                }
            }

            for &n in self.neighbors(current.slot, level) {
                if !visited.insert(n) {
                    continue;
                }
                let c = Candidate { distance: self.distance(metric, query, n), slot: n };
                let accept = results.len() < ef || results.peek().map_or(true, |f| c < *f);
                if accept {
                    candidates.push(Reverse(c));
                    results.push(c);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out = results.into_vec();
        out.sort();
        out
    }

    /// Base-layer beam search that routes through tombstones but only keeps
    /// live nodes, so deleted rows never crowd live ones out of the beam
    fn search_live(&self, metric: MetricKind, query: &[f32], entry: u32, ef: usize) -> Vec<Candidate> {
        let ef = ef.max(1);
        let mut visited = AHashSet::new();
        let mut candidates = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        visited.insert(entry);
        let first = Candidate { distance: self.distance(metric, query, entry), slot: entry };
        candidates.push(Reverse(first));
        if !self.nodes[entry as usize].deleted {
            results.push(first);
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if let Some(furthest) = results.peek() {
                if results.len() >= ef && current.distance > furthest.distance {
                    break;
                }
            }

            for &n in self.neighbors(current.slot, 0) {
                if !visited.insert(n) {
                    continue;
                }
                let c = Candidate { distance: self.distance(metric, query, n), slot: n };
                if results.len() < ef || results.peek().map_or(true, |f| c < *f) {
                    candidates.push(Reverse(c));
                    if !self.nodes[n as usize].deleted {
                        results.push(c);
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out = results.into_vec();
        out.sort();
        out
    }

    /// Add the back edge `from -> to`, pruning `from` to its closest `max_edges`
    fn connect(&mut self, metric: MetricKind, from: u32, to: u32, level: usize, max_edges: usize) {
        let node = &self.nodes[from as usize];
        let Some(current) = node.neighbors.get(level) else {
            return;
        };
        if current.contains(&to) {
            return;
        }

        let mut list = current.clone();
        list.push(to);
        if list.len() > max_edges {
            let base = &node.vector;
            let mut scored: Vec<Candidate> = list
                .iter()
                .map(|&s| Candidate { distance: metric.distance(base, &self.nodes[s as usize].vector), slot: s })
                .collect();
            scored.sort();
            scored.truncate(max_edges);
            list = scored.into_iter().map(|c| c.slot).collect();
        }
        self.nodes[from as usize].neighbors[level] = list;
    }

    /// Wire a freshly placed node into the graph
    fn link(&mut self, metric: MetricKind, config: &HnswConfig, slot: u32) {
        let level = self.nodes[slot as usize].level();

        let entry = match self.entry_point {
            Some(entry) => entry,
            None => {
                self.entry_point = Some(slot);
                self.max_level = level;
                return;
            }
        };
        if entry == slot && self.slots.len() == 1 {
            return;
        }

        let query = self.nodes[slot as usize].vector.clone();
        let top = self.max_level;

        let mut ep = entry;
        for l in (level + 1..=top).rev() {
            ep = self.greedy_closest(metric, &query, ep, l);
        }

        let mut entry_points = vec![ep];
        for l in (0..=level.min(top)).rev() {
            let found: Vec<Candidate> = self
                .search_layer(metric, &query, &entry_points, config.expansion_add, l)
                .into_iter()
                .filter(|c| c.slot != slot)
                .collect();

            let max_edges = if l == 0 { config.connectivity_base } else { config.connectivity };
            let selected: Vec<u32> = found.iter().take(max_edges).map(|c| c.slot).collect();
            self.nodes[slot as usize].neighbors[l] = selected.clone();
            for n in selected {
                self.connect(metric, n, slot, l, max_edges);
            }

            if !found.is_empty() {
                entry_points = found.iter().map(|c| c.slot).collect();
            }
        }

        if level > top {
            self.entry_point = Some(slot);
            self.max_level = level;
        }
    }
}

/// HNSW graph implementing [`VectorGraph`]
pub struct HnswGraph {
    dimensions: usize,
    metric: MetricKind,
    scalar: ScalarKind,
    config: HnswConfig,
    capacity: usize,
    state: RwLock<GraphState>,
    rng: Mutex<StdRng>,
}

impl HnswGraph {
    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    pub fn scalar_kind(&self) -> ScalarKind {
        self.scalar
    }

    /// Whether `key` is live in the graph
    pub fn contains(&self, key: RowId) -> bool {
        self.state.read().slots.contains_key(&key)
    }

    /// Slots held by tombstones awaiting reuse or compaction
    pub fn tombstones(&self) -> usize {
        self.state.read().free_slots.len()
    }

    fn random_level(&self) -> usize {
        let r: f64 = self.rng.lock().gen();
        let level = (-r.max(f64::MIN_POSITIVE).ln() * self.config.level_multiplier()).floor();
        (level as usize).min(MAX_LEVEL)
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(StorageError::InvalidArgument(format!(
                "expected {}-dimensional vector, got {}",
                self.dimensions,
                vector.len()
            )));
        }
        Ok(())
    }
}

impl VectorGraph for HnswGraph {
    fn make(dimensions: usize, metric: MetricKind, scalar: ScalarKind, config: &HnswConfig) -> Result<Self> {
        if dimensions == 0 {
            return Err(StorageError::Config("vector dimension must be positive".into()));
        }
        config.validate()?;
        Ok(Self {
            dimensions,
            metric,
            scalar,
            config: config.clone(),
            capacity: 0,
            state: RwLock::new(GraphState::default()),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
        })
    }

    fn reserve(&mut self, capacity: usize) -> Result<()> {
        if capacity > self.capacity {
            let state = self.state.get_mut();
            state.nodes.reserve(capacity - state.nodes.len().min(capacity));
            let live = state.slots.len();
            state.slots.reserve(capacity.saturating_sub(live));
            self.capacity = capacity;
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.state.read().slots.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn memory_usage(&self) -> usize {
        let state = self.state.read();
        let node_bytes: usize = state
            .nodes
            .iter()
            .map(|n| {
                n.vector.len() * std::mem::size_of::<f32>()
                    + n.neighbors.iter().map(|l| l.capacity() * std::mem::size_of::<u32>()).sum::<usize>()
            })
            .sum();
        node_bytes
            + self.capacity.max(state.nodes.len()) * std::mem::size_of::<Node>()
            + state.slots.capacity() * (std::mem::size_of::<RowId>() + std::mem::size_of::<u32>())
    }

    fn max_level(&self) -> usize {
        self.state.read().max_level
    }

    fn stats(&self, level: usize) -> LevelStats {
        let state = self.state.read();
        let max_edges_per_node = if level == 0 { self.config.connectivity_base } else { self.config.connectivity };
        let mut stats = LevelStats::default();
        for node in state.nodes.iter().filter(|n| n.level() >= level) {
            stats.nodes += 1;
            stats.edges += node.neighbors[level].len();
            stats.max_edges += max_edges_per_node;
        }
        stats.allocated_bytes = stats.max_edges * std::mem::size_of::<u32>();
        stats
    }

    fn metric_kind(&self) -> MetricKind {
        self.metric
    }

    fn add(&self, key: RowId, vector: &[f32], thread: ThreadHint) -> Result<()> {
        self.check_dimensions(vector)?;
        let vector: Vec<f32> = vector.iter().map(|&v| self.scalar.quantize(v)).collect();
        let drawn_level = self.random_level();

        let mut state = self.state.write();
        if state.slots.contains_key(&key) {
            return Err(StorageError::Index(format!("duplicate key {}", key)));
        }

        let slot = match state.free_slots.pop() {
            Some(slot) => {
                // A reused slot keeps its level and old edges; linking overwrites them
                let node = &mut state.nodes[slot as usize];
                node.key = key;
                node.vector = vector;
                node.deleted = false;
                slot
            }
            None => {
                if state.nodes.len() >= self.capacity {
                    return Err(StorageError::Index(format!(
                        "capacity of {} vectors exhausted",
                        self.capacity
                    )));
                }
                let slot = state.nodes.len() as u32;
                state.nodes.push(Node {
                    key,
                    vector,
                    neighbors: vec![Vec::new(); drawn_level + 1],
                    deleted: false,
                });
                slot
            }
        };

        state.slots.insert(key, slot);
        state.link(self.metric, &self.config, slot);
        trace!(key, slot, ?thread, "vector added");
        Ok(())
    }

    fn remove(&mut self, key: RowId) -> Result<bool> {
        let state = self.state.get_mut();
        match state.slots.remove(&key) {
            Some(slot) => {
                state.nodes[slot as usize].deleted = true;
                state.free_slots.push(slot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn search(&self, query: &[f32], limit: usize) -> Result<Vec<SearchMatch>> {
        self.check_dimensions(query)?;
        let state = self.state.read();
        let entry = match state.entry_point {
            Some(entry) if limit > 0 && !state.slots.is_empty() => entry,
            _ => return Ok(Vec::new()),
        };

        let mut ep = entry;
        for l in (1..=state.max_level).rev() {
            ep = state.greedy_closest(self.metric, query, ep, l);
        }

        let ef = self.config.expansion_search.max(limit);
        let mut matches: Vec<SearchMatch> = state
            .search_live(self.metric, query, ep, ef)
            .into_iter()
            .map(|c| SearchMatch { key: state.nodes[c.slot as usize].key, distance: c.distance })
            .collect();

        // Equal distances resolve to the smaller key
        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.key.cmp(&b.key)));
        matches.truncate(limit);
        Ok(matches)
    }

    fn compact(&mut self) -> Result<()> {
        let metric = self.metric;
        let config = self.config.clone();
        let state = self.state.get_mut();

        let live: Vec<Node> = state
            .nodes
            .drain(..)
            .filter(|n| !n.deleted)
            .map(|n| Node { neighbors: vec![Vec::new(); n.neighbors.len()], ..n })
            .collect();

        let mut fresh = GraphState::default();
        fresh.nodes.reserve(self.capacity.max(live.len()));
        for node in live {
            let slot = u32::try_from(fresh.nodes.len())
                .map_err(|_| StorageError::Internal("graph exceeds u32 slots".into()))?;
            fresh.slots.insert(node.key, slot);
            fresh.nodes.push(node);
            fresh.link(metric, &config, slot);
        }

        *state = fresh;
        Ok(())
    }

    fn save_to_stream(&self, out: &mut dyn Write) -> Result<()> {
        out.write_all(&GRAPH_MAGIC)?;
        out.write_all(&GRAPH_FORMAT_VERSION.to_le_bytes())?;

        let state = self.state.read();
        let header = GraphHeader {
            dimensions: self.dimensions as u64,
            metric: self.metric,
            scalar: self.scalar,
            config: self.config.clone(),
            capacity: self.capacity as u64,
        };
        let body = GraphBodyRef {
            nodes: &state.nodes,
            free_slots: &state.free_slots,
            entry_point: state.entry_point,
            max_level: state.max_level as u64,
        };

        let mut writer = ChecksumWriter::new(out);
        bincode::serialize_into(&mut writer, &header)?;
        bincode::serialize_into(&mut writer, &body)?;
        let (out, crc) = writer.finish();
        out.write_all(&crc.to_le_bytes())?;
        Ok(())
    }

    fn load_from_stream(&mut self, input: &mut dyn Read) -> Result<()> {
        let mut prefix = [0u8; 8];
        input.read_exact(&mut prefix)?;
        if prefix[..4] != GRAPH_MAGIC {
            return Err(StorageError::Corruption("graph stream has a bad magic number".into()));
        }
        let version = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
        if version != GRAPH_FORMAT_VERSION {
            return Err(StorageError::Corruption(format!("unsupported graph format version {}", version)));
        }

        let mut reader = ChecksumReader::new(input);
        let header: GraphHeader = bincode::deserialize_from(&mut reader)?;
        let body: GraphBody = bincode::deserialize_from(&mut reader)?;
        reader.verify_trailer()?;

        if header.dimensions as usize != self.dimensions {
            return Err(StorageError::Corruption(format!(
                "stored graph has {} dimensions, index expects {}",
                header.dimensions, self.dimensions
            )));
        }

        let mut slots = AHashMap::with_capacity(body.nodes.len());
        for (slot, node) in body.nodes.iter().enumerate() {
            if node.neighbors.is_empty() || node.vector.len() != self.dimensions {
                return Err(StorageError::Corruption(format!("stored graph node {} is malformed", slot)));
            }
            if node.neighbors.iter().flatten().any(|&n| n as usize >= body.nodes.len()) {
                return Err(StorageError::Corruption(format!("stored graph node {} has a dangling edge", slot)));
            }
            if !node.deleted {
                slots.insert(node.key, slot as u32);
            }
        }
        if body.entry_point.map_or(false, |e| e as usize >= body.nodes.len()) {
            return Err(StorageError::Corruption("stored graph entry point is out of range".into()));
        }

        self.metric = header.metric;
        self.scalar = header.scalar;
        self.config = header.config;
        self.capacity = (header.capacity as usize).max(body.nodes.len());
        *self.rng.get_mut() = StdRng::seed_from_u64(self.config.seed ^ body.nodes.len() as u64);
        *self.state.get_mut() = GraphState {
            nodes: body.nodes,
            slots,
            free_slots: body.free_slots,
            entry_point: body.entry_point,
            max_level: body.max_level as usize,
        };
        Ok(())
    }

    fn reset(&mut self) {
        *self.state.get_mut() = GraphState::default();
        self.capacity = 0;
    }
}
