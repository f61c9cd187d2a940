//! Depth-first traversal of the chain index

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use tracing::debug;

use super::resolver::RecordResolver;
use crate::error::{IndexError, IndexResult};
use crate::index::{DropMarker, Frontier, IndexNode, IndexRecord, LeafNode};
use crate::locator::Locator;
use crate::traits::{BlockRef, RecordId};

/// One chunk reproduced from the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedChunk {
    pub channel: String,
    pub timestamp: Option<DateTime<Utc>>,

    /// Stream offset of the first byte; auxiliary channels have none
    pub offset: Option<u64>,
    pub record: RecordId,
    pub data: Bytes,
}

/// Recorded hole in a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGap {
    pub channel: String,

    /// Primary stream offset at which the gap was noted
    pub offset: u64,
    pub dropped: Option<DropMarker>,
    pub failure: Option<String>,
}

/// Item produced by the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeItem {
    Chunk(DecodedChunk),
    Gap(ChannelGap),
}

struct Frame {
    nodes: Vec<IndexNode>,
    cursor: usize,
    start: u64,
    size: u64,
    position: u64,
    origin: String,
}

impl Frame {
    fn new(nodes: Vec<IndexNode>, start: u64, size: u64, origin: String) -> Self {
        Self {
            nodes,
            cursor: 0,
            start,
            size,
            position: start,
            origin,
        }
    }
}

enum Pending {
    Chunk {
        channel: String,
        record: RecordId,
        timestamp: Option<DateTime<Utc>>,
        min_block: BlockRef,
    },
    Gap(ChannelGap),
}

/// Size bookkeeping for the leaf currently being emitted
struct LeafCheck {
    offset: u64,
    declared: BTreeMap<String, u64>,
    actual: HashMap<String, u64>,
}

/// Lazy, ordered reader of a capture
pub struct Decoder {
    resolver: RecordResolver,
    primary: String,
    stack: Vec<Frame>,
    pending: VecDeque<Pending>,
    leaf: Option<LeafCheck>,
    offset: u64,
    total: u64,
    visited: HashSet<RecordId>,
    finished: bool,
}

impl Decoder {
    /// Start from the snapshot a locator points at
    pub async fn from_locator(
        mut resolver: RecordResolver,
        locator: &Locator,
        primary: impl Into<String>,
    ) -> IndexResult<Self> {
        let head = locator
            .head()
            .ok_or_else(|| IndexError::Invariant("locator names no index record".into()))?
            .clone();

        let data = resolver.fetch(&head, &locator.min_block).await?;
        if !locator.verify(&data) {
            return Err(IndexError::MalformedRecord {
                id: head,
                reason: "payload does not match locator digest".into(),
            });
        }
        let record = IndexRecord::from_bytes(&head, &data)?;
        let frontier = Frontier::from_nodes(record.nodes)?;

        let mut decoder = Self::from_frontier(resolver, frontier, primary);
        decoder.visited.insert(head);
        Ok(decoder)
    }

    /// Start from an in-memory frontier
    pub fn from_frontier(
        resolver: RecordResolver,
        frontier: Frontier,
        primary: impl Into<String>,
    ) -> Self {
        let total = frontier.size();
        let root = Frame::new(frontier.nodes().to_vec(), 0, total, "root".to_string());

        Self {
            resolver,
            primary: primary.into(),
            stack: vec![root],
            pending: VecDeque::new(),
            leaf: None,
            offset: 0,
            total,
            visited: HashSet::new(),
            finished: false,
        }
    }

    /// Primary bytes the traversal will produce
    pub fn total_size(&self) -> u64 {
        self.total
    }

    /// Primary bytes produced so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn resolver(&self) -> &RecordResolver {
        &self.resolver
    }

    /// Next item in capture order, or `None` once the index is exhausted
    pub async fn next(&mut self) -> IndexResult<Option<DecodeItem>> {
        if self.finished {
            return Ok(None);
        }
        match self.advance().await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    async fn advance(&mut self) -> IndexResult<Option<DecodeItem>> {
        loop {
            if let Some(pending) = self.pending.pop_front() {
                return self.emit(pending).await.map(Some);
            }

            if let Some(check) = self.leaf.take() {
                check.verify()?;
            }

            let Some(frame) = self.stack.last_mut() else {
                if self.offset != self.total {
                    return Err(IndexError::ExtentMismatch {
                        origin: "root".into(),
                        start: 0,
                        size: self.total,
                        actual: self.offset,
                    });
                }
                return Ok(None);
            };

            if frame.cursor == frame.nodes.len() {
                let end = frame.start + frame.size;
                if self.offset != end {
                    return Err(IndexError::ExtentMismatch {
                        origin: frame.origin.clone(),
                        start: frame.start,
                        size: frame.size,
                        actual: self.offset,
                    });
                }
                self.stack.pop();
                continue;
            }

            if frame.position != self.offset {
                return Err(IndexError::OffsetMismatch {
                    position: frame.position,
                    offset: self.offset,
                });
            }

            let child = frame.nodes[frame.cursor].clone();
            frame.cursor += 1;
            frame.position += child.size();

            match child {
                IndexNode::Internal(node) => {
                    self.visit(&node.reference)?;
                    let data = self.resolver.fetch(&node.reference, &node.min_block).await?;
                    let record = IndexRecord::from_bytes(&node.reference, &data)?;

                    let weight: u64 = record.nodes.iter().map(IndexNode::weight).sum();
                    if weight != node.weight {
                        return Err(IndexError::Invariant(format!(
                            "segment {} declares weight {} but children sum to {weight}",
                            node.reference, node.weight
                        )));
                    }

                    debug!(reference = %node.reference, children = record.nodes.len(), "Descending into segment");
                    self.stack.push(Frame::new(
                        record.nodes,
                        self.offset,
                        node.size,
                        node.reference.to_string(),
                    ));
                }
                IndexNode::Leaf(leaf) => self.enter_leaf(leaf)?,
            }
        }
    }

    fn enter_leaf(&mut self, leaf: LeafNode) -> IndexResult<()> {
        let mut declared = BTreeMap::new();
        let mut lanes: Vec<(String, VecDeque<(Option<DateTime<Utc>>, RecordId)>)> = Vec::new();

        for (channel, entry) in leaf.channels {
            if entry.records.len() != entry.times.len() && !entry.times.is_empty() {
                return Err(IndexError::Invariant(format!(
                    "channel {channel} lists {} records but {} timestamps",
                    entry.records.len(),
                    entry.times.len()
                )));
            }

            if entry.dropped.is_some() || entry.failure.is_some() {
                self.pending.push_back(Pending::Gap(ChannelGap {
                    channel: channel.clone(),
                    offset: self.offset,
                    dropped: entry.dropped.clone(),
                    failure: entry.failure.clone(),
                }));
            }

            let mut lane = VecDeque::with_capacity(entry.records.len());
            for (i, record) in entry.records.iter().enumerate() {
                self.visit(record)?;
                lane.push_back((entry.times.get(i).copied(), record.clone()));
            }
            declared.insert(channel.clone(), entry.length);
            lanes.push((channel, lane));
        }

        // Records keep their stored order within a channel; channels are
        // interleaved by the capture time at the head of each lane
        while let Some(next) = earliest_lane(&lanes) {
            let (channel, lane) = &mut lanes[next];
            if let Some((timestamp, record)) = lane.pop_front() {
                self.pending.push_back(Pending::Chunk {
                    channel: channel.clone(),
                    record,
                    timestamp,
                    min_block: leaf.min_block.clone(),
                });
            }
        }

        let primary_declared = declared.get(&self.primary).copied().unwrap_or(0);
        if primary_declared != leaf.size {
            return Err(IndexError::ChannelSizeMismatch {
                offset: self.offset,
                declared: leaf.size,
                actual: primary_declared,
            });
        }

        self.leaf = Some(LeafCheck {
            offset: self.offset,
            declared,
            actual: HashMap::new(),
        });
        Ok(())
    }

    async fn emit(&mut self, pending: Pending) -> IndexResult<DecodeItem> {
        match pending {
            Pending::Gap(gap) => Ok(DecodeItem::Gap(gap)),
            Pending::Chunk {
                channel,
                record,
                timestamp,
                min_block,
            } => {
                let data = self.resolver.fetch(&record, &min_block).await?;
                let len = data.len() as u64;

                if let Some(check) = self.leaf.as_mut() {
                    *check.actual.entry(channel.clone()).or_insert(0) += len;
                }

                let offset = if channel == self.primary {
                    let at = self.offset;
                    self.offset += len;
                    Some(at)
                } else {
                    None
                };

                Ok(DecodeItem::Chunk(DecodedChunk {
                    channel,
                    timestamp,
                    offset,
                    record,
                    data,
                }))
            }
        }
    }

    fn visit(&mut self, id: &RecordId) -> IndexResult<()> {
        if !self.visited.insert(id.clone()) {
            return Err(IndexError::DuplicateVisit {
                id: id.clone(),
                offset: self.offset,
            });
        }
        Ok(())
    }

    /// Stream of decoded items; ends after the first error
    pub fn into_stream(self) -> impl Stream<Item = IndexResult<DecodeItem>> {
        futures::stream::unfold(self, |mut decoder| async move {
            match decoder.next().await {
                Ok(Some(item)) => Some((Ok(item), decoder)),
                Ok(None) => None,
                Err(e) => Some((Err(e), decoder)),
            }
        })
    }

    /// Decode everything, concatenating each channel's bytes
    pub async fn collect_channels(mut self) -> IndexResult<BTreeMap<String, Vec<u8>>> {
        let mut channels: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        while let Some(item) = self.next().await? {
            if let DecodeItem::Chunk(chunk) = item {
                channels
                    .entry(chunk.channel)
                    .or_default()
                    .extend_from_slice(&chunk.data);
            }
        }
        Ok(channels)
    }
}

/// Lane whose head was captured first; ties go to the earlier channel
fn earliest_lane(lanes: &[(String, VecDeque<(Option<DateTime<Utc>>, RecordId)>)]) -> Option<usize> {
    let mut best: Option<(usize, Option<DateTime<Utc>>)> = None;
    for (i, (_, lane)) in lanes.iter().enumerate() {
        let Some((time, _)) = lane.front() else {
            continue;
        };
        if best.map_or(true, |(_, t)| *time < t) {
            best = Some((i, *time));
        }
    }
    best.map(|(i, _)| i)
}

impl LeafCheck {
    fn verify(self) -> IndexResult<()> {
        for (channel, declared) in &self.declared {
            let actual = self.actual.get(channel).copied().unwrap_or(0);
            if actual != *declared {
                return Err(IndexError::ChannelSizeMismatch {
                    offset: self.offset,
                    declared: *declared,
                    actual,
                });
            }
        }
        Ok(())
    }
}
