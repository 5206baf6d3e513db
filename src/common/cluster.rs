use crate::common::config::ClusterConfig;
use arrayvec;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::convert::TryFrom;
use std::fmt;

pub const CLUSTER_NAME_MAX_LENGTH: usize = 30;

#[derive(Debug)]
pub struct InvalidClusterName;

type ClusterNameInner = arrayvec::ArrayString<[u8; CLUSTER_NAME_MAX_LENGTH]>;

// Only `[a-zA-Z0-9@_-]` with 1 to 30 characters is allowed.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterName(ClusterNameInner);

impl ClusterName {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    fn is_valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '@' || c == '-' || c == '_'
    }
}

impl TryFrom<&str> for ClusterName {
    type Error = InvalidClusterName;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.is_empty() || !s.chars().all(Self::is_valid_char) {
            return Err(InvalidClusterName);
        }
        let inner = ClusterNameInner::from(s).map_err(|_| InvalidClusterName)?;
        Ok(Self(inner))
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for ClusterName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ClusterName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ClusterName::try_from(s.as_str())
            .map_err(|err| D::Error::custom(format!("invalid cluster name {}: {:?}", s, err)))
    }
}

// Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Range(pub usize, pub usize);

impl Range {
    pub fn start(&self) -> usize {
        self.0
    }
    pub fn end(&self) -> usize {
        self.1
    }
    pub fn start_mut(&mut self) -> &mut usize {
        &mut self.0
    }
    pub fn end_mut(&mut self) -> &mut usize {
        &mut self.1
    }
    pub fn get_slots_num(&self) -> usize {
        self.1 + 1 - self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub struct RangeList(Vec<Range>);

impl RangeList {
    pub fn new(ranges: Vec<Range>) -> Self {
        Self(ranges)
    }

    pub fn from_single_range(range: Range) -> Self {
        Self(vec![range])
    }

    pub fn get_ranges(&self) -> &[Range] {
        &self.0
    }

    pub fn get_mut_ranges(&mut self) -> &mut Vec<Range> {
        &mut self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get_slots_num(&self) -> usize {
        self.0.iter().map(Range::get_slots_num).sum()
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.0
            .iter()
            .any(|range| range.start() <= slot && slot <= range.end())
    }

    // Sort the ranges and merge the adjacent ones.
    pub fn compact(&mut self) {
        self.0.sort_by_key(|range| range.start());
        let mut compacted: Vec<Range> = Vec::with_capacity(self.0.len());
        for range in self.0.drain(..) {
            match compacted.last_mut() {
                Some(last) if last.end() + 1 >= range.start() => {
                    if range.end() > last.end() {
                        *last.end_mut() = range.end();
                    }
                }
                _ => compacted.push(range),
            }
        }
        self.0 = compacted;
    }

    pub fn merge_another(&mut self, another: &mut RangeList) {
        self.0.append(&mut another.0);
        self.compact();
    }
}

impl fmt::Display for RangeList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ranges: Vec<String> = self
            .0
            .iter()
            .map(|range| format!("{}-{}", range.start(), range.end()))
            .collect();
        write!(f, "{}", ranges.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct MigrationMeta {
    pub epoch: u64, // The epoch migration starts
    pub src_proxy_address: String,
    pub src_node_address: String,
    pub dst_proxy_address: String,
    pub dst_node_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum SlotRangeTag {
    Migrating(MigrationMeta),
    Importing(MigrationMeta),
    None,
}

impl SlotRangeTag {
    pub fn get_migration_meta(&self) -> Option<&MigrationMeta> {
        match self {
            SlotRangeTag::Migrating(ref meta) => Some(meta),
            SlotRangeTag::Importing(ref meta) => Some(meta),
            SlotRangeTag::None => None,
        }
    }

    pub fn is_migrating(&self) -> bool {
        matches!(self, SlotRangeTag::Migrating(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SlotRange {
    pub range_list: RangeList,
    pub tag: SlotRangeTag,
}

impl SlotRange {
    pub fn get_range_list(&self) -> &RangeList {
        &self.range_list
    }
}

// Sent back by the server proxies or the migration workflow
// when the data of a slot range has been fully transferred.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct MigrationTaskMeta {
    pub cluster_name: ClusterName,
    pub slot_range: SlotRange,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReplPeer {
    pub node_address: String,
    pub proxy_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Role {
    Master,
    Replica,
}

impl Serialize for Role {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Role::Master => serializer.serialize_str("master"),
            Role::Replica => serializer.serialize_str("replica"),
        }
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?.to_uppercase();
        match s.as_str() {
            "MASTER" => Ok(Role::Master),
            "REPLICA" => Ok(Role::Replica),
            _ => Err(D::Error::custom(format!("invalid role {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReplMeta {
    role: Role,
    peers: Vec<ReplPeer>,
}

impl ReplMeta {
    pub fn new(role: Role, peers: Vec<ReplPeer>) -> Self {
        Self { role, peers }
    }

    pub fn get_role(&self) -> Role {
        self.role
    }

    pub fn get_peers(&self) -> &[ReplPeer] {
        &self.peers
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Node {
    address: String,
    proxy_address: String,
    cluster_name: ClusterName,
    slots: Vec<SlotRange>,
    repl: ReplMeta,
}

impl Node {
    pub fn new(
        address: String,
        proxy_address: String,
        cluster_name: ClusterName,
        slots: Vec<SlotRange>,
        repl: ReplMeta,
    ) -> Self {
        Node {
            address,
            proxy_address,
            cluster_name,
            slots,
            repl,
        }
    }
    pub fn get_address(&self) -> &str {
        &self.address
    }
    pub fn get_proxy_address(&self) -> &str {
        &self.proxy_address
    }
    pub fn get_cluster_name(&self) -> &ClusterName {
        &self.cluster_name
    }
    pub fn get_slots(&self) -> &[SlotRange] {
        &self.slots
    }
    pub fn get_role(&self) -> Role {
        self.repl.role
    }
    pub fn get_repl_meta(&self) -> &ReplMeta {
        &self.repl
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Cluster {
    name: ClusterName,
    epoch: u64,
    nodes: Vec<Node>,
    #[serde(default)]
    config: ClusterConfig,
}

impl Cluster {
    pub fn new(name: ClusterName, epoch: u64, nodes: Vec<Node>, config: ClusterConfig) -> Self {
        Self {
            name,
            epoch,
            nodes,
            config,
        }
    }
    pub fn get_name(&self) -> &ClusterName {
        &self.name
    }
    pub fn get_nodes(&self) -> &[Node] {
        &self.nodes
    }
    pub fn get_epoch(&self) -> u64 {
        self.epoch
    }
    pub fn get_config(&self) -> &ClusterConfig {
        &self.config
    }
    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }
}

// The view a server proxy fetches for itself.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Proxy {
    address: String,
    epoch: u64,
    nodes: Vec<Node>,
    free_nodes: Vec<String>,
    cluster_config: Option<ClusterConfig>,
}

impl Proxy {
    pub fn new(
        address: String,
        epoch: u64,
        nodes: Vec<Node>,
        free_nodes: Vec<String>,
        cluster_config: Option<ClusterConfig>,
    ) -> Self {
        Self {
            address,
            epoch,
            nodes,
            free_nodes,
            cluster_config,
        }
    }
    pub fn get_address(&self) -> &str {
        &self.address
    }
    pub fn get_epoch(&self) -> u64 {
        self.epoch
    }
    pub fn get_nodes(&self) -> &[Node] {
        &self.nodes
    }
    pub fn get_free_nodes(&self) -> &[String] {
        &self.free_nodes
    }
    pub fn get_cluster_config(&self) -> Option<&ClusterConfig> {
        self.cluster_config.as_ref()
    }
}
