//! Cluster topology collaborator
//!
//! The durability engine does not own cluster membership. It asks the
//! topology layer for the version to stamp on each checkpoint, and whether
//! a cache operation is allowed on the current topology.

/// Identifies the cache and partition an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheContext<'a> {
    pub cache_name: &'a str,
    pub partition: u32,
}

/// Validation hooks supplied by the cluster layer
pub trait TopologyValidator: Send + Sync {
    /// Current topology version, recorded when a checkpoint starts
    fn topology_version(&self) -> u64;

    /// Check whether an operation may proceed
    ///
    /// Returns `None` when valid, or a human-readable reason otherwise.
    /// `recovery` is set while the node replays its WAL, `read` for read
    /// operations. `key` is the single key touched, `keys` the batch.
    fn validate_cache(
        &self,
        ctx: &CacheContext<'_>,
        recovery: bool,
        read: bool,
        key: Option<&[u8]>,
        keys: &[&[u8]],
    ) -> Option<String>;
}

/// Standalone node: version 0, everything valid
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTopology;

impl TopologyValidator for NoopTopology {
    fn topology_version(&self) -> u64 {
        0
    }

    fn validate_cache(
        &self,
        _ctx: &CacheContext<'_>,
        _recovery: bool,
        _read: bool,
        _key: Option<&[u8]>,
        _keys: &[&[u8]],
    ) -> Option<String> {
        None
    }
}
