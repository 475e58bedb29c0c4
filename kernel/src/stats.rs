//! Kernel statistics counters

/// Event counters maintained by the translation paths
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KernStats {
    /// Calls to `walk_seg`
    pub n_walk_seg: u64,
    /// Tree levels descended by `walk_seg`
    pub n_walk_loop: u64,
    /// Window keys followed
    pub n_window: u64,
    /// User page-fault traps
    pub n_pf_traps: u64,
    /// User page-fault traps for writes
    pub n_pf_access: u64,
    /// Keys prepared
    pub n_key_prep: u64,
    /// Dependency entries allocated
    pub n_depend: u64,
    /// Dependency entries merged into an existing range
    pub n_dep_merge: u64,
    /// Dependency entries invalidated
    pub n_dep_inval: u64,
    /// Slot invalidations that zapped at least one entry
    pub n_dep_zap: u64,
    /// Mapping tables created
    pub n_products: u64,
    /// Segment keeper invocations
    pub n_keeper_calls: u64,
    /// Faults delivered to a process keeper
    pub n_process_faults: u64,
}
