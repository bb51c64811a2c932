/// Index value marking an invalid handle and the free-list end.
pub(crate) const INVALID_INDEX: u32 = u32::MAX;

/// A generation-validated reference to a contract slot.
///
/// Handles are trivially copyable and stay cheap to pass around. A handle
/// is only honored while the slot's generation still matches: once the
/// contract completes or is released, the slot's generation advances and
/// every outstanding handle silently becomes invalid.
///
/// All operations go through the owning [`ContractPool`](super::ContractPool);
/// a handle presented to a different pool is rejected by its pool id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContractHandle {
    pool_id: u64,
    index: u32,
    generation: u32,
}

impl ContractHandle {
    /// The invalid sentinel handle.
    pub const INVALID: ContractHandle = ContractHandle {
        pool_id: 0,
        index: INVALID_INDEX,
        generation: 0,
    };

    pub(crate) fn new(pool_id: u64, index: u32, generation: u32) -> Self {
        Self {
            pool_id,
            index,
            generation,
        }
    }

    /// Whether this handle is something other than the invalid sentinel.
    ///
    /// This checks the sentinel only; staleness is detected by the pool.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.index != INVALID_INDEX
    }

    /// Slot index within the owning pool.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation the slot had when this handle was issued.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Identifier of the owning pool.
    #[inline]
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }
}

impl Default for ContractHandle {
    fn default() -> Self {
        Self::INVALID
    }
}
