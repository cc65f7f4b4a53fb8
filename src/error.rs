use crate::object::ObjectId;

/// Errors surfaced to the mutator.
///
/// Conditions the collector recovers from on its own (remembered-set
/// overflow, pause deadline misses) are reported as
/// [`CycleEvent`](crate::statistics::CycleEvent)s on the cycle record
/// instead of `Err` values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GcError {
    /// No space for the requested allocation even after a collection cycle
    /// has run. Fatal to the requesting allocation, recoverable at the
    /// process level.
    #[error("allocation of {requested} bytes failed, {available} bytes free after collection")]
    AllocationFailure { requested: usize, available: usize },
    /// The object table, forwarding table or region bookkeeping violated a
    /// collector invariant. Implies memory-safety compromise rather than a
    /// resource limit, so it is never recovered from.
    #[error("corrupt object graph: {0}")]
    CorruptGraph(&'static str),
    /// An identity that was never issued, or whose slot has already been
    /// reclaimed.
    #[error("unknown object {0}")]
    UnknownObject(ObjectId),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = std::result::Result<T, GcError>;
