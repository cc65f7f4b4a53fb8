//! Relocation machinery shared by compaction, promotion and evacuation.
//!
//! Relocating a record issues a fresh identity and publishes an explicit
//! old→new entry in the [`ForwardingTable`]; readers resolve through the
//! table until reference fixup rewrites the graph's edges directly. In-place
//! pointer overwrites never happen.

use hashbrown::HashMap;

use crate::error::{GcError, Result};
use crate::generation::Generation;
use crate::object::{ObjectId, ObjectTable, GC_WHITE};
use crate::space::RegionSpace;

/// Explicit old-identity → new-identity indirection.
///
/// Entries persist across cycles (external root sets may hold arbitrarily old
/// identities) and are path-compressed at every cycle start so lookups stay
/// one hop in steady state.
pub struct ForwardingTable {
    map: HashMap<ObjectId, ObjectId>,
}

impl ForwardingTable {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, old: ObjectId, new: ObjectId) {
        self.map.insert(old, new);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Follows forwarding entries to the final identity. A chain longer than
    /// the table means the table contains a cycle, which only an overwritten
    /// slot can produce.
    pub(crate) fn resolve(&self, id: ObjectId) -> Result<ObjectId> {
        let mut current = id;
        let mut hops = 0usize;
        while let Some(&next) = self.map.get(&current) {
            current = next;
            hops += 1;
            if hops > self.map.len() {
                return Err(GcError::CorruptGraph("forwarding cycle"));
            }
        }
        Ok(current)
    }

    /// Rewrites every entry to point at its final identity.
    pub(crate) fn compress(&mut self) -> Result<()> {
        let keys: Vec<ObjectId> = self.map.keys().copied().collect();
        for key in keys {
            let target = self.resolve(key)?;
            self.map.insert(key, target);
        }
        Ok(())
    }
}

/// One planned relocation: where the record goes and the age it carries
/// there.
pub(crate) struct Move {
    pub old: ObjectId,
    pub dest: Option<Generation>,
    pub new_age: u8,
}

pub(crate) struct RelocationOutcome {
    pub moved_bytes: usize,
    pub promoted_bytes: usize,
    /// New identities in move order.
    pub relocated: Vec<ObjectId>,
}

/// Executes planned moves: pulls each record out of the table, re-places it
/// in the destination space and publishes the forwarding entry.
///
/// Source placements must already have been released by the caller (regions
/// being evacuated are reset wholesale); this function only allocates
/// destinations.
pub(crate) fn evacuate(
    table: &mut ObjectTable,
    space: &mut RegionSpace,
    forwarding: &mut ForwardingTable,
    moves: &[Move],
) -> Result<RelocationOutcome> {
    let mut outcome = RelocationOutcome {
        moved_bytes: 0,
        promoted_bytes: 0,
        relocated: Vec::with_capacity(moves.len()),
    };
    for mv in moves {
        let mut record = table
            .remove(mv.old)
            .ok_or(GcError::CorruptGraph("relocation source missing from table"))?;
        let requested = record.size;
        let (region, offset) = space.allocate(mv.dest, requested).ok_or_else(|| {
            // relocation target space exhausted: an out-of-memory condition,
            // not a graph invariant violation
            GcError::AllocationFailure {
                requested,
                available: space.free_bytes(),
            }
        })?;
        let promoted =
            record.generation == Some(Generation::Young) && mv.dest == Some(Generation::Old);
        if promoted {
            outcome.promoted_bytes += record.size;
        }
        outcome.moved_bytes += record.size;
        record.generation = mv.dest;
        record.region = region;
        record.offset = offset;
        record.age = mv.new_age;
        record.force_color(GC_WHITE);
        let new = table.insert(record);
        space.note_member(region, new);
        forwarding.insert(mv.old, new);
        outcome.relocated.push(new);
    }
    Ok(outcome)
}

/// A relocation whose destination was computed by a compaction worker inside
/// its pre-reserved region range.
pub(crate) struct Placement {
    pub old: ObjectId,
    pub region: usize,
    pub offset: usize,
    pub dest: Option<Generation>,
    pub new_age: u8,
}

/// Applies worker-computed placements. The space is only told about the
/// chosen offsets; reservation already happened when the destination regions
/// were handed to the workers.
pub(crate) fn apply_placements(
    table: &mut ObjectTable,
    space: &mut RegionSpace,
    forwarding: &mut ForwardingTable,
    placements: &[Placement],
) -> Result<RelocationOutcome> {
    let mut outcome = RelocationOutcome {
        moved_bytes: 0,
        promoted_bytes: 0,
        relocated: Vec::with_capacity(placements.len()),
    };
    for placement in placements {
        let mut record = table
            .remove(placement.old)
            .ok_or(GcError::CorruptGraph("relocation source missing from table"))?;
        if record.generation == Some(Generation::Young)
            && placement.dest == Some(Generation::Old)
        {
            outcome.promoted_bytes += record.size;
        }
        outcome.moved_bytes += record.size;
        space.place_at(placement.region, placement.offset, record.size);
        record.generation = placement.dest;
        record.region = placement.region;
        record.offset = placement.offset;
        record.age = placement.new_age;
        record.force_color(GC_WHITE);
        let new = table.insert(record);
        space.note_member(placement.region, new);
        forwarding.insert(placement.old, new);
        outcome.relocated.push(new);
    }
    Ok(outcome)
}

/// Rewrites the outgoing references of every record in the table through the
/// forwarding table.
pub(crate) fn fixup_references(
    table: &mut ObjectTable,
    forwarding: &ForwardingTable,
) -> Result<()> {
    let ids = table.ids();
    fixup_owners(table, forwarding, &ids)
}

/// Rewrites the outgoing references of the given owners only. Used when the
/// remembered set bounds the incoming-edge scan to a region subset.
pub(crate) fn fixup_owners(
    table: &mut ObjectTable,
    forwarding: &ForwardingTable,
    owners: &[ObjectId],
) -> Result<()> {
    for &owner in owners {
        // resolve first: callers may hold pre-relocation identities
        let owner = forwarding.resolve(owner)?;
        let Some(record) = table.get(owner) else {
            continue;
        };
        let mut rewritten: Option<Vec<ObjectId>> = None;
        for (index, &target) in record.references.iter().enumerate() {
            let resolved = forwarding.resolve(target)?;
            if resolved != target {
                rewritten
                    .get_or_insert_with(|| record.references.clone())[index] = resolved;
            }
        }
        if let Some(references) = rewritten {
            if let Some(record) = table.get_mut(owner) {
                record.references = references;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_follows_chains() {
        let mut forwarding = ForwardingTable::new();
        forwarding.insert(ObjectId(1), ObjectId(2));
        forwarding.insert(ObjectId(2), ObjectId(3));
        assert_eq!(forwarding.resolve(ObjectId(1)).unwrap(), ObjectId(3));
        assert_eq!(forwarding.resolve(ObjectId(9)).unwrap(), ObjectId(9));
        forwarding.compress().unwrap();
        assert_eq!(forwarding.resolve(ObjectId(1)).unwrap(), ObjectId(3));
    }

    #[test]
    fn forwarding_cycle_is_fatal() {
        let mut forwarding = ForwardingTable::new();
        forwarding.insert(ObjectId(1), ObjectId(2));
        forwarding.insert(ObjectId(2), ObjectId(1));
        assert_eq!(
            forwarding.resolve(ObjectId(1)),
            Err(GcError::CorruptGraph("forwarding cycle"))
        );
    }
}
