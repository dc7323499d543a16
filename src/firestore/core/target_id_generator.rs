use crate::firestore::core::types::TargetId;

const RESERVED_BITS: u32 = 1;

/// Hands out target IDs from one of two disjoint spaces: even IDs for
/// targets persisted in the target cache and odd IDs for limbo resolution
/// targets owned by the sync engine.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    generator_id: TargetId,
    previous_id: TargetId,
}

impl TargetIdGenerator {
    pub fn for_target_cache(last_id: TargetId) -> Self {
        Self::new(0, last_id)
    }

    pub fn for_sync_engine() -> Self {
        // Seeding at -1 makes the first ID 1.
        Self::new(1, -1)
    }

    fn new(generator_id: TargetId, last_id: TargetId) -> Self {
        let mut generator = Self {
            generator_id,
            previous_id: 0,
        };
        generator.seek(last_id);
        generator
    }

    pub fn next(&mut self) -> TargetId {
        self.previous_id += 1 << RESERVED_BITS;
        self.previous_id
    }

    fn seek(&mut self, target_id: TargetId) {
        let mask = (1 << RESERVED_BITS) - 1;
        let id = if (target_id & mask) == self.generator_id {
            target_id
        } else {
            target_id + 1
        };
        // The seeded ID itself is never handed out.
        self.previous_id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_cache_ids_are_even_and_skip_the_seed() {
        let mut generator = TargetIdGenerator::for_target_cache(0);
        assert_eq!(generator.next(), 2);
        assert_eq!(generator.next(), 4);

        let mut generator = TargetIdGenerator::for_target_cache(46);
        assert_eq!(generator.next(), 48);
    }

    #[test]
    fn sync_engine_ids_are_odd() {
        let mut generator = TargetIdGenerator::for_sync_engine();
        assert_eq!(generator.next(), 1);
        assert_eq!(generator.next(), 3);
        assert_eq!(generator.next(), 5);
    }
}
