use slotmap::new_key_type;

new_key_type! {
    /// Identifies a timer allocated from a [`Scheduler`](crate::scheduler::Scheduler).
    ///
    /// Keys are versioned: once a timer is freed its old id never aliases a
    /// timer allocated later into the same slot.
    pub struct TimerId;
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn freed_ids_do_not_alias() {
        let mut map: SlotMap<TimerId, &str> = SlotMap::with_key();
        let a = map.insert("vblank");
        map.remove(a);
        let b = map.insert("scanline");
        assert_ne!(a, b);
        assert!(map.get(a).is_none());
        assert_eq!(map[b], "scanline");
    }

    #[test]
    fn ids_are_hashable() {
        use std::collections::HashMap;
        let mut slots: SlotMap<TimerId, ()> = SlotMap::with_key();
        let id = slots.insert(());
        let mut names = HashMap::new();
        names.insert(id, "acia_tx");
        assert_eq!(names[&id], "acia_tx");
    }
}
