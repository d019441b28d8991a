use std::cmp::Ordering;

/// Identity of a profiled code region.
///
/// A `Range` covers `[start, end]` where `end` is the address of the last
/// instruction of the region. A `Point` is a degenerate single-address key
/// used for synthetic markers.
///
/// The ordering below makes a `Point` query compare equal to a `Range`
/// whose `[start, end)` window holds it. Note the window is half open: a
/// `Point(end)` query orders after the range even though `contains(end)`
/// holds, so exhaustive containment checks go through [`RegionKey::contains`].
#[derive(Debug, Clone, Copy)]
pub enum RegionKey {
    Range { start: u64, end: u64 },
    Point { addr: u64 },
}

impl RegionKey {
    pub fn range(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        RegionKey::Range { start, end }
    }

    pub fn point(addr: u64) -> Self {
        RegionKey::Point { addr }
    }

    /// First instruction address of the region, or the marker address.
    pub fn start(&self) -> u64 {
        match self {
            RegionKey::Range { start, .. } => *start,
            RegionKey::Point { addr } => *addr,
        }
    }

    /// Last instruction address (inclusive), or the marker address.
    pub fn end(&self) -> u64 {
        match self {
            RegionKey::Range { end, .. } => *end,
            RegionKey::Point { addr } => *addr,
        }
    }

    /// Inclusive containment test, used for marker count scans.
    pub fn contains(&self, addr: u64) -> bool {
        match self {
            RegionKey::Range { start, end } => *start <= addr && addr <= *end,
            RegionKey::Point { addr: a } => *a == addr,
        }
    }
}

impl Ord for RegionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use RegionKey::*;
        match (self, other) {
            (Point { addr: a }, Point { addr: b }) => a.cmp(b),
            (Point { addr: a }, Range { start, end }) => {
                if a < start {
                    Ordering::Less
                } else if end <= a {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            }
            (Range { start, end }, Point { addr: b }) => {
                if end <= b {
                    Ordering::Less
                } else if b < start {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            }
            (
                Range {
                    start: s1,
                    end: e1,
                },
                Range {
                    start: s2,
                    end: e2,
                },
            ) => s1.cmp(s2).then(e1.cmp(e2)),
        }
    }
}

impl PartialOrd for RegionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RegionKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RegionKey {}
