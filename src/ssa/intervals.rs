//! Disjoint-interval definition maps.
//!
//! For each abstract memory object the map keeps a sorted list of
//! non-overlapping byte intervals, each carrying the set of nodes that may
//! have defined it last. Strong updates carve their range out of existing
//! intervals and become the sole definer; weak updates join the definer
//! sets of the covered parts.

use std::collections::{BTreeMap, BTreeSet};

use crate::offset::Offset;
use crate::rwgraph::{DefSite, RwNodeId};

/// An inclusive byte interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn full() -> Interval {
        Interval {
            start: 0,
            end: u64::MAX,
        }
    }

    /// The byte range of a def-site; unknown offset or length widen to
    /// the respective extreme.
    pub fn from_site(site: &DefSite) -> Interval {
        match (site.offset.value(), site.len.value()) {
            (Some(off), Some(len)) if len > 0 => Interval {
                start: off,
                end: off.saturating_add(len - 1),
            },
            // zero-length accesses degenerate to a one-byte probe
            (Some(off), Some(_)) => Interval {
                start: off,
                end: off,
            },
            (Some(off), None) => Interval {
                start: off,
                end: u64::MAX,
            },
            _ => Interval::full(),
        }
    }

    /// Back to a def-site on `target`.
    pub fn to_site(self, target: RwNodeId) -> DefSite {
        let offset = Offset(self.start);
        let len = if self.end == u64::MAX {
            Offset::UNKNOWN
        } else {
            Offset(self.end - self.start + 1)
        };
        DefSite::new(target, offset, len)
    }

    pub fn overlaps(self, other: Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn covers(self, other: Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersect(self, other: Interval) -> Option<Interval> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Interval {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }

    /// The parts of `self` before and after `other`.
    pub fn subtract(self, other: Interval) -> (Option<Interval>, Option<Interval>) {
        if !self.overlaps(other) {
            return (Some(self), None);
        }
        let before = if self.start < other.start {
            Some(Interval {
                start: self.start,
                end: other.start - 1,
            })
        } else {
            None
        };
        let after = if other.end < self.end {
            Some(Interval {
                start: other.end + 1,
                end: self.end,
            })
        } else {
            None
        };
        (before, after)
    }
}

/// One disjoint interval with its (possible) last definers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IntervalDefs {
    pub iv: Interval,
    pub definers: BTreeSet<RwNodeId>,
}

/// Mapping from memory object to disjoint definition intervals.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DefinitionsMap {
    map: BTreeMap<RwNodeId, Vec<IntervalDefs>>,
}

impl DefinitionsMap {
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn entries(&self) -> impl Iterator<Item = (RwNodeId, &[IntervalDefs])> {
        self.map.iter().map(|(&t, v)| (t, v.as_slice()))
    }

    /// Every definer recorded anywhere in the map.
    pub fn all_definers(&self) -> BTreeSet<RwNodeId> {
        self.map
            .values()
            .flatten()
            .flat_map(|e| e.definers.iter().copied())
            .collect()
    }

    /// Weak update: `definer` may have defined `site`; existing definers
    /// of the range stay.
    pub fn add(&mut self, site: &DefSite, definer: RwNodeId) -> bool {
        self.add_interval(site.target, Interval::from_site(site), [definer])
    }

    pub fn add_interval(
        &mut self,
        target: RwNodeId,
        iv: Interval,
        definers: impl IntoIterator<Item = RwNodeId> + Clone,
    ) -> bool {
        let entries = self.map.entry(target).or_default();
        split_entries(entries, iv);
        let mut changed = false;
        for entry in entries.iter_mut().filter(|e| iv.covers(e.iv)) {
            for d in definers.clone() {
                changed |= entry.definers.insert(d);
            }
        }
        for gap in gaps(entries, iv) {
            entries.push(IntervalDefs {
                iv: gap,
                definers: definers.clone().into_iter().collect(),
            });
            changed = true;
        }
        entries.sort_by_key(|e| e.iv.start);
        changed
    }

    /// Strong update: `definer` becomes the sole definer of the range;
    /// overlapped intervals are truncated or split around it.
    pub fn update(&mut self, site: &DefSite, definer: RwNodeId) {
        let iv = Interval::from_site(site);
        let entries = self.map.entry(site.target).or_default();
        let mut result: Vec<IntervalDefs> = Vec::with_capacity(entries.len() + 1);
        for entry in entries.drain(..) {
            if !entry.iv.overlaps(iv) {
                result.push(entry);
                continue;
            }
            let (before, after) = entry.iv.subtract(iv);
            if let Some(before) = before {
                result.push(IntervalDefs {
                    iv: before,
                    definers: entry.definers.clone(),
                });
            }
            if let Some(after) = after {
                result.push(IntervalDefs {
                    iv: after,
                    definers: entry.definers,
                });
            }
        }
        result.push(IntervalDefs {
            iv,
            definers: BTreeSet::from([definer]),
        });
        result.sort_by_key(|e| e.iv.start);
        *entries = result;
    }

    /// Definers of intervals overlapping `site`.
    pub fn get(&self, site: &DefSite) -> BTreeSet<RwNodeId> {
        let iv = Interval::from_site(site);
        let mut definers = BTreeSet::new();
        if let Some(entries) = self.map.get(&site.target) {
            for entry in entries.iter().filter(|e| e.iv.overlaps(iv)) {
                definers.extend(entry.definers.iter().copied());
            }
        }
        definers
    }

    /// Sub-ranges of `site` not covered by any interval of its target.
    pub fn uncovered(&self, site: &DefSite) -> Vec<Interval> {
        let iv = Interval::from_site(site);
        match self.map.get(&site.target) {
            Some(entries) => gaps(entries, iv),
            None => vec![iv],
        }
    }

    /// Whether the target's intervals fully cover `site`.
    pub fn covers(&self, site: &DefSite) -> bool {
        self.uncovered(site).is_empty()
    }

    pub fn remove_target(&mut self, target: RwNodeId) {
        self.map.remove(&target);
    }

    /// Weak union of another map into this one.
    pub fn merge(&mut self, other: &DefinitionsMap) -> bool {
        let mut changed = false;
        for (target, entries) in other.entries() {
            for entry in entries {
                changed |=
                    self.add_interval(target, entry.iv, entry.definers.iter().copied());
            }
        }
        changed
    }
}

/// Split entries crossing the boundaries of `iv` so that afterwards every
/// entry is either disjoint from `iv` or fully inside it.
fn split_entries(entries: &mut Vec<IntervalDefs>, iv: Interval) {
    if entries.iter().all(|e| !e.iv.overlaps(iv) || iv.covers(e.iv)) {
        return;
    }
    let mut result: Vec<IntervalDefs> = Vec::with_capacity(entries.len() + 2);
    for entry in entries.drain(..) {
        if !entry.iv.overlaps(iv) || iv.covers(entry.iv) {
            result.push(entry);
            continue;
        }
        let inside = entry.iv.intersect(iv).expect("overlap checked");
        let (before, after) = entry.iv.subtract(iv);
        if let Some(before) = before {
            result.push(IntervalDefs {
                iv: before,
                definers: entry.definers.clone(),
            });
        }
        result.push(IntervalDefs {
            iv: inside,
            definers: entry.definers.clone(),
        });
        if let Some(after) = after {
            result.push(IntervalDefs {
                iv: after,
                definers: entry.definers,
            });
        }
    }
    result.sort_by_key(|e| e.iv.start);
    *entries = result;
}

/// Sub-ranges of `iv` not covered by the (sorted, disjoint) entries.
fn gaps(entries: &[IntervalDefs], iv: Interval) -> Vec<Interval> {
    let mut gaps = Vec::new();
    let mut cursor = Some(iv.start);
    for entry in entries.iter().filter(|e| e.iv.overlaps(iv)) {
        let Some(at) = cursor else { break };
        if at < entry.iv.start {
            gaps.push(Interval {
                start: at,
                end: entry.iv.start - 1,
            });
        }
        cursor = entry.iv.end.checked_add(1);
    }
    if let Some(at) = cursor {
        if at <= iv.end {
            gaps.push(Interval {
                start: at,
                end: iv.end,
            });
        }
    }
    gaps
}
