//! Imbalance zone tracking
//!
//! Zones are fair value gaps (3-bar imbalances) or order blocks (last opposing
//! candle before a displacement move). Each zone ages with every bar, can be
//! inverted once when price closes back through its midpoint against its
//! bias, and is invalidated when price closes through its far boundary.
//!
//! The tracker keeps zones in an id-keyed arena and evicts oldest-first when
//! capacity is reached.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::bars::{Bar, BarSeries, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneDirection {
    Bull,
    Bear,
}

impl ZoneDirection {
    pub fn flip(self) -> Self {
        match self {
            ZoneDirection::Bull => ZoneDirection::Bear,
            ZoneDirection::Bear => ZoneDirection::Bull,
        }
    }
}

impl From<Direction> for ZoneDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Long => ZoneDirection::Bull,
            Direction::Short => ZoneDirection::Bear,
        }
    }
}

impl std::fmt::Display for ZoneDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneDirection::Bull => write!(f, "BULL"),
            ZoneDirection::Bear => write!(f, "BEAR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneKind {
    FairValueGap,
    OrderBlock,
}

impl std::fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneKind::FairValueGap => write!(f, "FVG"),
            ZoneKind::OrderBlock => write!(f, "OB"),
        }
    }
}

/// What happened to a zone on a bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneUpdate {
    /// Older than the configured max age
    Aged,
    /// Closed through the far boundary
    Filled,
    /// Closed back through the midpoint; direction flipped
    Inverted,
}

impl std::fmt::Display for ZoneUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneUpdate::Aged => write!(f, "aged out"),
            ZoneUpdate::Filled => write!(f, "filled"),
            ZoneUpdate::Inverted => write!(f, "inverted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImbalanceZone {
    pub top: f64,
    pub bottom: f64,
    /// Bar on which the zone became known
    pub bar_index: usize,
    pub direction: ZoneDirection,
    pub valid: bool,
    pub inverted: bool,
    pub age: usize,
    pub kind: ZoneKind,
}

impl ImbalanceZone {
    pub fn new(top: f64, bottom: f64, bar_index: usize, direction: ZoneDirection, kind: ZoneKind) -> Self {
        Self {
            top,
            bottom,
            bar_index,
            direction,
            valid: true,
            inverted: false,
            age: 0,
            kind,
        }
    }

    pub fn midpoint(&self) -> f64 {
        (self.top + self.bottom) / 2.0
    }

    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }

    pub fn supports(&self, direction: Direction) -> bool {
        self.valid && self.direction == ZoneDirection::from(direction)
    }

    /// Price retraced into the zone from the side it was left on
    pub fn touched_by(&self, bar: &Bar) -> bool {
        match self.direction {
            ZoneDirection::Bull => bar.low <= self.top,
            ZoneDirection::Bear => bar.high >= self.bottom,
        }
    }

    /// Advance the age to `index`; invalid once past `max_age`
    pub fn age_out(&mut self, index: usize, max_age: usize) -> bool {
        self.age = index.saturating_sub(self.bar_index);
        if self.valid && self.age > max_age {
            self.valid = false;
            return true;
        }
        false
    }

    /// Age the zone to `index` and test the far-boundary fill
    ///
    /// Returns the reason if the zone became invalid on this bar.
    pub fn invalidate(&mut self, bar: &Bar, index: usize, max_age: usize) -> Option<ZoneUpdate> {
        if !self.valid {
            return None;
        }
        if self.age_out(index, max_age) {
            return Some(ZoneUpdate::Aged);
        }
        if self.closed_beyond(bar) {
            self.valid = false;
            return Some(ZoneUpdate::Filled);
        }
        None
    }

    /// `bar` closed past the far boundary
    pub fn closed_beyond(&self, bar: &Bar) -> bool {
        match self.direction {
            ZoneDirection::Bull => bar.close < self.bottom,
            ZoneDirection::Bear => bar.close > self.top,
        }
    }

    /// Flip a zone once when `bar` closes through the midpoint against its bias
    pub fn invert(&mut self, bar: &Bar) -> bool {
        if !self.valid || self.inverted {
            return false;
        }
        let through = match self.direction {
            ZoneDirection::Bull => bar.close < self.midpoint(),
            ZoneDirection::Bear => bar.close > self.midpoint(),
        };
        if through {
            self.direction = self.direction.flip();
            self.inverted = true;
        }
        through
    }
}

/// Look for a 3-bar gap ending at `index` of at least `min_gap` price units
///
/// Bullish when `low[index] > high[index - 2]`, bearish when
/// `high[index] < low[index - 2]`.
pub fn scan<S: BarSeries + ?Sized>(bars: &S, index: usize, min_gap: f64) -> Option<ImbalanceZone> {
    let first = bars.bar(index.checked_sub(2)?)?;
    let middle = bars.bar(index - 1)?;
    let last = bars.bar(index)?;
    if !(first.is_complete && middle.is_complete && last.is_complete) {
        return None;
    }

    const EPS: f64 = 1e-9;
    if last.low > first.high && last.low - first.high + EPS >= min_gap {
        return Some(ImbalanceZone::new(
            last.low,
            first.high,
            index,
            ZoneDirection::Bull,
            ZoneKind::FairValueGap,
        ));
    }
    if last.high < first.low && first.low - last.high + EPS >= min_gap {
        return Some(ImbalanceZone::new(
            first.low,
            last.high,
            index,
            ZoneDirection::Bear,
            ZoneKind::FairValueGap,
        ));
    }
    None
}

/// Last candle opposing `direction` within `lookback` bars before `displacement_index`
pub fn order_block<S: BarSeries + ?Sized>(
    bars: &S,
    displacement_index: usize,
    direction: Direction,
    lookback: usize,
) -> Option<ImbalanceZone> {
    let earliest = displacement_index.saturating_sub(lookback);
    (earliest..displacement_index).rev().find_map(|i| {
        let bar = bars.bar(i)?;
        let opposing = match direction {
            Direction::Long => bar.is_bearish(),
            Direction::Short => bar.is_bullish(),
        };
        opposing.then(|| {
            ImbalanceZone::new(
                bar.high,
                bar.low,
                displacement_index,
                ZoneDirection::from(direction),
                ZoneKind::OrderBlock,
            )
        })
    })
}

/// Stable key of a zone in the [`ZoneTracker`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId(pub u64);

/// Ids to evict (oldest first) so one more zone fits within `capacity`
pub fn eviction_candidates(ids_oldest_first: &[ZoneId], capacity: usize) -> Vec<ZoneId> {
    let excess = (ids_oldest_first.len() + 1).saturating_sub(capacity);
    ids_oldest_first[..excess.min(ids_oldest_first.len())].to_vec()
}

/// Capacity-bounded zone arena (FIFO eviction)
#[derive(Debug, Clone)]
pub struct ZoneTracker {
    zones: BTreeMap<ZoneId, ImbalanceZone>,
    next_id: u64,
    capacity: usize,
}

impl ZoneTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            zones: BTreeMap::new(),
            next_id: 1,
            capacity: capacity.max(1),
        }
    }

    /// Insert a zone, evicting the oldest ones first if at capacity
    pub fn insert(&mut self, zone: ImbalanceZone) -> (ZoneId, Vec<ZoneId>) {
        let ids: Vec<ZoneId> = self.zones.keys().copied().collect();
        let evicted = eviction_candidates(&ids, self.capacity);
        for id in &evicted {
            self.zones.remove(id);
        }
        let id = ZoneId(self.next_id);
        self.next_id += 1;
        self.zones.insert(id, zone);
        (id, evicted)
    }

    pub fn get(&self, id: ZoneId) -> Option<&ImbalanceZone> {
        self.zones.get(&id)
    }

    pub fn remove(&mut self, id: ZoneId) -> Option<ImbalanceZone> {
        self.zones.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ZoneId, &ImbalanceZone)> {
        self.zones.iter()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn clear(&mut self) {
        self.zones.clear();
    }

    /// Age, invert and invalidate every zone against `bar`; invalid zones are dropped
    ///
    /// With inversion enabled, a first close through a zone flips it instead
    /// of filling it. A later close through the flipped zone fills it.
    pub fn update(
        &mut self,
        bar: &Bar,
        index: usize,
        max_age: usize,
        allow_inversion: bool,
    ) -> Vec<(ZoneId, ZoneUpdate)> {
        let mut changes = Vec::new();
        for (id, zone) in self.zones.iter_mut() {
            if zone.bar_index >= index {
                continue;
            }
            if zone.age_out(index, max_age) {
                changes.push((*id, ZoneUpdate::Aged));
                continue;
            }
            if allow_inversion && zone.invert(bar) {
                changes.push((*id, ZoneUpdate::Inverted));
                continue;
            }
            if let Some(update) = zone.invalidate(bar, index, max_age) {
                changes.push((*id, update));
            }
        }
        self.zones.retain(|_, zone| zone.valid);
        changes
    }

    /// Already tracked zone with the same bounds, kind and origin bar
    pub fn find_matching(&self, zone: &ImbalanceZone) -> Option<ZoneId> {
        self.zones
            .iter()
            .find(|(_, z)| {
                z.valid
                    && !z.inverted
                    && z.kind == zone.kind
                    && z.direction == zone.direction
                    && z.bar_index == zone.bar_index
                    && z.top == zone.top
                    && z.bottom == zone.bottom
            })
            .map(|(id, _)| *id)
    }

    /// Most recent valid inverted zone now pointing in `direction`
    pub fn find_inverted(&self, direction: Direction, min_bar_index: usize) -> Option<(ZoneId, ImbalanceZone)> {
        self.zones
            .iter()
            .rev()
            .find(|(_, z)| z.inverted && z.supports(direction) && z.bar_index >= min_bar_index)
            .map(|(id, z)| (*id, *z))
    }
}
