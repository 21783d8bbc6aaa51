//! Liquidity levels
//!
//! A liquidity level is a reference high or low (prior-day extreme, swing
//! extreme, or a cluster of equal highs/lows) where resting orders are
//! assumed to sit. Levels move through a monotone lifecycle:
//!
//! Active -> Broken -> Confirmed -> Traded, with Canceled reachable from any
//! non-Traded state. No state is ever revisited.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::bars::{Bar, Direction};
use super::swing::{SwingHistory, SwingKind, SwingPoint};

/// Which side of price the liquidity rests on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LevelSide {
    /// Buy-side liquidity above a high (BSL)
    High,
    /// Sell-side liquidity below a low (SSL)
    Low,
}

impl LevelSide {
    pub const BOTH: [LevelSide; 2] = [LevelSide::High, LevelSide::Low];

    /// A swept high sets up a short, a swept low sets up a long
    pub fn setup_direction(self) -> Direction {
        match self {
            LevelSide::High => Direction::Short,
            LevelSide::Low => Direction::Long,
        }
    }

    pub fn swing_kind(self) -> SwingKind {
        match self {
            LevelSide::High => SwingKind::High,
            LevelSide::Low => SwingKind::Low,
        }
    }

    fn slot(self) -> usize {
        match self {
            LevelSide::High => 0,
            LevelSide::Low => 1,
        }
    }
}

impl std::fmt::Display for LevelSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LevelSide::High => write!(f, "BSL"),
            LevelSide::Low => write!(f, "SSL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelState {
    /// Armed, waiting for a sweep
    Active,
    /// Swept; tracking the sweep extreme until MSS
    Broken,
    /// Structure shift confirmed after the sweep
    Confirmed,
    /// Abandoned (superseded, timed out, aged out, daily reset)
    Canceled,
    /// An entry was taken off this level
    Traded,
}

impl LevelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LevelState::Canceled | LevelState::Traded)
    }

    /// Allowed forward transitions
    pub fn can_transition_to(self, next: LevelState) -> bool {
        use LevelState::*;
        matches!(
            (self, next),
            (Active, Broken)
                | (Broken, Confirmed)
                | (Confirmed, Traded)
                | (Active, Canceled)
                | (Broken, Canceled)
                | (Confirmed, Canceled)
        )
    }
}

impl std::fmt::Display for LevelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LevelState::Active => write!(f, "ACTIVE"),
            LevelState::Broken => write!(f, "BROKEN"),
            LevelState::Confirmed => write!(f, "CONFIRMED"),
            LevelState::Canceled => write!(f, "CANCELED"),
            LevelState::Traded => write!(f, "TRADED"),
        }
    }
}

/// Stable key of a level in the [`LevelBook`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LevelId(pub u64);

/// Liquidity reference tracked through its lifecycle
#[derive(Debug, Clone, Serialize)]
pub struct LiquidityLevel {
    pub id: LevelId,
    pub price: f64,
    pub side: LevelSide,
    /// Epoch ms of the bar on which the level was armed
    pub detected_time: i64,
    pub detected_index: usize,
    /// False when the level came from a degenerate range; kept for display only
    pub tradable: bool,
    state: LevelState,
    sweep_extreme: Option<f64>,
    broke_index: Option<usize>,
    traded: bool,
}

impl LiquidityLevel {
    pub fn new(id: LevelId, price: f64, side: LevelSide, detected_time: i64, detected_index: usize) -> Self {
        Self {
            id,
            price,
            side,
            detected_time,
            detected_index,
            tradable: true,
            state: LevelState::Active,
            sweep_extreme: None,
            broke_index: None,
            traded: false,
        }
    }

    pub fn state(&self) -> LevelState {
        self.state
    }

    /// Furthest adverse price reached since the sweep; only set while Broken or Confirmed
    pub fn sweep_extreme(&self) -> Option<f64> {
        self.sweep_extreme
    }

    pub fn broke_index(&self) -> Option<usize> {
        self.broke_index
    }

    pub fn was_traded(&self) -> bool {
        self.traded
    }

    fn transition(&mut self, next: LevelState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if !matches!(next, LevelState::Broken | LevelState::Confirmed) {
            self.sweep_extreme = None;
        }
        true
    }

    /// Active -> Broken, seeding the sweep extreme from the triggering bar
    pub fn mark_broken(&mut self, bar_index: usize, bar: &Bar) -> bool {
        if !self.transition(LevelState::Broken) {
            return false;
        }
        self.broke_index = Some(bar_index);
        self.sweep_extreme = Some(match self.side {
            LevelSide::High => bar.high,
            LevelSide::Low => bar.low,
        });
        true
    }

    /// Push the sweep extreme further in the adverse direction; never retracts
    pub fn extend_sweep(&mut self, bar: &Bar) -> bool {
        if self.state != LevelState::Broken {
            return false;
        }
        let Some(current) = self.sweep_extreme else {
            return false;
        };
        let next = match self.side {
            LevelSide::High => current.max(bar.high),
            LevelSide::Low => current.min(bar.low),
        };
        if next != current {
            self.sweep_extreme = Some(next);
            return true;
        }
        false
    }

    pub fn confirm(&mut self) -> bool {
        self.transition(LevelState::Confirmed)
    }

    pub fn mark_traded(&mut self) -> bool {
        if self.transition(LevelState::Traded) {
            self.traded = true;
            return true;
        }
        false
    }

    pub fn cancel(&mut self) -> bool {
        self.transition(LevelState::Canceled)
    }
}

/// How the liquidity reference for a side is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidityMode {
    /// Prior-day high / low
    PriorExtreme,
    /// Most recent confirmed swing high / low
    SwingExtreme,
    /// Largest cluster of equal highs / lows, else prior-day extreme
    EqualLevelCluster,
}

/// Prior-period range (prior day high/low)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorLevels {
    pub day: Option<NaiveDate>,
    pub high: f64,
    pub low: f64,
}

impl PriorLevels {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Midpoint of the range
    pub fn equilibrium(&self) -> f64 {
        (self.high + self.low) / 2.0
    }

    pub fn extreme(&self, side: LevelSide) -> f64 {
        match side {
            LevelSide::High => self.high,
            LevelSide::Low => self.low,
        }
    }

    /// Range width outside `[min, max]` (0 disables a bound)
    pub fn is_degenerate(&self, min_points: f64, max_points: f64) -> bool {
        let range = self.range();
        (min_points > 0.0 && range < min_points) || (max_points > 0.0 && range > max_points)
    }
}

/// Running high/low for the current day; becomes [`PriorLevels`] at the roll
#[derive(Debug, Clone, Copy, Default)]
pub struct DayRange {
    high: Option<f64>,
    low: Option<f64>,
}

impl DayRange {
    pub fn update(&mut self, bar: &Bar) {
        self.high = Some(self.high.map_or(bar.high, |h| h.max(bar.high)));
        self.low = Some(self.low.map_or(bar.low, |l| l.min(bar.low)));
    }

    pub fn high(&self) -> Option<f64> {
        self.high
    }

    pub fn low(&self) -> Option<f64> {
        self.low
    }

    /// Close out the day, returning its range if any bar was seen
    pub fn finish(&mut self, day: Option<NaiveDate>) -> Option<PriorLevels> {
        let levels = match (self.high, self.low) {
            (Some(high), Some(low)) => Some(PriorLevels { day, high, low }),
            _ => None,
        };
        *self = Self::default();
        levels
    }
}

/// Output of the level selector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelCandidate {
    pub price: f64,
    /// Came from the prior-period range (subject to the degenerate-range check)
    pub from_prior: bool,
}

/// Choose the liquidity reference for `side`
pub fn select_level(
    mode: LiquidityMode,
    side: LevelSide,
    prior: Option<&PriorLevels>,
    swings: &SwingHistory,
    cluster_tolerance: f64,
    cluster_lookback: usize,
) -> Option<LevelCandidate> {
    let from_prior = prior.map(|p| LevelCandidate {
        price: p.extreme(side),
        from_prior: true,
    });

    match mode {
        LiquidityMode::PriorExtreme => from_prior,
        LiquidityMode::SwingExtreme => swings.latest(side.swing_kind()).map(|p| LevelCandidate {
            price: p.price,
            from_prior: false,
        }),
        LiquidityMode::EqualLevelCluster => {
            let recent: Vec<SwingPoint> = swings
                .recent(side.swing_kind())
                .take(cluster_lookback)
                .copied()
                .collect();
            find_cluster(&recent, side, cluster_tolerance)
                .map(|price| LevelCandidate {
                    price,
                    from_prior: false,
                })
                .or(from_prior)
        }
    }
}

/// Largest group (>= 2) of swing prices within `tolerance` of each other
///
/// Each point anchors a window `[anchor, anchor + tolerance]`, so all members
/// are pairwise within tolerance. Equal-size clusters resolve toward the one
/// containing the most recently observed point. Highs return the top of the
/// cluster and lows the bottom, since that is where the stops rest.
pub fn find_cluster(points: &[SwingPoint], side: LevelSide, tolerance: f64) -> Option<f64> {
    const EPS: f64 = 1e-9;
    let mut best: Option<(usize, usize, f64)> = None;

    for anchor in points {
        let members: Vec<&SwingPoint> = points
            .iter()
            .filter(|p| p.price >= anchor.price - EPS && p.price <= anchor.price + tolerance + EPS)
            .collect();
        if members.len() < 2 {
            continue;
        }
        let recency = members.iter().map(|p| p.bar_index).max().unwrap_or(0);
        let price = match side {
            LevelSide::High => members.iter().map(|p| p.price).fold(f64::MIN, f64::max),
            LevelSide::Low => members.iter().map(|p| p.price).fold(f64::MAX, f64::min),
        };
        let better = match best {
            None => true,
            Some((size, rec, _)) => members.len() > size || (members.len() == size && recency > rec),
        };
        if better {
            best = Some((members.len(), recency, price));
        }
    }

    best.map(|(_, _, price)| price)
}

/// Arena of liquidity levels with one armed slot per side
#[derive(Debug, Clone)]
pub struct LevelBook {
    levels: BTreeMap<LevelId, LiquidityLevel>,
    armed: [Option<LevelId>; 2],
    next_id: u64,
    history_limit: usize,
}

impl LevelBook {
    pub fn new(history_limit: usize) -> Self {
        Self {
            levels: BTreeMap::new(),
            armed: [None, None],
            next_id: 1,
            history_limit,
        }
    }

    /// Create a new Active level and make it the armed level for its side
    pub fn arm(&mut self, price: f64, side: LevelSide, time: i64, bar_index: usize, tradable: bool) -> LevelId {
        let id = LevelId(self.next_id);
        self.next_id += 1;
        let mut level = LiquidityLevel::new(id, price, side, time, bar_index);
        level.tradable = tradable;
        self.levels.insert(id, level);
        self.armed[side.slot()] = Some(id);
        self.prune();
        id
    }

    pub fn armed(&self, side: LevelSide) -> Option<LevelId> {
        self.armed[side.slot()]
    }

    pub fn armed_level(&self, side: LevelSide) -> Option<&LiquidityLevel> {
        self.armed(side).and_then(|id| self.levels.get(&id))
    }

    pub fn disarm(&mut self, side: LevelSide) {
        self.armed[side.slot()] = None;
    }

    pub fn get(&self, id: LevelId) -> Option<&LiquidityLevel> {
        self.levels.get(&id)
    }

    pub fn get_mut(&mut self, id: LevelId) -> Option<&mut LiquidityLevel> {
        self.levels.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LiquidityLevel> {
        self.levels.values()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn set_history_limit(&mut self, limit: usize) {
        self.history_limit = limit;
        self.prune();
    }

    /// Evict terminal levels beyond the history limit, oldest first
    pub fn prune(&mut self) -> Vec<LevelId> {
        let terminal: Vec<LevelId> = self
            .levels
            .values()
            .filter(|l| l.state().is_terminal())
            .map(|l| l.id)
            .collect();
        let evicted = terminal_evictions(&terminal, self.history_limit);
        for id in &evicted {
            self.levels.remove(id);
        }
        evicted
    }

    /// Daily reset: drop every level that was not traded and clear both slots
    pub fn clear_pending(&mut self) -> usize {
        let before = self.levels.len();
        self.levels.retain(|_, l| l.was_traded());
        self.armed = [None, None];
        before - self.levels.len()
    }
}

/// Terminal level ids (oldest first) that must go to respect `limit`
pub fn terminal_evictions(terminal_oldest_first: &[LevelId], limit: usize) -> Vec<LevelId> {
    let excess = terminal_oldest_first.len().saturating_sub(limit);
    terminal_oldest_first[..excess].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swing(price: f64, kind: SwingKind, bar_index: usize) -> SwingPoint {
        SwingPoint {
            price,
            kind,
            bar_index,
            time: bar_index as i64 * 60_000,
        }
    }

    fn bar(high: f64, low: f64) -> Bar {
        Bar::new(0, low, high, low, high, 1.0)
    }

    #[test]
    fn test_state_transitions_are_monotone() {
        use LevelState::*;
        assert!(Active.can_transition_to(Broken));
        assert!(Broken.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Traded));
        assert!(Broken.can_transition_to(Canceled));
        assert!(!Broken.can_transition_to(Active));
        assert!(!Confirmed.can_transition_to(Broken));
        assert!(!Traded.can_transition_to(Canceled));
        assert!(!Canceled.can_transition_to(Active));
        assert!(!Active.can_transition_to(Confirmed));
    }

    #[test]
    fn test_sweep_extreme_lifecycle() {
        let mut level = LiquidityLevel::new(LevelId(1), 100.0, LevelSide::Low, 0, 0);
        assert!(level.sweep_extreme().is_none());

        assert!(level.mark_broken(5, &bar(100.5, 99.4)));
        assert_eq!(level.sweep_extreme(), Some(99.4));

        // Higher low does not retract the extreme
        assert!(!level.extend_sweep(&bar(100.2, 99.6)));
        assert_eq!(level.sweep_extreme(), Some(99.4));
        assert!(level.extend_sweep(&bar(99.9, 99.1)));
        assert_eq!(level.sweep_extreme(), Some(99.1));

        assert!(level.confirm());
        // No extension once confirmed
        assert!(!level.extend_sweep(&bar(99.0, 98.0)));
        assert_eq!(level.sweep_extreme(), Some(99.1));

        assert!(level.mark_traded());
        assert!(level.was_traded());
        assert!(level.sweep_extreme().is_none());
        assert!(!level.cancel());
    }

    #[test]
    fn test_cluster_prefers_largest_then_most_recent() {
        // Tolerance 1.0 (4 ticks of 0.25)
        let points = vec![
            swing(110.0, SwingKind::High, 30),
            swing(105.0, SwingKind::High, 25),
            swing(110.5, SwingKind::High, 20),
            swing(105.25, SwingKind::High, 15),
            swing(105.5, SwingKind::High, 10),
        ];
        // {105, 105.25, 105.5} has three members
        assert_eq!(find_cluster(&points, LevelSide::High, 1.0), Some(105.5));

        let tied = vec![
            swing(110.0, SwingKind::High, 30),
            swing(105.0, SwingKind::High, 25),
            swing(110.5, SwingKind::High, 20),
            swing(105.25, SwingKind::High, 15),
        ];
        // Two pairs, the 110 cluster holds the newest point
        assert_eq!(find_cluster(&tied, LevelSide::High, 1.0), Some(110.5));

        let lows = vec![swing(95.0, SwingKind::Low, 8), swing(95.5, SwingKind::Low, 4)];
        assert_eq!(find_cluster(&lows, LevelSide::Low, 1.0), Some(95.0));

        let lonely = vec![swing(95.0, SwingKind::Low, 8), swing(99.0, SwingKind::Low, 4)];
        assert_eq!(find_cluster(&lonely, LevelSide::Low, 1.0), None);
    }

    #[test]
    fn test_select_level_modes() {
        let prior = PriorLevels {
            day: None,
            high: 120.0,
            low: 100.0,
        };
        let mut swings = SwingHistory::new(600);
        swings.push(swing(115.0, SwingKind::High, 3));
        swings.push(swing(112.0, SwingKind::High, 6));

        let pick = |mode, swings: &SwingHistory| select_level(mode, LevelSide::High, Some(&prior), swings, 1.0, 10);
        assert_eq!(pick(LiquidityMode::PriorExtreme, &swings).unwrap().price, 120.0);
        assert_eq!(pick(LiquidityMode::SwingExtreme, &swings).unwrap().price, 112.0);

        // No cluster of two: falls back to the prior extreme
        let fallback = pick(LiquidityMode::EqualLevelCluster, &swings).unwrap();
        assert_eq!(fallback.price, 120.0);
        assert!(fallback.from_prior);

        swings.push(swing(112.5, SwingKind::High, 9));
        let cluster = pick(LiquidityMode::EqualLevelCluster, &swings).unwrap();
        assert_eq!(cluster.price, 112.5);
        assert!(!cluster.from_prior);
    }

    #[test]
    fn test_degenerate_range() {
        let prior = PriorLevels {
            day: None,
            high: 110.0,
            low: 100.0,
        };
        assert!(!prior.is_degenerate(0.0, 0.0));
        assert!(prior.is_degenerate(20.0, 0.0));
        assert!(prior.is_degenerate(0.0, 5.0));
        assert_eq!(prior.equilibrium(), 105.0);
    }

    #[test]
    fn test_book_arms_and_evicts_oldest_terminal() {
        let mut book = LevelBook::new(2);
        let a = book.arm(100.0, LevelSide::High, 0, 0, true);
        let b = book.arm(101.0, LevelSide::High, 0, 1, true);
        assert_eq!(book.armed(LevelSide::High), Some(b));
        assert!(book.get_mut(a).unwrap().cancel());
        assert!(book.get_mut(b).unwrap().cancel());
        let c = book.arm(102.0, LevelSide::High, 0, 2, true);
        book.get_mut(c).unwrap().cancel();
        let evicted = book.prune();
        assert_eq!(evicted, vec![a]);
        assert_eq!(book.len(), 2);

        assert_eq!(terminal_evictions(&[LevelId(1), LevelId(2), LevelId(3)], 1), vec![LevelId(1), LevelId(2)]);
    }

    #[test]
    fn test_day_range_rolls_into_prior() {
        let mut range = DayRange::default();
        assert!(range.finish(None).is_none());
        range.update(&bar(105.0, 101.0));
        range.update(&bar(107.0, 103.0));
        let prior = range.finish(None).unwrap();
        assert_eq!((prior.high, prior.low), (107.0, 101.0));
        assert!(range.high().is_none());
    }
}
