//! Downsampling functions.
//!
//! Aggregators (`first`, `last`, `min`, `max`, `sum`, `mean`) own a fixed
//! slot and are what coarser buckets store on disk. Derived functions are
//! computed from aggregator slots at query time and may carry running state
//! across windows, so every query instantiates its own [`FunctionState`].

use crate::error::{Result, StrataError};

/// Number of aggregator slots.
pub const AGGREGATOR_COUNT: usize = 6;

/// Slot mask over the aggregators, indexed by [`Aggregator::slot`].
pub type SlotMask = [bool; AGGREGATOR_COUNT];

/// Fixed-slot aggregation retained in secondary buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Aggregator {
    /// First value of the window.
    First,
    /// Last value of the window.
    Last,
    /// Smallest value of the window.
    Min,
    /// Largest value of the window.
    Max,
    /// Sum of the window.
    Sum,
    /// Truncating integer mean of the window.
    Mean,
}

impl Aggregator {
    /// All aggregators in slot order.
    pub const ALL: [Aggregator; AGGREGATOR_COUNT] = [
        Aggregator::First,
        Aggregator::Last,
        Aggregator::Min,
        Aggregator::Max,
        Aggregator::Sum,
        Aggregator::Mean,
    ];

    /// Fixed slot index.
    pub fn slot(self) -> usize {
        self as usize
    }

    /// Registered name.
    pub fn name(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Last => "last",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Mean => "mean",
        }
    }

    /// Reduces one window of values. Empty input yields 0.
    ///
    /// Applied to raw values this computes the aggregate; applied to the
    /// same aggregator's values from a coarser tier it combines them (max of
    /// max, sum of sums, mean of means).
    pub fn reduce(self, values: &[i64]) -> i64 {
        let (Some(&first), Some(&last)) = (values.first(), values.last()) else {
            return 0;
        };
        match self {
            Self::First => first,
            Self::Last => last,
            Self::Min => values.iter().copied().fold(i64::MAX, i64::min),
            Self::Max => values.iter().copied().fold(i64::MIN, i64::max),
            Self::Sum => values.iter().fold(0i64, |acc, &v| acc.wrapping_add(v)),
            Self::Mean => {
                let sum: i128 = values.iter().map(|&v| v as i128).sum();
                (sum / values.len() as i128) as i64
            }
        }
    }
}

/// Every function a schema or query may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    /// One of the stored aggregators.
    Aggregate(Aggregator),
    /// `last - first` within the window.
    Difference,
    /// `(last - first) / step`, per second.
    Derivative,
    /// Running total of window sums.
    Accumulate,
    /// Running total of `mean * step`.
    Integrate,
    /// `last` minus the first value of the query.
    SinceStart,
    /// `max - min` within the window.
    PeakToPeak,
    /// Number of points in the window.
    Count,
}

/// Name registry, consulted when schemas and requests are loaded.
const REGISTRY: &[(&str, FunctionKind)] = &[
    ("first", FunctionKind::Aggregate(Aggregator::First)),
    ("last", FunctionKind::Aggregate(Aggregator::Last)),
    ("min", FunctionKind::Aggregate(Aggregator::Min)),
    ("max", FunctionKind::Aggregate(Aggregator::Max)),
    ("sum", FunctionKind::Aggregate(Aggregator::Sum)),
    ("mean", FunctionKind::Aggregate(Aggregator::Mean)),
    ("difference", FunctionKind::Difference),
    ("derivative", FunctionKind::Derivative),
    ("accumulate", FunctionKind::Accumulate),
    ("integrate", FunctionKind::Integrate),
    ("since_start", FunctionKind::SinceStart),
    ("peak_to_peak", FunctionKind::PeakToPeak),
    ("count", FunctionKind::Count),
];

impl FunctionKind {
    /// Looks a function up by name.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::UnknownFunction` for unregistered names.
    pub fn from_name(name: &str) -> Result<Self> {
        REGISTRY
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| StrataError::UnknownFunction(name.to_string()))
    }

    /// Registered name.
    pub fn name(&self) -> &'static str {
        REGISTRY
            .iter()
            .find(|(_, kind)| kind == self)
            .map_or("unknown", |(n, _)| n)
    }

    /// Names of every registered function.
    pub fn names() -> impl Iterator<Item = &'static str> {
        REGISTRY.iter().map(|(n, _)| *n)
    }

    /// Flags the aggregator slots this function reads.
    pub fn needs(&self, slots: &mut [bool]) {
        let mut set = |a: Aggregator| {
            if let Some(s) = slots.get_mut(a.slot()) {
                *s = true;
            }
        };
        match self {
            Self::Aggregate(a) => set(*a),
            Self::Difference | Self::Derivative | Self::SinceStart => {
                set(Aggregator::First);
                set(Aggregator::Last);
            }
            Self::Accumulate => set(Aggregator::Sum),
            Self::Integrate => set(Aggregator::Mean),
            Self::PeakToPeak => {
                set(Aggregator::Min);
                set(Aggregator::Max);
            }
            Self::Count => {}
        }
    }

    /// Returns the slot mask of [`FunctionKind::needs`].
    pub fn slot_mask(&self) -> SlotMask {
        let mut mask = [false; AGGREGATOR_COUNT];
        self.needs(&mut mask);
        mask
    }

    /// Returns true for functions that only raw points can answer.
    ///
    /// Coarser buckets hold one row per window, so a count read there
    /// would count rows instead of points.
    pub fn needs_raw_points(&self) -> bool {
        matches!(self, Self::Count)
    }

    /// Returns false for functions whose output is not in column units.
    pub fn is_scaled(&self) -> bool {
        !matches!(self, Self::Count)
    }

    /// Creates fresh per-query state.
    pub fn instantiate(&self) -> FunctionState {
        FunctionState {
            kind: *self,
            running: 0.0,
            start: None,
        }
    }
}

/// Aggregator values of one column over one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowAggregates {
    /// Values by aggregator slot; slots nobody needed are 0.
    pub values: [i64; AGGREGATOR_COUNT],
    /// Rows in the window; raw points when read from the primary bucket.
    pub count: usize,
}

impl WindowAggregates {
    /// Value of one aggregator.
    pub fn get(&self, a: Aggregator) -> i64 {
        self.values[a.slot()]
    }
}

/// Per-query instance of a function.
///
/// Not `Clone`: running totals belong to one query.
#[derive(Debug)]
pub struct FunctionState {
    kind: FunctionKind,
    running: f64,
    start: Option<i64>,
}

impl FunctionState {
    /// Function this state evaluates.
    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    /// Evaluates the function for the next window, in stored integer units.
    pub fn apply(&mut self, window: &WindowAggregates, step: i64) -> f64 {
        let first = window.get(Aggregator::First);
        let last = window.get(Aggregator::Last);
        match self.kind {
            FunctionKind::Aggregate(a) => window.get(a) as f64,
            FunctionKind::Difference => last.wrapping_sub(first) as f64,
            FunctionKind::Derivative => last.wrapping_sub(first) as f64 / step.max(1) as f64,
            FunctionKind::Accumulate => {
                self.running += window.get(Aggregator::Sum) as f64;
                self.running
            }
            FunctionKind::Integrate => {
                self.running += window.get(Aggregator::Mean) as f64 * step as f64;
                self.running
            }
            FunctionKind::SinceStart => {
                let start = *self.start.get_or_insert(first);
                last.wrapping_sub(start) as f64
            }
            FunctionKind::PeakToPeak => {
                window.get(Aggregator::Max).wrapping_sub(window.get(Aggregator::Min)) as f64
            }
            FunctionKind::Count => window.count as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT: [i64; 7] = [4, -2, 9, 9, 0, 7, 3];

    fn window(values: &[i64]) -> WindowAggregates {
        let mut w = WindowAggregates {
            count: values.len(),
            ..Default::default()
        };
        for a in Aggregator::ALL {
            w.values[a.slot()] = a.reduce(values);
        }
        w
    }

    #[test]
    fn test_aggregators_on_fixed_input() {
        assert_eq!(Aggregator::First.reduce(&INPUT), 4);
        assert_eq!(Aggregator::Last.reduce(&INPUT), 3);
        assert_eq!(Aggregator::Min.reduce(&INPUT), -2);
        assert_eq!(Aggregator::Max.reduce(&INPUT), 9);
        assert_eq!(Aggregator::Sum.reduce(&INPUT), 30);
        // 30 / 7 truncates.
        assert_eq!(Aggregator::Mean.reduce(&INPUT), 4);
        assert_eq!(Aggregator::Mean.reduce(&[-7, 0]), -3);
        assert_eq!(Aggregator::Sum.reduce(&[]), 0);
    }

    #[test]
    fn test_mean_is_sum_over_count() {
        let values = [i64::MAX, i64::MAX, 1];
        let sum: i128 = values.iter().map(|&v| v as i128).sum();
        assert_eq!(Aggregator::Mean.reduce(&values) as i128, sum / 3);
    }

    #[test]
    fn test_slots_are_stable() {
        for (i, a) in Aggregator::ALL.iter().enumerate() {
            assert_eq!(a.slot(), i);
            assert_eq!(FunctionKind::from_name(a.name()).unwrap(), FunctionKind::Aggregate(*a));
        }
    }

    #[test]
    fn test_registry_lookup() {
        for name in FunctionKind::names() {
            assert_eq!(FunctionKind::from_name(name).unwrap().name(), name);
        }
        assert!(matches!(
            FunctionKind::from_name("median"),
            Err(StrataError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_needs() {
        let mask = FunctionKind::Difference.slot_mask();
        assert!(mask[Aggregator::First.slot()] && mask[Aggregator::Last.slot()]);
        assert_eq!(mask.iter().filter(|&&b| b).count(), 2);
        assert_eq!(FunctionKind::Count.slot_mask(), [false; AGGREGATOR_COUNT]);
        assert!(FunctionKind::Count.needs_raw_points());
        assert!(!FunctionKind::PeakToPeak.needs_raw_points());
        assert!(FunctionKind::PeakToPeak.slot_mask()[Aggregator::Max.slot()]);
    }

    #[test]
    fn test_derived_functions() {
        let w = window(&INPUT);
        let mut diff = FunctionKind::Difference.instantiate();
        assert_eq!(diff.apply(&w, 10), -1.0);
        let mut deriv = FunctionKind::Derivative.instantiate();
        assert_eq!(deriv.apply(&w, 10), -0.1);
        let mut p2p = FunctionKind::PeakToPeak.instantiate();
        assert_eq!(p2p.apply(&w, 10), 11.0);
        let mut count = FunctionKind::Count.instantiate();
        assert_eq!(count.apply(&w, 10), 7.0);
    }

    #[test]
    fn test_running_state_is_per_instance() {
        let w = window(&[1, 2, 3]);
        let mut a = FunctionKind::Accumulate.instantiate();
        let mut b = FunctionKind::Accumulate.instantiate();
        assert_eq!(a.apply(&w, 1), 6.0);
        assert_eq!(a.apply(&w, 1), 12.0);
        assert_eq!(b.apply(&w, 1), 6.0);

        let mut integ = FunctionKind::Integrate.instantiate();
        assert_eq!(integ.apply(&w, 10), 20.0);
        assert_eq!(integ.apply(&w, 10), 40.0);

        let mut since = FunctionKind::SinceStart.instantiate();
        assert_eq!(since.apply(&window(&[5, 8]), 1), 3.0);
        assert_eq!(since.apply(&window(&[9, 12]), 1), 7.0);
    }
}
