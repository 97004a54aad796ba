use super::EmptyIntersection;

/// Sentinel instant addressing "the latest version regardless of time".
pub const MAX_INSTANT_MS: i64 = i64::MAX;

/// Predicate on an instant (valid time, phenomenon time or result time),
/// in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TemporalFilter {
    #[default]
    AllTimes,
    /// Selects the latest version of each resource. As a pointwise
    /// predicate this matches only the [`MAX_INSTANT_MS`] sentinel.
    LatestVersion,
    CurrentTime { tolerance_ms: i64 },
    Range { begin_ms: i64, end_ms: i64 },
    Single { instant_ms: i64 },
}

impl TemporalFilter {
    pub fn range(begin_ms: i64, end_ms: i64) -> Self {
        TemporalFilter::Range { begin_ms, end_ms }
    }

    pub fn single(instant_ms: i64) -> Self {
        TemporalFilter::Single { instant_ms }
    }

    pub fn current() -> Self {
        TemporalFilter::CurrentTime { tolerance_ms: 0 }
    }

    pub fn is_latest(&self) -> bool {
        matches!(self, TemporalFilter::LatestVersion)
    }

    pub fn is_all(&self) -> bool {
        matches!(self, TemporalFilter::AllTimes)
    }

    pub fn test(&self, instant_ms: i64, now_ms: i64) -> bool {
        match self {
            TemporalFilter::AllTimes => true,
            TemporalFilter::LatestVersion => instant_ms == MAX_INSTANT_MS,
            TemporalFilter::CurrentTime { tolerance_ms } => {
                instant_ms.abs_diff(now_ms) <= *tolerance_ms as u64
            }
            TemporalFilter::Range { begin_ms, end_ms } => {
                *begin_ms <= instant_ms && instant_ms <= *end_ms
            }
            TemporalFilter::Single { instant_ms: t } => instant_ms == *t,
        }
    }

    /// Evaluated form against a fixed `now_ms`: the ranged variants carry
    /// their bounds, so consumers never face an unresolved range.
    fn resolve(&self, now_ms: i64) -> Resolved {
        match self {
            TemporalFilter::AllTimes => Resolved::All,
            TemporalFilter::LatestVersion => Resolved::Latest,
            TemporalFilter::CurrentTime { tolerance_ms } => Resolved::Bounds(
                now_ms.saturating_sub(*tolerance_ms),
                now_ms.saturating_add(*tolerance_ms),
            ),
            TemporalFilter::Range { begin_ms, end_ms } => Resolved::Bounds(*begin_ms, *end_ms),
            TemporalFilter::Single { instant_ms } => Resolved::Bounds(*instant_ms, *instant_ms),
        }
    }

    /// Inclusive `[begin, end]` bounds for index pushdown. `None` when the
    /// filter doesn't constrain instants to a range (AllTimes) or selects
    /// per-resource latest entries (LatestVersion).
    pub fn resolved_range(&self, now_ms: i64) -> Option<(i64, i64)> {
        match self.resolve(now_ms) {
            Resolved::Bounds(begin, end) => Some((begin, end)),
            Resolved::All | Resolved::Latest => None,
        }
    }

    /// Conjunction of two temporal filters. `CurrentTime` windows are
    /// materialised against `now_ms` when combined with an explicit range.
    pub fn intersect(&self, other: &Self, now_ms: i64) -> Result<Self, EmptyIntersection> {
        use TemporalFilter::*;
        match (self.resolve(now_ms), other.resolve(now_ms)) {
            (Resolved::All, _) => Ok(other.clone()),
            (_, Resolved::All) => Ok(self.clone()),
            (Resolved::Latest, Resolved::Latest) => Ok(LatestVersion),
            (Resolved::Latest, Resolved::Bounds(_, end))
            | (Resolved::Bounds(_, end), Resolved::Latest) => {
                // Latest matches only the sentinel instant.
                if end == MAX_INSTANT_MS {
                    Ok(LatestVersion)
                } else {
                    Err(EmptyIntersection)
                }
            }
            (Resolved::Bounds(ab, ae), Resolved::Bounds(bb, be)) => {
                let begin = ab.max(bb);
                let end = ae.min(be);
                if begin > end {
                    Err(EmptyIntersection)
                } else if begin == end {
                    Ok(Single { instant_ms: begin })
                } else {
                    Ok(Range {
                        begin_ms: begin,
                        end_ms: end,
                    })
                }
            }
        }
    }
}

/// [`TemporalFilter`] with `CurrentTime`/`Range`/`Single` collapsed into
/// explicit bounds, leaving no variant whose range is still unresolved.
enum Resolved {
    All,
    Latest,
    Bounds(i64, i64),
}
