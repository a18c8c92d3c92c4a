//! Event timelines and computation windows
//!
//! All positions are epoch hours. Event windows are half-open
//! `[start, end)`; windows handed to reductions are inclusive hour ranges.

use std::collections::HashMap;

use crate::series::hour_of;

/// Events of one entity in ascending time order
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    pub entity: String,
    pub ids: Vec<i64>,
    pub starts: Vec<i64>,
    /// Exclusive end hour of each event's default window
    pub ends: Vec<i64>,
    /// Duration in hours where the entity records one
    pub durations: Vec<Option<f64>>,
    positions: HashMap<i64, usize>,
}

impl Timeline {
    /// Build from `(id, epoch seconds, duration hours)` rows.
    ///
    /// Without a duration the window runs to the next event's start, capped
    /// at `max_window` hours; the last event only gets the cap. With a
    /// duration the window is exactly `[start, start + duration)`, with the
    /// duration clamped to `max_span` hours.
    pub fn build(
        entity: &str,
        mut rows: Vec<(i64, i64, Option<f64>)>,
        has_duration: bool,
        max_window: i64,
        max_span: i64,
    ) -> Self {
        rows.sort_by_key(|&(id, time, _)| (time, id));

        let ids: Vec<i64> = rows.iter().map(|r| r.0).collect();
        let starts: Vec<i64> = rows.iter().map(|r| hour_of(r.1)).collect();
        let durations: Vec<Option<f64>> = if has_duration {
            rows.iter()
                .map(|r| r.2.filter(|d| d.is_finite() && *d >= 0.0).map(|d| d.min(max_span as f64)))
                .collect()
        } else {
            vec![None; rows.len()]
        };

        let ends = (0..starts.len())
            .map(|i| {
                let start = starts[i];
                if let Some(d) = durations[i] {
                    return start + d.ceil() as i64;
                }
                let cap = start + max_window;
                match starts.get(i + 1) {
                    Some(&next) => next.min(cap),
                    None => cap,
                }
            })
            .collect();
        let positions = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        Self {
            entity: entity.to_string(),
            ids,
            starts,
            ends,
            durations,
            positions,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn index_of(&self, id: i64) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    /// Inclusive hour range of an event's default window
    pub fn default_window(&self, index: usize) -> (i64, i64) {
        inclusive(self.starts[index], self.ends[index])
    }

    /// Start or end hour of the event `offset` positions away from `index`
    pub fn point(&self, index: Option<usize>, offset: i32, end: bool) -> Option<i64> {
        let target = index? as i64 + offset as i64;
        if target < 0 || target >= self.len() as i64 {
            return None;
        }
        let t = target as usize;
        Some(if end { self.ends[t] } else { self.starts[t] })
    }

    /// Index `offset` positions away, if it exists
    pub fn shifted(&self, index: Option<usize>, offset: i64) -> Option<usize> {
        let target = index? as i64 + offset;
        if target < 0 || target >= self.len() as i64 {
            None
        } else {
            Some(target as usize)
        }
    }
}

/// `None` for a window longer than `max_span` hours; only corrupt times
/// produce one.
pub fn within_span((lo, hi): (i64, i64), max_span: i64) -> Option<(i64, i64)> {
    (hi - lo < max_span).then_some((lo, hi))
}

/// Inclusive hours covered by the half-open span between two anchors.
///
/// Anchors may come in either order. Coincident anchors cover their single
/// hour.
pub fn inclusive(a: i64, b: i64) -> (i64, i64) {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if hi > lo {
        (lo, hi - 1)
    } else {
        (lo, lo)
    }
}

/// Hours averaged by `avg_value`: `|shift|` hours on the side of the anchor
/// the sign points to, or the anchor alone.
pub fn averaged_hours(anchor: i64, shift: i64) -> (i64, i64) {
    match shift {
        0 => (anchor, anchor),
        s if s > 0 => (anchor, anchor + s - 1),
        s => (anchor + s, anchor - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: i64 = 3600;

    #[test]
    fn test_next_event_bounds_window() {
        // Two events at hour 100 and 130, no duration, 48h cap
        let t = Timeline::build("fe", vec![(1, 100 * H, None), (2, 130 * H, None)], false, 48, 720);
        assert_eq!(t.starts, vec![100, 130]);
        assert_eq!(t.ends, vec![130, 178]);
        assert_eq!(t.default_window(0), (100, 129));
        assert_eq!(t.default_window(1), (130, 177));
    }

    #[test]
    fn test_cap_applies_before_next_event() {
        let t = Timeline::build("fe", vec![(1, 0, None), (2, 100 * H, None)], false, 48, 720);
        assert_eq!(t.ends[0], 48);
    }

    #[test]
    fn test_duration_window() {
        let t = Timeline::build(
            "fe",
            vec![(1, 10 * H, Some(5.5)), (2, 12 * H, Some(2.0)), (3, 20 * H, None)],
            true,
            48,
            720,
        );
        assert_eq!(t.ends[0], 16);
        assert_eq!(t.ends[1], 14);
        // missing duration falls back to the next-event rule
        assert_eq!(t.ends[2], 68);
    }

    #[test]
    fn test_sorted_by_time_then_id() {
        let t = Timeline::build("fe", vec![(9, 5 * H, None), (3, 5 * H, None), (1, 9 * H, None)], false, 48, 720);
        assert_eq!(t.ids, vec![3, 9, 1]);
        // simultaneous events leave the first an empty span
        assert_eq!(t.ends[0], 5);
    }

    #[test]
    fn test_point_with_offsets() {
        let t = Timeline::build("fe", vec![(1, 0, None), (2, 10 * H, None), (3, 30 * H, None)], false, 48, 720);
        assert_eq!(t.point(Some(1), 0, false), Some(10));
        assert_eq!(t.point(Some(1), -1, false), Some(0));
        assert_eq!(t.point(Some(1), 1, true), Some(78));
        assert_eq!(t.point(Some(0), -1, false), None);
        assert_eq!(t.point(None, 0, false), None);
        assert_eq!(t.shifted(Some(2), 1), None);
    }

    #[test]
    fn test_corrupt_duration_is_clamped() {
        let t = Timeline::build("fe", vec![(1, 10 * H, Some(1e300)), (2, 20 * H, Some(f64::NAN))], true, 48, 720);
        assert_eq!(t.ends[0], 730);
        assert_eq!(t.durations[0], Some(720.0));
        assert_eq!(t.durations[1], None);
        assert_eq!(within_span(t.default_window(0), 720), Some((10, 729)));
        assert_eq!(within_span((0, 720), 720), None);
    }

    #[test]
    fn test_index_of_after_sorting() {
        let t = Timeline::build("fe", vec![(9, 5 * H, None), (3, H, None)], false, 48, 720);
        assert_eq!(t.index_of(3), Some(0));
        assert_eq!(t.index_of(9), Some(1));
        assert_eq!(t.index_of(4), None);
    }

    #[test]
    fn test_inclusive_ranges() {
        assert_eq!(inclusive(100, 130), (100, 129));
        assert_eq!(inclusive(130, 100), (100, 129));
        assert_eq!(inclusive(5, 5), (5, 5));
    }

    #[test]
    fn test_averaged_hours() {
        assert_eq!(averaged_hours(10, 0), (10, 10));
        assert_eq!(averaged_hours(10, 3), (10, 12));
        assert_eq!(averaged_hours(10, -3), (7, 9));
    }
}
