use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::NaiveDate;

use crate::model::*;

/// Sport id upstream uses for pickleball-only courts.
pub const PICKLEBALL_SPORT_ID: &str = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Courts serving only these sports are ignored.
    pub excluded_sports: HashSet<String>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            excluded_sports: HashSet::from([PICKLEBALL_SPORT_ID.to_string()]),
        }
    }
}

// ── Coverage extraction ──────────────────────────────────────────

/// Derive the canonical timeslot snapshot for one facility.
///
/// A timeslot is emitted for (date, window) when at least one eligible court
/// has every granule from `window.start` up to `window.end`. Results are unique
/// and sorted by key.
pub fn extract_timeslots(feed: &FacilityFeed, opts: &ExtractOptions) -> Vec<CanonicalTimeslot> {
    let mut found: BTreeSet<CanonicalTimeslot> = BTreeSet::new();

    for court in feed.courts.iter().filter(|c| is_eligible(c, opts)) {
        if court.policies.is_empty() {
            continue;
        }
        let by_date = granules_by_date(&court.granules);
        for window in &court.policies {
            for (date, times) in &by_date {
                if window.applies_on(*date) && covers(times, window) {
                    found.insert(CanonicalTimeslot::new(
                        feed.facility_id.clone(),
                        *date,
                        window.start,
                        window.end,
                    ));
                }
            }
        }
    }

    found.into_iter().collect()
}

/// Instant-bookable, and not dedicated to excluded sports.
pub fn is_eligible(court: &Court, opts: &ExtractOptions) -> bool {
    if !court.instant_bookable {
        return false;
    }
    let excluded_only = !court.sport_ids.is_empty()
        && court
            .sport_ids
            .iter()
            .all(|s| opts.excluded_sports.contains(s));
    !excluded_only
}

/// Group granule start times by calendar date, sorted on both levels.
pub fn granules_by_date(granules: &[Granule]) -> BTreeMap<NaiveDate, BTreeSet<LocalTime>> {
    let mut by_date: BTreeMap<NaiveDate, BTreeSet<LocalTime>> = BTreeMap::new();
    for g in granules {
        by_date.entry(g.date).or_default().insert(g.time);
    }
    by_date
}

/// True if `times` holds an unbroken granule chain from `window.start`
/// reaching or passing `window.end`.
pub fn covers(times: &BTreeSet<LocalTime>, window: &PolicyWindow) -> bool {
    if window.start >= window.end {
        return false;
    }
    let mut cursor = window.start;
    loop {
        if !times.contains(&cursor) {
            return false;
        }
        cursor = cursor.plus_minutes(GRANULE_MINUTES);
        if cursor >= window.end {
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MONDAY: &str = "2025-06-02";
    const TUESDAY: &str = "2025-06-03";
    const MON: u8 = 2;

    fn t(h: u16, m: u16) -> LocalTime {
        LocalTime::from_hm(h, m).unwrap()
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn granules(date: &str, times: &[(u16, u16)]) -> Vec<Granule> {
        times.iter().map(|&(h, m)| Granule::new(d(date), t(h, m))).collect()
    }

    fn court(id: &str, granules: Vec<Granule>, policies: Vec<PolicyWindow>) -> Court {
        Court {
            id: id.into(),
            instant_bookable: true,
            sport_ids: vec!["tennis".into()],
            granules,
            policies,
        }
    }

    fn feed(courts: Vec<Court>) -> FacilityFeed {
        FacilityFeed {
            facility_id: "fac".into(),
            courts,
        }
    }

    fn window(start: LocalTime, end: LocalTime) -> PolicyWindow {
        PolicyWindow::new(MON, start, end)
    }

    #[test]
    fn two_granules_cover_an_hour() {
        let f = feed(vec![court(
            "c1",
            granules(MONDAY, &[(9, 0), (9, 30)]),
            vec![window(t(9, 0), t(10, 0))],
        )]);
        let slots = extract_timeslots(&f, &ExtractOptions::default());
        assert_eq!(slots, vec![CanonicalTimeslot::new("fac", d(MONDAY), t(9, 0), t(10, 0))]);
    }

    #[test]
    fn missing_successor_breaks_chain() {
        let f = feed(vec![court(
            "c1",
            granules(MONDAY, &[(9, 0), (10, 0)]),
            vec![window(t(9, 0), t(10, 30))],
        )]);
        assert!(extract_timeslots(&f, &ExtractOptions::default()).is_empty());
    }

    #[test]
    fn partial_coverage_is_not_a_timeslot() {
        let f = feed(vec![court(
            "c1",
            granules(MONDAY, &[(9, 0), (9, 30)]),
            vec![window(t(9, 0), t(11, 0))],
        )]);
        assert!(extract_timeslots(&f, &ExtractOptions::default()).is_empty());
    }

    #[test]
    fn chain_must_start_exactly_at_window_start() {
        let f = feed(vec![court(
            "c1",
            granules(MONDAY, &[(9, 30), (10, 0)]),
            vec![window(t(9, 0), t(10, 0))],
        )]);
        assert!(extract_timeslots(&f, &ExtractOptions::default()).is_empty());
    }

    #[test]
    fn extra_granules_around_window_are_fine() {
        let f = feed(vec![court(
            "c1",
            granules(MONDAY, &[(8, 0), (8, 30), (9, 0), (9, 30), (10, 0)]),
            vec![window(t(9, 0), t(10, 0))],
        )]);
        assert_eq!(extract_timeslots(&f, &ExtractOptions::default()).len(), 1);
    }

    #[test]
    fn courts_covering_same_window_deduplicate() {
        let g = granules(MONDAY, &[(9, 0), (9, 30)]);
        let w = vec![window(t(9, 0), t(10, 0))];
        let f = feed(vec![court("c1", g.clone(), w.clone()), court("c2", g, w)]);
        assert_eq!(extract_timeslots(&f, &ExtractOptions::default()).len(), 1);
    }

    #[test]
    fn one_covering_court_is_enough() {
        let w = vec![window(t(9, 0), t(10, 0))];
        let f = feed(vec![
            court("c1", granules(MONDAY, &[(9, 0)]), w.clone()),
            court("c2", granules(MONDAY, &[(9, 0), (9, 30)]), w),
        ]);
        assert_eq!(extract_timeslots(&f, &ExtractOptions::default()).len(), 1);
    }

    #[test]
    fn granules_split_across_courts_do_not_combine() {
        let w = vec![window(t(9, 0), t(10, 0))];
        let f = feed(vec![
            court("c1", granules(MONDAY, &[(9, 0)]), w.clone()),
            court("c2", granules(MONDAY, &[(9, 30)]), w),
        ]);
        assert!(extract_timeslots(&f, &ExtractOptions::default()).is_empty());
    }

    #[test]
    fn window_only_applies_on_its_weekday() {
        let f = feed(vec![court(
            "c1",
            granules(TUESDAY, &[(9, 0), (9, 30)]),
            vec![window(t(9, 0), t(10, 0))],
        )]);
        assert!(extract_timeslots(&f, &ExtractOptions::default()).is_empty());
    }

    #[test]
    fn court_without_policies_contributes_nothing() {
        let f = feed(vec![court("c1", granules(MONDAY, &[(9, 0), (9, 30)]), vec![])]);
        assert!(extract_timeslots(&f, &ExtractOptions::default()).is_empty());
    }

    #[test]
    fn non_instant_court_is_skipped() {
        let mut c = court("c1", granules(MONDAY, &[(9, 0)]), vec![window(t(9, 0), t(9, 30))]);
        c.instant_bookable = false;
        assert!(extract_timeslots(&feed(vec![c]), &ExtractOptions::default()).is_empty());
    }

    #[test]
    fn excluded_only_court_is_skipped() {
        let mut c = court("c1", granules(MONDAY, &[(9, 0)]), vec![window(t(9, 0), t(9, 30))]);
        c.sport_ids = vec![PICKLEBALL_SPORT_ID.into()];
        assert!(extract_timeslots(&feed(vec![c]), &ExtractOptions::default()).is_empty());
    }

    #[test]
    fn mixed_sport_court_is_kept() {
        let mut c = court("c1", granules(MONDAY, &[(9, 0)]), vec![window(t(9, 0), t(9, 30))]);
        c.sport_ids = vec![PICKLEBALL_SPORT_ID.into(), "tennis".into()];
        assert_eq!(extract_timeslots(&feed(vec![c]), &ExtractOptions::default()).len(), 1);
    }

    #[test]
    fn multiple_dates_and_windows() {
        let mut g = granules(MONDAY, &[(9, 0), (9, 30), (18, 0)]);
        g.extend(granules("2025-06-09", &[(9, 0), (9, 30)]));
        let f = feed(vec![court(
            "c1",
            g,
            vec![window(t(9, 0), t(10, 0)), window(t(18, 0), t(18, 30))],
        )]);
        let slots = extract_timeslots(&f, &ExtractOptions::default());
        assert_eq!(
            slots,
            vec![
                CanonicalTimeslot::new("fac", d(MONDAY), t(9, 0), t(10, 0)),
                CanonicalTimeslot::new("fac", d(MONDAY), t(18, 0), t(18, 30)),
                CanonicalTimeslot::new("fac", d("2025-06-09"), t(9, 0), t(10, 0)),
            ]
        );
    }

    #[test]
    fn window_ending_at_midnight() {
        let f = feed(vec![court(
            "c1",
            granules(MONDAY, &[(23, 0), (23, 30)]),
            vec![window(t(23, 0), LocalTime::MIDNIGHT)],
        )]);
        let slots = extract_timeslots(&f, &ExtractOptions::default());
        assert_eq!(slots[0].end, LocalTime::END_OF_DAY);
    }

    #[test]
    fn covers_handles_unaligned_end() {
        let times: BTreeSet<_> = [t(9, 0), t(9, 30)].into_iter().collect();
        // 09:00–09:45 is reached by the 09:30 granule.
        assert!(covers(&times, &window(t(9, 0), t(9, 45))));
    }

    #[test]
    fn empty_window_covers_nothing() {
        let times: BTreeSet<_> = [t(9, 0)].into_iter().collect();
        assert!(!covers(&times, &window(t(9, 0), t(9, 0))));
    }

    #[test]
    fn unordered_feed_is_handled() {
        let f = feed(vec![court(
            "c1",
            granules(MONDAY, &[(10, 0), (9, 0), (9, 30)]),
            vec![window(t(9, 0), t(10, 30))],
        )]);
        assert_eq!(extract_timeslots(&f, &ExtractOptions::default()).len(), 1);
    }
}
