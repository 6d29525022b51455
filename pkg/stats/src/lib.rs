use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate};
use graph::GraphError;
use schema::{Citizen, CitizenId};
use serde::Serialize;

/// The aggregations served per batch; also the cache key discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AggregateKind {
    GiftMonths,
    AgePercentiles,
}

impl AggregateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GiftMonths => "gift_months",
            Self::AgePercentiles => "age_percentiles",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GiftCount {
    pub citizen_id: CitizenId,
    pub gifts: u32,
}

/// Month number (1..=12) to the citizens buying gifts that month.
/// All twelve months are always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct GiftMonths(BTreeMap<u32, Vec<GiftCount>>);

impl GiftMonths {
    pub fn month(&self, month: u32) -> &[GiftCount] {
        self.0.get(&month).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total_gifts(&self) -> u64 {
        self.0
            .values()
            .flatten()
            .map(|entry| u64::from(entry.gifts))
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[GiftCount])> {
        self.0.iter().map(|(month, entries)| (*month, entries.as_slice()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TownAgePercentiles {
    pub town: String,
    pub p50: f64,
    pub p75: f64,
    pub p99: f64,
}

/// Every citizen buys one gift per relative, in the month of that relative's
/// birthday.
pub fn gift_months(citizens: &[Citizen]) -> Result<GiftMonths, GraphError> {
    let birth_months: HashMap<CitizenId, u32> = citizens
        .iter()
        .map(|citizen| (citizen.citizen_id, citizen.birth_date.month()))
        .collect();

    // month -> citizen -> gifts
    let mut buckets: BTreeMap<u32, BTreeMap<CitizenId, u32>> =
        (1..=12).map(|month| (month, BTreeMap::new())).collect();
    for citizen in citizens {
        for relative_id in &citizen.relatives {
            let month = birth_months.get(relative_id).copied().ok_or(
                GraphError::UnknownRelative {
                    citizen_id: citizen.citizen_id,
                    relative_id: *relative_id,
                },
            )?;
            *buckets
                .entry(month)
                .or_default()
                .entry(citizen.citizen_id)
                .or_insert(0) += 1;
        }
    }

    Ok(GiftMonths(
        buckets
            .into_iter()
            .map(|(month, givers)| {
                let entries = givers
                    .into_iter()
                    .map(|(citizen_id, gifts)| GiftCount { citizen_id, gifts })
                    .collect();
                (month, entries)
            })
            .collect(),
    ))
}

/// Full years elapsed between `birth_date` and `reference`.
pub fn age_in_years(birth_date: NaiveDate, reference: NaiveDate) -> u32 {
    let mut years = reference.year() - birth_date.year();
    if (reference.month(), reference.day()) < (birth_date.month(), birth_date.day()) {
        years -= 1;
    }
    years.max(0) as u32
}

/// Linear interpolation between the two closest ranks over sorted input,
/// `rank = p / 100 * (n - 1)`. Returns 0 for empty input.
pub fn percentile_linear(sorted: &[f64], percentile: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let rank = (percentile / 100.0).clamp(0.0, 1.0) * (len - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let fraction = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
        }
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn age_percentiles(citizens: &[Citizen], reference: NaiveDate) -> Vec<TownAgePercentiles> {
    let mut ages_by_town: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for citizen in citizens {
        ages_by_town
            .entry(citizen.town.as_str())
            .or_default()
            .push(f64::from(age_in_years(citizen.birth_date, reference)));
    }

    ages_by_town
        .into_iter()
        .map(|(town, mut ages)| {
            ages.sort_by(f64::total_cmp);
            TownAgePercentiles {
                town: town.to_string(),
                p50: round2(percentile_linear(&ages, 50.0)),
                p75: round2(percentile_linear(&ages, 75.0)),
                p99: round2(percentile_linear(&ages, 99.0)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn citizen(id: CitizenId, born: NaiveDate, town: &str, relatives: &[CitizenId]) -> Citizen {
        Citizen::new(id, "Citizen", born, town, relatives.iter().copied())
    }

    #[test]
    fn gift_months_buckets_by_relative_birth_month() {
        let citizens = vec![
            citizen(1, date(1986, 12, 26), "Moscow", &[2, 3]),
            citizen(2, date(1990, 4, 17), "Moscow", &[1]),
            citizen(3, date(1995, 4, 1), "Kazan", &[1]),
        ];
        let months = gift_months(&citizens).unwrap();

        assert_eq!(months.iter().count(), 12);
        assert_eq!(
            months.month(4),
            &[GiftCount {
                citizen_id: 1,
                gifts: 2
            }]
        );
        assert_eq!(
            months.month(12),
            &[
                GiftCount {
                    citizen_id: 2,
                    gifts: 1
                },
                GiftCount {
                    citizen_id: 3,
                    gifts: 1
                },
            ]
        );
        assert!(months.month(1).is_empty());
    }

    #[test]
    fn total_gifts_equals_sum_of_relative_set_sizes() {
        let citizens = vec![
            citizen(1, date(1980, 1, 5), "A", &[2, 3, 4]),
            citizen(2, date(1981, 2, 5), "A", &[1, 3]),
            citizen(3, date(1982, 2, 9), "B", &[1, 2]),
            citizen(4, date(1983, 7, 1), "B", &[1]),
            citizen(5, date(1984, 7, 1), "B", &[]),
        ];
        let expected: usize = citizens.iter().map(|c| c.relatives.len()).sum();
        let months = gift_months(&citizens).unwrap();
        assert_eq!(months.total_gifts(), expected as u64);
        assert!(months.iter().flat_map(|(_, e)| e).all(|e| e.citizen_id != 5));
    }

    #[test]
    fn gift_months_reports_dangling_relative() {
        let citizens = vec![citizen(1, date(1980, 1, 5), "A", &[9])];
        assert_eq!(
            gift_months(&citizens),
            Err(GraphError::UnknownRelative {
                citizen_id: 1,
                relative_id: 9
            })
        );
    }

    #[test]
    fn gift_months_serializes_month_keys_as_strings() {
        let months = gift_months(&[citizen(1, date(1980, 1, 5), "A", &[])]).unwrap();
        let json = serde_json::to_string(&months).unwrap();
        assert!(json.starts_with("{\"1\":[],\"2\":[]"));
        assert!(json.ends_with("\"12\":[]}"));
    }

    #[test]
    fn age_counts_only_completed_years() {
        let reference = date(2024, 6, 15);
        assert_eq!(age_in_years(date(2000, 6, 15), reference), 24);
        assert_eq!(age_in_years(date(2000, 6, 16), reference), 23);
        assert_eq!(age_in_years(date(2024, 6, 15), reference), 0);
        assert_eq!(age_in_years(date(2000, 2, 29), date(2023, 2, 28)), 22);
        assert_eq!(age_in_years(date(2000, 2, 29), date(2023, 3, 1)), 23);
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let values = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile_linear(&values, 50.0), 25.0);
        assert_eq!(percentile_linear(&values, 75.0), 32.5);
        assert!((percentile_linear(&values, 99.0) - 39.7).abs() < 1e-9);
        assert_eq!(percentile_linear(&[7.0], 99.0), 7.0);
        assert_eq!(percentile_linear(&[], 50.0), 0.0);
    }

    #[test]
    fn age_percentiles_groups_by_town_in_order() {
        let reference = date(2024, 1, 1);
        let citizens = vec![
            citizen(1, date(1994, 1, 1), "Moscow", &[]),
            citizen(2, date(2004, 1, 1), "Moscow", &[]),
            citizen(3, date(1984, 1, 1), "Kazan", &[]),
            citizen(4, date(1974, 1, 2), "Moscow", &[]),
        ];
        let stats = age_percentiles(&citizens, reference);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].town, "Kazan");
        assert_eq!((stats[0].p50, stats[0].p75, stats[0].p99), (40.0, 40.0, 40.0));

        // Moscow ages: 20, 30, 49
        assert_eq!(stats[1].town, "Moscow");
        assert_eq!(stats[1].p50, 30.0);
        assert_eq!(stats[1].p75, 39.5);
        assert_eq!(stats[1].p99, 48.62);
        for town in &stats {
            assert!(town.p50 <= town.p75 && town.p75 <= town.p99);
        }
    }

    #[test]
    fn age_percentiles_ignore_input_order() {
        let reference = date(2024, 1, 1);
        let mut citizens = vec![
            citizen(1, date(1994, 3, 1), "A", &[]),
            citizen(2, date(1961, 7, 9), "B", &[]),
            citizen(3, date(2001, 1, 1), "A", &[]),
            citizen(4, date(1950, 5, 5), "A", &[]),
        ];
        let forward = age_percentiles(&citizens, reference);
        citizens.reverse();
        assert_eq!(age_percentiles(&citizens, reference), forward);
    }
}
