use std::collections::{BTreeMap, HashSet};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::extract::{ExtractOptions, PICKLEBALL_SPORT_ID};
use crate::model::Facility;

const PREFIX: &str = "COURTWATCH_";

const DAY_SECS: u64 = 86_400;
const WEEK_SECS: u64 = 7 * DAY_SECS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("COURTWATCH_{0} is not set")]
    Missing(&'static str),
    #[error("COURTWATCH_{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Process configuration, read from `COURTWATCH_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub facilities: Vec<Facility>,
    /// Facility id to that facility's own webhook. Others use `webhook_url`.
    pub facility_webhooks: BTreeMap<String, String>,
    pub api_base: String,
    /// Unset means unrouted notifications only go to the log.
    pub webhook_url: Option<String>,
    pub data_dir: PathBuf,
    pub interval: Duration,
    pub lease: Duration,
    pub retract_after: Duration,
    pub fetch_timeout: Duration,
    pub excluded_sports: HashSet<String>,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(format!("{PREFIX}{name}")).ok())
    }

    /// Build from a lookup of unprefixed variable names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let (facilities, facility_webhooks) = match lookup("FACILITIES") {
            Some(raw) => parse_facilities(&raw).ok_or(ConfigError::Invalid {
                name: "FACILITIES",
                value: raw,
            })?,
            None => (Vec::new(), BTreeMap::new()),
        };
        let excluded_sports = match lookup("EXCLUDED_SPORTS") {
            Some(raw) => split_list(&raw).map(str::to_string).collect(),
            None => HashSet::from([PICKLEBALL_SPORT_ID.to_string()]),
        };

        Ok(Self {
            facilities,
            facility_webhooks,
            api_base: lookup("API_BASE").unwrap_or_else(|| "https://api.rec.us".into()),
            webhook_url: lookup("WEBHOOK_URL").filter(|s| !s.trim().is_empty()),
            data_dir: PathBuf::from(lookup("DATA_DIR").unwrap_or_else(|| "./data".into())),
            interval: parse_secs(&lookup, "INTERVAL_SECS", 15, 1..=DAY_SECS)?,
            lease: parse_secs(&lookup, "LEASE_SECS", 600, 1..=DAY_SECS)?,
            retract_after: parse_secs(&lookup, "RETRACT_AFTER_SECS", 600, 0..=WEEK_SECS)?,
            fetch_timeout: parse_secs(&lookup, "FETCH_TIMEOUT_SECS", 10, 1..=300)?,
            excluded_sports,
            compact_threshold: parse_in(&lookup, "COMPACT_THRESHOLD", 1000, 1..=u64::MAX)?,
            metrics_port: lookup("METRICS_PORT")
                .map(|raw| {
                    raw.trim().parse().map_err(|_| ConfigError::Invalid {
                        name: "METRICS_PORT",
                        value: raw,
                    })
                })
                .transpose()?,
        })
    }

    /// Facilities, or an error if none are configured.
    pub fn require_facilities(&self) -> Result<&[Facility], ConfigError> {
        if self.facilities.is_empty() {
            Err(ConfigError::Missing("FACILITIES"))
        } else {
            Ok(&self.facilities)
        }
    }

    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            excluded_sports: self.excluded_sports.clone(),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("timeslots.wal")
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => Ok(default),
    }
}

/// Like `parse_or`, rejecting values outside `range`.
fn parse_in(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let value = parse_or(lookup, name, default)?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        })
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<Duration, ConfigError> {
    parse_in(lookup, name, default, range).map(Duration::from_secs)
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parse `id[=name][@webhook],...`. Duplicate ids keep the first entry.
pub fn parse_facilities(raw: &str) -> Option<(Vec<Facility>, BTreeMap<String, String>)> {
    let mut seen = HashSet::new();
    let mut facilities = Vec::new();
    let mut webhooks = BTreeMap::new();
    for entry in split_list(raw) {
        let (entry, webhook) = match entry.split_once('@') {
            Some((entry, url)) => (entry.trim(), Some(url.trim()).filter(|u| !u.is_empty())),
            None => (entry, None),
        };
        let (id, name) = match entry.split_once('=') {
            Some((id, name)) => (id.trim(), Some(name.trim().to_string()).filter(|n| !n.is_empty())),
            None => (entry, None),
        };
        if id.is_empty() || id.contains('/') {
            return None;
        }
        if seen.insert(id.to_string()) {
            if let Some(url) = webhook {
                webhooks.insert(id.to_string(), url.to_string());
            }
            facilities.push(Facility::new(id, name));
        }
    }
    Some((facilities, webhooks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]).unwrap();
        assert!(c.facilities.is_empty());
        assert!(c.facility_webhooks.is_empty());
        assert_eq!(c.api_base, "https://api.rec.us");
        assert_eq!(c.webhook_url, None);
        assert_eq!(c.interval, Duration::from_secs(15));
        assert_eq!(c.lease, Duration::from_secs(600));
        assert_eq!(c.retract_after, Duration::from_secs(600));
        assert_eq!(c.fetch_timeout, Duration::from_secs(10));
        assert!(c.excluded_sports.contains(PICKLEBALL_SPORT_ID));
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.wal_path(), PathBuf::from("./data/timeslots.wal"));
    }

    #[test]
    fn facilities_with_optional_names() {
        let c = config(&[("FACILITIES", "loc-1=Golden Gate Park, loc-2 ,loc-1=dup")]).unwrap();
        assert_eq!(
            c.facilities,
            vec![
                Facility::new("loc-1", Some("Golden Gate Park".into())),
                Facility::new("loc-2", None),
            ]
        );
    }

    #[test]
    fn empty_facility_id_is_invalid() {
        assert!(matches!(
            config(&[("FACILITIES", "=Nameless")]),
            Err(ConfigError::Invalid { name: "FACILITIES", .. })
        ));
    }

    #[test]
    fn require_facilities_reports_missing() {
        let c = config(&[]).unwrap();
        assert_eq!(c.require_facilities(), Err(ConfigError::Missing("FACILITIES")));
        assert_eq!(
            ConfigError::Missing("FACILITIES").to_string(),
            "COURTWATCH_FACILITIES is not set"
        );
    }

    #[test]
    fn numeric_overrides_and_errors() {
        let c = config(&[("INTERVAL_SECS", "60"), ("METRICS_PORT", "9100")]).unwrap();
        assert_eq!(c.interval, Duration::from_secs(60));
        assert_eq!(c.metrics_port, Some(9100));

        assert_eq!(
            config(&[("LEASE_SECS", "ten")]),
            Err(ConfigError::Invalid {
                name: "LEASE_SECS",
                value: "ten".into()
            })
        );
    }

    #[test]
    fn facility_webhooks_route_per_facility() {
        let c = config(&[(
            "FACILITIES",
            "loc-1=Dolores Park@https://discord.test/api/webhooks/1/a, loc-2@https://discord.test/api/webhooks/2/b, loc-3",
        )])
        .unwrap();
        assert_eq!(
            c.facilities,
            vec![
                Facility::new("loc-1", Some("Dolores Park".into())),
                Facility::new("loc-2", None),
                Facility::new("loc-3", None),
            ]
        );
        assert_eq!(
            c.facility_webhooks,
            BTreeMap::from([
                ("loc-1".to_string(), "https://discord.test/api/webhooks/1/a".to_string()),
                ("loc-2".to_string(), "https://discord.test/api/webhooks/2/b".to_string()),
            ])
        );
    }

    #[test]
    fn facility_id_with_slash_is_invalid() {
        assert!(matches!(
            config(&[("FACILITIES", "a/b")]),
            Err(ConfigError::Invalid { name: "FACILITIES", .. })
        ));
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert_eq!(
            config(&[("INTERVAL_SECS", "0")]),
            Err(ConfigError::Invalid {
                name: "INTERVAL_SECS",
                value: "0".into()
            })
        );
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        for name in ["INTERVAL_SECS", "LEASE_SECS", "FETCH_TIMEOUT_SECS", "RETRACT_AFTER_SECS"] {
            assert!(
                matches!(config(&[(name, "18446744073709551615")]), Err(ConfigError::Invalid { .. })),
                "{name}"
            );
        }
        assert!(matches!(
            config(&[("LEASE_SECS", "0")]),
            Err(ConfigError::Invalid { name: "LEASE_SECS", .. })
        ));
        assert!(matches!(
            config(&[("FETCH_TIMEOUT_SECS", "0")]),
            Err(ConfigError::Invalid { name: "FETCH_TIMEOUT_SECS", .. })
        ));
        assert!(matches!(
            config(&[("RETRACT_AFTER_SECS", "63072000")]),
            Err(ConfigError::Invalid { name: "RETRACT_AFTER_SECS", .. })
        ));
        assert!(matches!(
            config(&[("COMPACT_THRESHOLD", "0")]),
            Err(ConfigError::Invalid { name: "COMPACT_THRESHOLD", .. })
        ));
    }

    #[test]
    fn range_edges_are_accepted() {
        let c = config(&[
            ("INTERVAL_SECS", "1"),
            ("LEASE_SECS", "86400"),
            ("RETRACT_AFTER_SECS", "0"),
            ("FETCH_TIMEOUT_SECS", "300"),
        ])
        .unwrap();
        assert_eq!(c.interval, Duration::from_secs(1));
        assert_eq!(c.lease, Duration::from_secs(DAY_SECS));
        assert_eq!(c.retract_after, Duration::ZERO);
        assert_eq!(c.fetch_timeout, Duration::from_secs(300));
    }

    #[test]
    fn excluded_sports_override() {
        let c = config(&[("EXCLUDED_SPORTS", "a, b,")]).unwrap();
        assert_eq!(c.excluded_sports, HashSet::from(["a".to_string(), "b".to_string()]));
        assert!(c.extract_options().excluded_sports.contains("b"));
    }

    #[test]
    fn blank_webhook_means_dry_run() {
        let c = config(&[("WEBHOOK_URL", "  ")]).unwrap();
        assert_eq!(c.webhook_url, None);
    }
}
