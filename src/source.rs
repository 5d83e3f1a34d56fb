use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Deserializer};

use crate::error::FetchError;
use crate::model::*;

const FIXED_SLOTS_POLICY: &str = "fixed-slots";
const LOCATION_PATH_PREFIX: &str = "/locations/";

/// Raw availability for a facility. Implementations bound their own latency.
#[async_trait]
pub trait AvailabilitySource: Send + Sync {
    async fn fetch_facility(&self, facility: &Facility) -> Result<FacilityFeed, FetchError>;
}

// ── rec.us payload ───────────────────────────────────────────────

/// Upstream sends `null` about as often as it omits a field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Deserialize)]
pub struct LocationResponse {
    pub location: Location,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub courts: Vec<ApiCourt>,
    #[serde(default)]
    pub organization: Option<Organization>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCourt {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_instant_bookable: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub available_slots: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sports: Vec<ApiSport>,
    #[serde(default)]
    pub config: Option<CourtConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSport {
    pub sport_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourtConfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub booking_policies: Vec<BookingPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingPolicy {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub slots: Vec<PolicySlot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySlot {
    pub day_of_week: u8,
    pub start_time_local: String,
    pub end_time_local: String,
}

#[derive(Debug, Deserialize)]
pub struct Organization {
    #[serde(default)]
    pub config: Option<OrganizationConfig>,
}

#[derive(Debug, Deserialize)]
pub struct OrganizationConfig {
    #[serde(default)]
    pub banners: Option<Banners>,
}

#[derive(Debug, Deserialize)]
pub struct Banners {
    #[serde(default, deserialize_with = "null_as_default")]
    pub pages: HashMap<String, serde_json::Value>,
}

/// Convert an upstream location payload into a facility feed.
pub fn parse_location(facility_id: &str, location: Location) -> Result<FacilityFeed, FetchError> {
    let mut courts = Vec::with_capacity(location.courts.len());
    for court in location.courts {
        let granules = court
            .available_slots
            .iter()
            .map(|s| {
                Granule::parse(s).ok_or_else(|| {
                    FetchError::Malformed(format!("court {}: bad slot timestamp {s:?}", court.id))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut policies = Vec::new();
        let fixed = court
            .config
            .iter()
            .flat_map(|c| c.booking_policies.iter())
            .filter(|p| p.kind == FIXED_SLOTS_POLICY);
        for policy in fixed {
            for slot in &policy.slots {
                policies.push(parse_policy_slot(&court.id, slot)?);
            }
        }

        courts.push(Court {
            id: court.id,
            instant_bookable: court.is_instant_bookable,
            sport_ids: court.sports.into_iter().map(|s| s.sport_id).collect(),
            granules,
            policies,
        });
    }

    Ok(FacilityFeed {
        facility_id: facility_id.to_string(),
        courts,
    })
}

fn parse_policy_slot(court_id: &str, slot: &PolicySlot) -> Result<PolicyWindow, FetchError> {
    if !(1..=7).contains(&slot.day_of_week) {
        return Err(FetchError::Malformed(format!(
            "court {court_id}: day of week {} out of range",
            slot.day_of_week
        )));
    }
    let start = LocalTime::parse(&slot.start_time_local);
    let end = LocalTime::parse(&slot.end_time_local);
    match (start, end) {
        (Some(start), Some(end)) => Ok(PolicyWindow::new(slot.day_of_week, start, end)),
        _ => Err(FetchError::Malformed(format!(
            "court {court_id}: bad policy times {:?}-{:?}",
            slot.start_time_local, slot.end_time_local
        ))),
    }
}

/// Facility ids linked from the organization's `/locations/<id>` banner pages.
pub fn linked_facilities(location: &Location) -> Vec<String> {
    let mut ids: Vec<String> = location
        .organization
        .as_ref()
        .and_then(|o| o.config.as_ref())
        .and_then(|c| c.banners.as_ref())
        .map(|b| {
            b.pages
                .keys()
                .filter_map(|path| path.strip_prefix(LOCATION_PATH_PREFIX))
                .filter_map(|rest| rest.rsplit('/').next())
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    ids.sort();
    ids.dedup();
    ids
}

// ── HTTP source ──────────────────────────────────────────────────

pub struct RecApiSource {
    client: Client,
    base_url: String,
}

impl RecApiSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn location_url(&self, facility_id: &str) -> String {
        format!("{}/v1/locations/{facility_id}", self.base_url)
    }

    pub async fn fetch_location(&self, facility_id: &str) -> Result<Location, FetchError> {
        let resp = self
            .client
            .get(self.location_url(facility_id))
            .query(&[("publishedSites", "true")])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = resp.bytes().await?;
        let parsed: LocationResponse = serde_json::from_slice(&body)
            .map_err(|e| FetchError::Malformed(format!("location {facility_id}: {e}")))?;
        Ok(parsed.location)
    }

    /// Every facility reachable from `seed`, `seed` included.
    pub async fn discover_facilities(&self, seed: &str) -> Result<Vec<Facility>, FetchError> {
        let location = self.fetch_location(seed).await?;
        let mut ids = linked_facilities(&location);
        if !ids.iter().any(|id| id == seed) {
            ids.insert(0, seed.to_string());
        }
        let mut facilities = Vec::with_capacity(ids.len());
        for id in ids {
            let name = if id == location.id {
                location.name.clone()
            } else {
                self.fetch_location(&id).await?.name
            };
            facilities.push(Facility::new(id, name));
        }
        Ok(facilities)
    }
}

#[async_trait]
impl AvailabilitySource for RecApiSource {
    async fn fetch_facility(&self, facility: &Facility) -> Result<FacilityFeed, FetchError> {
        let location = self.fetch_location(&facility.id).await?;
        parse_location(&facility.id, location)
    }
}

// ── Static source ────────────────────────────────────────────────

/// Source serving preloaded feeds; unknown facilities fail with 404.
#[derive(Default)]
pub struct StaticSource {
    feeds: DashMap<String, FacilityFeed>,
    failing: DashMap<String, u16>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_feed(&self, feed: FacilityFeed) {
        self.failing.remove(&feed.facility_id);
        self.feeds.insert(feed.facility_id.clone(), feed);
    }

    /// Make fetches for `facility_id` fail with `status`.
    pub fn set_failing(&self, facility_id: &str, status: u16) {
        self.failing.insert(facility_id.to_string(), status);
    }
}

#[async_trait]
impl AvailabilitySource for StaticSource {
    async fn fetch_facility(&self, facility: &Facility) -> Result<FacilityFeed, FetchError> {
        if let Some(status) = self.failing.get(&facility.id) {
            return Err(FetchError::Status(*status));
        }
        self.feeds
            .get(&facility.id)
            .map(|f| f.value().clone())
            .ok_or(FetchError::Status(404))
    }
}
