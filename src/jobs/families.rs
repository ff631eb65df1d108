//! Entity families served by JSON catalog sources
//!
//! Each family is a [`FamilyDescriptor`]: which fields to keep, which of them
//! a record needs before it counts as complete, and an optional normalizer
//! for source-specific value shapes. [`CatalogFamily`] turns a descriptor
//! plus a [`JsonCatalogSource`] into a [`SyncFamily`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Number, Value};

use super::source::{JsonCatalogSource, ListingItem};
use crate::clock::Clock;
use crate::database::RecordStore;
use crate::error::{DbError, SyncError};
use crate::models::{is_empty_value, EntityKind, FieldMap, LocalRecord, UpsertOutcome};
use crate::sync::{merge_upsert, CatalogPage, LocalIndex, RemoteItem, SyncFamily, SyncTarget};

/// Source-specific cleanup applied before a record is built
pub type Normalizer = fn(&mut FieldMap) -> Result<(), SyncError>;

/// Static description of one entity family
#[derive(Debug, Clone, Copy)]
pub struct FamilyDescriptor {
    /// Job name, also the config key under `sources`
    pub name: &'static str,
    /// Entity kind written
    pub kind: EntityKind,
    /// Detail fields copied into the record
    pub fields: &'static [&'static str],
    /// Fields a complete record has
    pub required_fields: &'static [&'static str],
    /// Records never change once complete, so age alone never makes them stale
    pub immutable: bool,
    /// Requests need a bearer token
    pub authenticated: bool,
    /// Value cleanup
    pub normalize: Option<Normalizer>,
}

/// Teams and organizations
pub const ORGANIZATIONS: FamilyDescriptor = FamilyDescriptor {
    name: "organizations",
    kind: EntityKind::Organization,
    fields: &["name", "region", "country", "logo_url", "website", "founded"],
    required_fields: &["name"],
    immutable: false,
    authenticated: false,
    normalize: Some(normalize_organization),
};

/// Player profiles from the game-platform API
pub const PLAYERS: FamilyDescriptor = FamilyDescriptor {
    name: "players",
    kind: EntityKind::Player,
    fields: &["name", "real_name", "country", "team", "role", "socials"],
    required_fields: &["name", "country"],
    immutable: false,
    authenticated: true,
    normalize: None,
};

/// Tournaments and events
pub const TOURNAMENTS: FamilyDescriptor = FamilyDescriptor {
    name: "tournaments",
    kind: EntityKind::Tournament,
    fields: &[
        "name",
        "start_date",
        "end_date",
        "prize_pool",
        "region",
        "tier",
        "status",
    ],
    required_fields: &["name", "start_date"],
    immutable: false,
    authenticated: false,
    normalize: Some(normalize_tournament),
};

/// Prize-money results
pub const EARNINGS: FamilyDescriptor = FamilyDescriptor {
    name: "earnings",
    kind: EntityKind::Earning,
    fields: &["player", "tournament", "placement", "amount", "currency", "date"],
    required_fields: &["player", "tournament", "amount"],
    immutable: true,
    authenticated: false,
    normalize: Some(normalize_earning),
};

/// Roster moves
pub const TRANSFERS: FamilyDescriptor = FamilyDescriptor {
    name: "transfers",
    kind: EntityKind::Transfer,
    fields: &["player", "from_team", "to_team", "date", "kind"],
    required_fields: &["player", "date"],
    immutable: true,
    authenticated: false,
    normalize: Some(normalize_transfer),
};

/// Every family in dependency order
pub const ALL_FAMILIES: [&FamilyDescriptor; 5] =
    [&ORGANIZATIONS, &PLAYERS, &TOURNAMENTS, &EARNINGS, &TRANSFERS];

/// Look up a family by job name
pub fn descriptor(name: &str) -> Option<&'static FamilyDescriptor> {
    ALL_FAMILIES.iter().copied().find(|d| d.name == name)
}

fn normalize_organization(fields: &mut FieldMap) -> Result<(), SyncError> {
    if let Some(Value::String(region)) = fields.get_mut("region") {
        *region = region.trim().to_ascii_uppercase();
    }
    Ok(())
}

fn normalize_tournament(fields: &mut FieldMap) -> Result<(), SyncError> {
    for key in ["start_date", "end_date"] {
        normalize_date(fields, key)?;
    }
    if let Some(pool) = fields.get("prize_pool").cloned() {
        fields.insert("prize_pool".to_string(), parse_amount(&pool)?);
    }
    Ok(())
}

fn normalize_earning(fields: &mut FieldMap) -> Result<(), SyncError> {
    if let Some(amount) = fields.get("amount").cloned() {
        fields.insert("amount".to_string(), parse_amount(&amount)?);
    }
    normalize_date(fields, "date")
}

fn normalize_transfer(fields: &mut FieldMap) -> Result<(), SyncError> {
    normalize_date(fields, "date")
}

/// Accept `1234.5`, `"1234.5"` or `"$1,234.50"`
fn parse_amount(value: &Value) -> Result<Value, SyncError> {
    match value {
        Value::Number(_) | Value::Null => Ok(value.clone()),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            if cleaned.is_empty() {
                return Ok(Value::Null);
            }
            cleaned
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| SyncError::InvalidData(format!("unparsable amount: {}", s)))
        }
        other => Err(SyncError::InvalidData(format!("unexpected amount: {}", other))),
    }
}

/// Reduce RFC 3339 timestamps to `YYYY-MM-DD`
fn normalize_date(fields: &mut FieldMap, key: &str) -> Result<(), SyncError> {
    let Some(Value::String(raw)) = fields.get(key) else {
        return Ok(());
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(());
    }

    let date = match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => dt.date_naive(),
        Err(_) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| SyncError::InvalidData(format!("unparsable {}: {}", key, raw)))?,
    };
    fields.insert(key.to_string(), Value::String(date.format("%Y-%m-%d").to_string()));
    Ok(())
}

/// A [`SyncFamily`] backed by a JSON catalog source
pub struct CatalogFamily {
    descriptor: &'static FamilyDescriptor,
    source: JsonCatalogSource,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    stale_after: chrono::Duration,
    deactivate_missing: bool,
}

impl CatalogFamily {
    /// Create a family
    pub fn new(
        descriptor: &'static FamilyDescriptor,
        source: JsonCatalogSource,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            descriptor,
            source,
            store,
            clock,
            stale_after,
            deactivate_missing: false,
        }
    }

    /// Mark records absent from complete listings as inactive
    pub fn with_deactivate_missing(mut self, enabled: bool) -> Self {
        self.deactivate_missing = enabled;
        self
    }

    fn target(&self, item: ListingItem) -> SyncTarget {
        let canonical = item
            .slug
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| item.id.clone());

        let mut target = SyncTarget::new(canonical)
            .with_locator(item.id.clone())
            .with_hint(item.updated_at)
            .with_alias(format!("{}:{}", self.descriptor.name, item.id));
        target.parent = item.parent.filter(|p| !p.trim().is_empty());
        target
    }
}

#[async_trait]
impl SyncFamily for CatalogFamily {
    fn name(&self) -> &str {
        self.descriptor.name
    }

    fn kind(&self) -> EntityKind {
        self.descriptor.kind
    }

    fn host_key(&self) -> String {
        self.source.host_key()
    }

    fn required_fields(&self) -> &[&'static str] {
        self.descriptor.required_fields
    }

    fn deactivate_missing(&self) -> bool {
        self.deactivate_missing
    }

    async fn list_catalog(&self, continuation: Option<String>) -> Result<CatalogPage, SyncError> {
        let page = self.source.list(continuation.as_deref()).await?;
        Ok(CatalogPage {
            targets: page.items.into_iter().map(|i| self.target(i)).collect(),
            next: page.next,
        })
    }

    fn is_stale(&self, target: &SyncTarget, index: &LocalIndex) -> bool {
        let max_age = (!self.descriptor.immutable).then_some(self.stale_after);
        index.is_stale(target, self.clock.utc_now(), max_age)
    }

    async fn fetch_detail(&self, target: &SyncTarget) -> Result<Option<RemoteItem>, SyncError> {
        self.source.detail(&target.remote_locator).await
    }

    fn to_local_record(
        &self,
        target: &SyncTarget,
        item: RemoteItem,
    ) -> Result<LocalRecord, SyncError> {
        let Value::Object(mut object) = item else {
            return Err(SyncError::InvalidData(format!(
                "{} detail is not an object",
                target.remote_locator
            )));
        };

        let mut fields: FieldMap = self
            .descriptor
            .fields
            .iter()
            .filter_map(|name| object.remove(*name).map(|v| (name.to_string(), v)))
            .filter(|(_, v)| !is_empty_value(v))
            .collect();

        if let Some(normalize) = self.descriptor.normalize {
            normalize(&mut fields)?;
        }
        fields.retain(|_, v| !is_empty_value(v));

        if let Some(missing) = self
            .descriptor
            .required_fields
            .iter()
            .find(|f| !fields.contains_key(**f))
        {
            return Err(SyncError::InvalidData(format!(
                "{} is missing required field {}",
                target.remote_locator, missing
            )));
        }

        let updated_at = ["updated_at", "updatedAt", "last_modified"]
            .iter()
            .filter_map(|k| object.get(*k).and_then(Value::as_str))
            .find_map(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .or(target.completeness_hint);

        let mut record = LocalRecord::new(self.descriptor.kind, &target.canonical_id, self.descriptor.name)
            .with_source_updated_at(updated_at);
        record.fields = fields;
        record.last_reconciled_at = self.clock.utc_now();
        Ok(record)
    }

    async fn upsert(&self, record: &LocalRecord) -> Result<UpsertOutcome, DbError> {
        merge_upsert(self.store.as_ref(), record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{HttpConfig, RateLimitConfig, SourceConfig};
    use crate::database::SqliteDatabase;
    use crate::sync::{HostRateLimiter, RemoteClient};
    use serde_json::json;

    async fn family(descriptor: &'static FamilyDescriptor) -> CatalogFamily {
        family_on(descriptor, Arc::new(ManualClock::new())).await
    }

    async fn family_on(descriptor: &'static FamilyDescriptor, clock: Arc<ManualClock>) -> CatalogFamily {
        let limiter = Arc::new(HostRateLimiter::new(RateLimitConfig::default(), clock.clone()));
        let client = Arc::new(RemoteClient::new(&HttpConfig::default(), limiter).unwrap());
        let config = SourceConfig {
            enabled: true,
            base_url: "https://data.example.com".to_string(),
            list_path: None,
            detail_path: None,
            interval_secs: 3600,
            deactivate_missing: false,
        };
        let source = JsonCatalogSource::new(&config, client, None).unwrap();
        let store = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        CatalogFamily::new(descriptor, source, store, clock, chrono::Duration::days(1))
    }

    // Test 1: Families are found by name
    #[test]
    fn test_descriptor_lookup() {
        assert_eq!(descriptor("players").unwrap().kind, EntityKind::Player);
        assert!(descriptor("players").unwrap().authenticated);
        assert!(descriptor("fantasy").is_none());
        assert_eq!(ALL_FAMILIES.len(), EntityKind::ALL.len());
    }

    // Test 2: Listing items become targets with alias and parent
    #[tokio::test]
    async fn test_listing_item_to_target() {
        let f = family(&PLAYERS).await;
        let target = f.target(ListingItem {
            id: "42".to_string(),
            slug: Some("bugha".to_string()),
            updated_at: None,
            parent: Some("dignitas".to_string()),
        });
        assert_eq!(target.canonical_id, "bugha");
        assert_eq!(target.remote_locator, "42");
        assert_eq!(target.alias.as_deref(), Some("players:42"));
        assert_eq!(target.parent.as_deref(), Some("dignitas"));

        let bare = f.target(ListingItem {
            id: "43".to_string(),
            slug: Some(" ".to_string()),
            updated_at: None,
            parent: None,
        });
        assert_eq!(bare.canonical_id, "43");
    }

    // Test 3: Detail payload keeps only known fields
    #[tokio::test]
    async fn test_to_local_record() {
        let f = family(&PLAYERS).await;
        let record = f
            .to_local_record(
                &SyncTarget::new("bugha"),
                json!({
                    "name": "Bugha",
                    "country": "US",
                    "team": "",
                    "password": "nope",
                    "updated_at": "2024-05-01T10:00:00Z"
                }),
            )
            .unwrap();

        assert_eq!(record.canonical_id, "bugha");
        assert_eq!(record.source, "players");
        assert_eq!(record.field_str("name"), Some("Bugha"));
        assert!(record.field("team").is_none());
        assert!(record.field("password").is_none());
        assert!(record.source_updated_at.is_some());
    }

    // Test 4: Missing required field is rejected
    #[tokio::test]
    async fn test_missing_required_field() {
        let f = family(&PLAYERS).await;
        let err = f
            .to_local_record(&SyncTarget::new("x"), json!({"name": "No Country"}))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidData(msg) if msg.contains("country")));

        let err = f
            .to_local_record(&SyncTarget::new("x"), json!("just a string"))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidData(_)));
    }

    // Test 5: Earnings amounts and dates are normalized
    #[tokio::test]
    async fn test_earning_normalization() {
        let f = family(&EARNINGS).await;
        let record = f
            .to_local_record(
                &SyncTarget::new("e1"),
                json!({
                    "player": "bugha",
                    "tournament": "fnwc-2019",
                    "amount": "$3,000,000.00",
                    "date": "2019-07-28T18:00:00Z"
                }),
            )
            .unwrap();
        assert_eq!(record.field("amount"), Some(&json!(3000000.0)));
        assert_eq!(record.field_str("date"), Some("2019-07-28"));

        let err = f
            .to_local_record(
                &SyncTarget::new("e2"),
                json!({"player": "p", "tournament": "t", "amount": "1.2.3"}),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidData(_)));
    }

    // Test 6: Organization region is upper-cased
    #[tokio::test]
    async fn test_organization_normalization() {
        let f = family(&ORGANIZATIONS).await;
        let record = f
            .to_local_record(
                &SyncTarget::new("falcons"),
                json!({"name": "Team Falcons", "region": " mena "}),
            )
            .unwrap();
        assert_eq!(record.field_str("region"), Some("MENA"));
    }

    // Test 7: Immutable families ignore record age
    #[tokio::test]
    async fn test_immutable_staleness() {
        let mut old = LocalRecord::new(EntityKind::Transfer, "t1", "transfers")
            .with_field("player", "bugha")
            .with_field("date", "2020-01-01");
        old.last_reconciled_at = Utc::now() - chrono::Duration::days(30);
        let mut org = LocalRecord::new(EntityKind::Organization, "o1", "organizations")
            .with_field("name", "Falcons");
        org.last_reconciled_at = old.last_reconciled_at;

        let transfers = family(&TRANSFERS).await;
        let index = LocalIndex::build(&[old], TRANSFERS.required_fields, vec![]);
        assert!(!transfers.is_stale(&SyncTarget::new("t1"), &index));

        let orgs = family(&ORGANIZATIONS).await;
        let index = LocalIndex::build(&[org], ORGANIZATIONS.required_fields, vec![]);
        assert!(orgs.is_stale(&SyncTarget::new("o1"), &index));
    }

    // Test 8: Amount parsing
    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount(&json!(12)).unwrap(), json!(12));
        assert_eq!(parse_amount(&json!("1,500")).unwrap(), json!(1500.0));
        assert_eq!(parse_amount(&json!("n/a")).unwrap(), Value::Null);
        assert!(parse_amount(&json!(true)).is_err());
    }

    // Test 9: Record age follows the injected clock through a store round trip
    #[tokio::test]
    async fn test_staleness_on_virtual_clock() {
        use chrono::TimeZone;

        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::starting_at(start));
        let f = family_on(&ORGANIZATIONS, clock.clone()).await;

        let record = f
            .to_local_record(&SyncTarget::new("falcons"), json!({"name": "Team Falcons"}))
            .unwrap();
        f.upsert(&record).await.unwrap();

        let stored = f
            .store
            .find_many(&crate::models::RecordFilter::kind(EntityKind::Organization))
            .await
            .unwrap();
        assert_eq!(stored[0].last_reconciled_at, start);

        let index = LocalIndex::build(&stored, ORGANIZATIONS.required_fields, vec![]);
        assert!(!f.is_stale(&SyncTarget::new("falcons"), &index));

        clock.advance(std::time::Duration::from_secs(86_400));
        assert!(f.is_stale(&SyncTarget::new("falcons"), &index));
    }
}
