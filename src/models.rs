//! Entity records fetched from the RepairShopr API.
//!
//! Records are immutable snapshots: they are parsed once from the JSON the
//! source returns and handed to the document builder. The only field filled
//! in after construction is [`Ticket::comments`], populated by a follow-up
//! comments request when comment fetching is enabled.
//!
//! The source is loose about types (numbers sometimes arrive as strings,
//! timestamps sometimes lack an offset), so the `lenient` deserializers
//! below accept the shapes seen in practice instead of failing the record.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{BridgeError, Result};

/// The four record types mirrored by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Ticket,
    Customer,
    Asset,
    Invoice,
}

impl EntityKind {
    /// Sync order: customers and assets first so tickets and invoices can
    /// be enriched from the cache.
    pub const SYNC_ORDER: [EntityKind; 4] = [
        EntityKind::Customer,
        EntityKind::Asset,
        EntityKind::Ticket,
        EntityKind::Invoice,
    ];

    /// API collection path segment.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Ticket => "tickets",
            EntityKind::Customer => "customers",
            EntityKind::Asset => "customer_assets",
            EntityKind::Invoice => "invoices",
        }
    }

    /// Key holding the record array in a list response.
    pub fn list_key(&self) -> &'static str {
        match self {
            EntityKind::Ticket => "tickets",
            EntityKind::Customer => "customers",
            EntityKind::Asset => "assets",
            EntityKind::Invoice => "invoices",
        }
    }

    /// Key wrapping a single record in a detail response.
    pub fn singular(&self) -> &'static str {
        match self {
            EntityKind::Ticket => "ticket",
            EntityKind::Customer => "customer",
            EntityKind::Asset => "asset",
            EntityKind::Invoice => "invoice",
        }
    }

    pub fn doc_prefix(&self) -> &'static str {
        match self {
            EntityKind::Ticket => "rs_ticket_",
            EntityKind::Customer => "rs_customer_",
            EntityKind::Asset => "rs_asset_",
            EntityKind::Invoice => "rs_invoice_",
        }
    }

    /// Stable document id for a record of this kind.
    pub fn doc_id(&self, id: i64) -> String {
        format!("{}{}", self.doc_prefix(), id)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityKind::Ticket => "tickets",
            EntityKind::Customer => "customers",
            EntityKind::Asset => "assets",
            EntityKind::Invoice => "invoices",
        };
        f.write_str(label)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Raw-value helpers
// ═══════════════════════════════════════════════════════════════════════

/// Parse a source timestamp. Offsets are honoured; naive values are UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

/// Integer `id` of a raw record, accepting numeric strings.
pub fn record_id(record: &Value) -> Option<i64> {
    let id = record.get("id")?;
    id.as_i64()
        .or_else(|| id.as_str().and_then(|s| s.trim().parse().ok()))
}

/// `updated_at` of a raw record, if present and parseable.
pub fn record_updated_at(record: &Value) -> Option<DateTime<Utc>> {
    record
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
}

/// Parse a raw record into its typed form.
///
/// A record without an integer id, or whose fields do not fit the typed
/// shape, is a [`BridgeError::Validation`].
pub fn parse_record<T: DeserializeOwned>(kind: EntityKind, record: &Value) -> Result<T> {
    let id = record_id(record).ok_or_else(|| {
        BridgeError::Validation(format!("{} record without integer id", kind.singular()))
    })?;
    serde_json::from_value(record.clone())
        .map_err(|e| BridgeError::Validation(format!("{} {}: {}", kind.singular(), id, e)))
}

mod lenient {
    use super::*;

    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(v.as_ref().and_then(Value::as_str).and_then(parse_timestamp))
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(match v {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        })
    }

    pub fn id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<i64>, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(match v {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(match v {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        })
    }

    pub fn quantity<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(match v {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(1.0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(1.0),
            _ => 1.0,
        })
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(match v {
            Some(Value::Bool(b)) => b,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
            _ => false,
        })
    }

    pub fn status<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
        Ok(string(d)?
            .map(|s| s.trim().to_string())
            .unwrap_or_else(super::default_status))
    }

    pub fn object<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Map<String, Value>, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(match v {
            Some(Value::Object(m)) => m,
            _ => Map::new(),
        })
    }

    pub fn list<'de, D, T>(d: D) -> std::result::Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let v = Option::<Vec<T>>::deserialize(d)?;
        Ok(v.unwrap_or_default())
    }
}

fn default_status() -> String {
    "New".to_string()
}

// ═══════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct Contact {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
    pub id: i64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub business_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub firstname: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub lastname: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub mobile: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub address: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub address_2: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub city: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub zip: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub get_sms: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub opt_out: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub no_email: bool,
    #[serde(default, deserialize_with = "lenient::list")]
    pub contacts: Vec<Contact>,
}

impl Customer {
    /// Display name, preferring the business name.
    pub fn full_name(&self) -> String {
        if let Some(ref business) = self.business_name {
            return business.clone();
        }
        let parts: Vec<&str> = [self.firstname.as_deref(), self.lastname.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if parts.is_empty() {
            format!("Customer #{}", self.id)
        } else {
            parts.join(" ")
        }
    }

    pub fn full_address(&self) -> String {
        let locality: Vec<&str> = [
            self.city.as_deref(),
            self.state.as_deref(),
            self.zip.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        let locality = locality.join(", ");

        [
            self.address.as_deref(),
            self.address_2.as_deref(),
            Some(locality.as_str()).filter(|s| !s.is_empty()),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("\n")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub id: i64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient::id")]
    pub customer_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub asset_serial: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub asset_type_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::object")]
    pub properties: Map<String, Value>,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Asset {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Asset #{}", self.id))
    }

    /// First non-empty property among `keys`, rendered as text.
    fn property(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| match self.properties.get(*k) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn manufacturer(&self) -> Option<String> {
        self.property(&["manufacturer", "Manufacturer"])
    }

    pub fn model(&self) -> Option<String> {
        self.property(&["model", "Model"])
    }

    pub fn operating_system(&self) -> Option<String> {
        self.property(&["os", "Operating System"])
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineItem {
    #[serde(default, deserialize_with = "lenient::string")]
    pub name: Option<String>,
    #[serde(default = "one", deserialize_with = "lenient::quantity")]
    pub quantity: f64,
    #[serde(default, deserialize_with = "lenient::number")]
    pub price: f64,
}

fn one() -> f64 {
    1.0
}

impl LineItem {
    pub fn total(&self) -> f64 {
        self.quantity * self.price
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub subject: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub body: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub tech: Option<String>,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub hidden: bool,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ticket {
    pub id: i64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub number: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub subject: Option<String>,
    #[serde(default = "default_status", deserialize_with = "lenient::status")]
    pub status: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub problem_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub priority: Option<String>,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::id")]
    pub customer_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub customer_business_then_name: Option<String>,
    #[serde(
        default,
        alias = "problem_type_description",
        deserialize_with = "lenient::string"
    )]
    pub problem_description: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub resolution: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub assigned_tech_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub location_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub comments: Vec<Comment>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub line_items: Vec<LineItem>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub assets: Vec<Asset>,
}

impl Ticket {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "resolved" | "closed" | "completed" | "invoiced"
        )
    }

    /// Ticket number as shown to users, falling back to the record id.
    pub fn display_number(&self) -> String {
        self.number.clone().unwrap_or_else(|| self.id.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Invoice {
    pub id: i64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub number: Option<String>,
    #[serde(default, deserialize_with = "lenient::id")]
    pub customer_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient::id")]
    pub ticket_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub paid: bool,
    #[serde(default, deserialize_with = "lenient::number")]
    pub total: f64,
    #[serde(default, deserialize_with = "lenient::number")]
    pub balance_due: f64,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub line_items: Vec<LineItem>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn timestamps_with_and_without_offset() {
        let with_offset = parse_timestamp("2024-01-16T14:20:00-05:00").unwrap();
        assert_eq!(with_offset, Utc.with_ymd_and_hms(2024, 1, 16, 19, 20, 0).unwrap());

        let naive = parse_timestamp("2024-01-16T14:20:00").unwrap();
        assert_eq!(naive, Utc.with_ymd_and_hms(2024, 1, 16, 14, 20, 0).unwrap());

        let fractional = parse_timestamp("2024-01-16 14:20:00.250").unwrap();
        assert_eq!(fractional.timestamp_millis() % 1000, 250);

        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn record_id_accepts_numeric_strings() {
        assert_eq!(record_id(&json!({"id": 7})), Some(7));
        assert_eq!(record_id(&json!({"id": "12"})), Some(12));
        assert_eq!(record_id(&json!({"id": null})), None);
        assert_eq!(record_id(&json!({"name": "x"})), None);
    }

    #[test]
    fn parse_ticket_with_loose_types() {
        let raw = json!({
            "id": 12345,
            "number": 1001,
            "subject": "Laptop won't boot",
            "status": "  Resolved ",
            "customer_id": "5001",
            "problem_type_description": "Blue screen on startup",
            "line_items": [{"name": "SSD", "quantity": "2", "price": "49.50"}],
            "comments": null,
            "updated_at": "2024-01-16T14:20:00Z"
        });
        let ticket: Ticket = parse_record(EntityKind::Ticket, &raw).unwrap();
        assert_eq!(ticket.display_number(), "1001");
        assert_eq!(ticket.status, "Resolved");
        assert!(ticket.is_resolved());
        assert_eq!(ticket.customer_id, Some(5001));
        assert_eq!(ticket.problem_description.as_deref(), Some("Blue screen on startup"));
        assert!(ticket.comments.is_empty());
        assert!((ticket.line_items[0].total() - 99.0).abs() < 1e-9);
    }

    #[test]
    fn missing_status_defaults_to_new() {
        let ticket: Ticket = parse_record(EntityKind::Ticket, &json!({"id": 1})).unwrap();
        assert_eq!(ticket.status, "New");
        assert!(!ticket.is_resolved());
    }

    #[test]
    fn record_without_id_is_validation_error() {
        let err = parse_record::<Customer>(EntityKind::Customer, &json!({"firstname": "A"}))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));
    }

    #[test]
    fn customer_names_and_address() {
        let raw = json!({
            "id": 5001,
            "firstname": "John",
            "lastname": "Smith",
            "address": "123 Main Street",
            "city": "Springfield",
            "state": "IL",
            "zip": "62701"
        });
        let c: Customer = parse_record(EntityKind::Customer, &raw).unwrap();
        assert_eq!(c.full_name(), "John Smith");
        assert_eq!(c.full_address(), "123 Main Street\nSpringfield, IL, 62701");

        let anon: Customer = parse_record(EntityKind::Customer, &json!({"id": 9})).unwrap();
        assert_eq!(anon.full_name(), "Customer #9");
        assert_eq!(anon.full_address(), "");
    }

    #[test]
    fn asset_property_accessors() {
        let raw = json!({
            "id": 8001,
            "name": "Dell Latitude 5520",
            "properties": {"Manufacturer": "Dell", "Model": "Latitude 5520", "os": "Windows 11"}
        });
        let a: Asset = parse_record(EntityKind::Asset, &raw).unwrap();
        assert_eq!(a.manufacturer().as_deref(), Some("Dell"));
        assert_eq!(a.model().as_deref(), Some("Latitude 5520"));
        assert_eq!(a.operating_system().as_deref(), Some("Windows 11"));
    }

    #[test]
    fn kind_paths_and_prefixes() {
        assert_eq!(EntityKind::Asset.collection(), "customer_assets");
        assert_eq!(EntityKind::Asset.list_key(), "assets");
        assert_eq!(EntityKind::Ticket.doc_id(42), "rs_ticket_42");
        assert_eq!(EntityKind::Invoice.to_string(), "invoices");
    }
}
