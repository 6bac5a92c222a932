//! Document construction.
//!
//! Turns typed RepairShopr records into the document shape accepted by the
//! Onyx ingestion API. Everything here is pure: the caller supplies any
//! related customer or asset it already has, and nothing is fetched.
//!
//! # Metadata
//!
//! Onyx only accepts string or list-of-string metadata values.
//! [`normalize_metadata`] flattens a JSON object into that shape: scalars
//! are stringified, nulls dropped, arrays become string lists and nested
//! objects are serialized as JSON text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::models::{Asset, Comment, Customer, EntityKind, Invoice, LineItem, Ticket};

/// Source identifier attached to every document.
pub const DOCUMENT_SOURCE: &str = "REPAIRSHOPR";

const RULE: &str = "------------------------------";

/// One linked block of document text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub link: String,
    pub text: String,
}

/// Person associated with a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicExpertInfo {
    pub display_name: String,
    pub email: Option<String>,
}

/// Metadata value accepted by the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Str(String),
    List(Vec<String>),
}

/// A document ready for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub sections: Vec<Section>,
    pub source: String,
    pub semantic_identifier: String,
    pub title: Option<String>,
    pub metadata: BTreeMap<String, MetaValue>,
    pub doc_updated_at: DateTime<Utc>,
    pub primary_owners: Vec<BasicExpertInfo>,
    pub secondary_owners: Vec<BasicExpertInfo>,
}

/// Flatten a JSON object into sink-compatible metadata.
pub fn normalize_metadata(raw: Map<String, Value>) -> BTreeMap<String, MetaValue> {
    raw.into_iter()
        .filter_map(|(key, value)| {
            let normalized = match value {
                Value::Null => return None,
                Value::Array(items) => MetaValue::List(
                    items
                        .into_iter()
                        .filter(|v| !v.is_null())
                        .map(scalar_text)
                        .collect(),
                ),
                other => MetaValue::Str(scalar_text(other)),
            };
            Some((key, normalized))
        })
        .collect()
}

fn scalar_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn fmt_minutes(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
}

fn fmt_day(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.format("%Y-%m-%d").to_string())
}

fn iso(ts: Option<DateTime<Utc>>) -> Value {
    ts.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null)
}

fn or<'a>(value: Option<&'a str>, fallback: &'a str) -> &'a str {
    value.filter(|s| !s.is_empty()).unwrap_or(fallback)
}

fn heading(lines: &mut Vec<String>, title: &str) {
    lines.push(String::new());
    lines.push(title.to_string());
    lines.push(RULE.to_string());
}

/// Builds documents for one RepairShopr account.
#[derive(Debug, Clone)]
pub struct DocumentBuilder {
    base_url: String,
    include_internal_comments: bool,
}

impl DocumentBuilder {
    pub fn new(subdomain: &str) -> Self {
        Self {
            base_url: format!("https://{}.repairshopr.com", subdomain),
            include_internal_comments: false,
        }
    }

    /// Include comments flagged hidden (tech-only) in ticket text.
    pub fn with_internal_comments(mut self, include: bool) -> Self {
        self.include_internal_comments = include;
        self
    }

    /// Web link to a record.
    pub fn link(&self, kind: EntityKind, id: i64) -> String {
        format!("{}/{}/{}", self.base_url, kind.collection(), id)
    }

    fn format_comments(&self, comments: &[Comment]) -> String {
        let mut ordered: Vec<&Comment> = comments
            .iter()
            .filter(|c| self.include_internal_comments || !c.hidden)
            .collect();
        ordered.sort_by_key(|c| c.created_at);

        if ordered.is_empty() {
            return "No comments recorded.".to_string();
        }

        let mut lines = Vec::new();
        for comment in ordered {
            let visibility = if comment.hidden { "[INTERNAL] " } else { "" };
            lines.push(format!(
                "--- {}{} by {} ---",
                visibility,
                fmt_minutes(comment.created_at).as_deref().unwrap_or("N/A"),
                or(comment.tech.as_deref(), "System"),
            ));
            if let Some(ref subject) = comment.subject {
                lines.push(format!("Subject: {}", subject));
            }
            if let Some(ref body) = comment.body {
                lines.push(body.clone());
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }

    fn format_line_items(items: &[LineItem]) -> String {
        if items.is_empty() {
            return "No parts or labor recorded.".to_string();
        }
        let mut lines: Vec<String> = items
            .iter()
            .map(|item| {
                format!(
                    "  - {}x {} @ ${:.2} = ${:.2}",
                    item.quantity,
                    or(item.name.as_deref(), "Item"),
                    item.price,
                    item.total()
                )
            })
            .collect();
        let total: f64 = items.iter().map(LineItem::total).sum();
        lines.push(format!("  TOTAL: ${:.2}", total));
        lines.join("\n")
    }

    fn document(
        &self,
        kind: EntityKind,
        id: i64,
        semantic_id: String,
        text: String,
        metadata: Value,
        updated_at: Option<DateTime<Utc>>,
    ) -> Document {
        let metadata = match metadata {
            Value::Object(map) => normalize_metadata(map),
            _ => BTreeMap::new(),
        };
        Document {
            id: kind.doc_id(id),
            sections: vec![Section {
                link: self.link(kind, id),
                text,
            }],
            source: DOCUMENT_SOURCE.to_string(),
            title: Some(semantic_id.clone()),
            semantic_identifier: semantic_id,
            metadata,
            doc_updated_at: updated_at.unwrap_or_else(Utc::now),
            primary_owners: Vec::new(),
            secondary_owners: Vec::new(),
        }
    }

    /// Ticket document, enriched with whatever customer and asset are known.
    pub fn ticket(
        &self,
        ticket: &Ticket,
        customer: Option<&Customer>,
        asset: Option<&Asset>,
    ) -> Document {
        let number = ticket.display_number();
        let subject = or(ticket.subject.as_deref(), "(no subject)");
        let semantic_id = format!("Ticket #{}: {}", number, subject);

        let customer_name = customer
            .map(Customer::full_name)
            .or_else(|| ticket.customer_business_then_name.clone());

        let asset = asset.or_else(|| ticket.assets.first());
        let asset_info = match asset {
            None => "No asset linked".to_string(),
            Some(a) => {
                let mut info = a.display_name();
                if let Some(ref serial) = a.asset_serial {
                    info.push_str(&format!(" (Serial: {})", serial));
                }
                let make = [a.manufacturer(), a.model()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                if !make.is_empty() {
                    info.push_str(&format!(" - {}", make));
                }
                info
            }
        };

        let mut lines = vec![
            format!("REPAIRSHOPR TICKET #{}", number),
            "=".repeat(50),
            String::new(),
            format!("SUBJECT: {}", subject),
            format!("STATUS: {}", ticket.status),
            format!("PROBLEM TYPE: {}", or(ticket.problem_type.as_deref(), "Not specified")),
            format!("PRIORITY: {}", or(ticket.priority.as_deref(), "Normal")),
            String::new(),
            format!("CUSTOMER: {}", customer_name.as_deref().unwrap_or("Unknown Customer")),
            format!("ASSET/DEVICE: {}", asset_info),
            format!("ASSIGNED TO: {}", or(ticket.assigned_tech_name.as_deref(), "Unassigned")),
            format!("LOCATION: {}", or(ticket.location_name.as_deref(), "Default")),
            String::new(),
            format!("CREATED: {}", fmt_minutes(ticket.created_at).as_deref().unwrap_or("N/A")),
            format!("DUE DATE: {}", fmt_day(ticket.due_date).as_deref().unwrap_or("Not set")),
            format!("RESOLVED: {}", fmt_minutes(ticket.resolved_at).as_deref().unwrap_or("Not yet")),
        ];
        heading(&mut lines, "PROBLEM DESCRIPTION:");
        lines.push(or(ticket.problem_description.as_deref(), "No description provided.").to_string());
        heading(&mut lines, "RESOLUTION/NOTES:");
        lines.push(or(ticket.resolution.as_deref(), "No resolution recorded yet.").to_string());
        heading(&mut lines, "WORK HISTORY / COMMENTS:");
        lines.push(self.format_comments(&ticket.comments));
        heading(&mut lines, "PARTS & LABOR:");
        lines.push(Self::format_line_items(&ticket.line_items));

        if let Some(c) = customer {
            heading(&mut lines, "CUSTOMER DETAILS:");
            lines.push(format!("Name: {}", c.full_name()));
            lines.push(format!("Email: {}", or(c.email.as_deref(), "N/A")));
            lines.push(format!(
                "Phone: {}",
                or(c.phone.as_deref().or(c.mobile.as_deref()), "N/A")
            ));
            let address = c.full_address();
            lines.push(format!("Address: {}", or(Some(address.as_str()), "N/A")));
            lines.push(format!("Notes: {}", or(c.notes.as_deref(), "None")));
        }

        if let Some(a) = asset {
            heading(&mut lines, "ASSET DETAILS:");
            lines.push(format!("Name: {}", a.display_name()));
            lines.push(format!("Type: {}", or(a.asset_type_name.as_deref(), "Unknown")));
            lines.push(format!("Serial: {}", or(a.asset_serial.as_deref(), "N/A")));
            lines.push(format!("Manufacturer: {}", a.manufacturer().as_deref().unwrap_or("N/A")));
            lines.push(format!("Model: {}", a.model().as_deref().unwrap_or("N/A")));
            lines.push(format!("OS: {}", a.operating_system().as_deref().unwrap_or("N/A")));
        }

        let visible_comments = ticket
            .comments
            .iter()
            .filter(|c| self.include_internal_comments || !c.hidden)
            .count();

        let mut metadata = json!({
            "ticket_number": number,
            "status": ticket.status,
            "problem_type": ticket.problem_type,
            "priority": ticket.priority,
            "is_resolved": ticket.is_resolved(),
            "customer_id": ticket.customer_id,
            "customer_name": customer_name,
            "technician": ticket.assigned_tech_name,
            "location": ticket.location_name,
            "created_at": iso(ticket.created_at),
            "resolved_at": iso(ticket.resolved_at),
            "comment_count": visible_comments,
            "parts_count": ticket.line_items.len(),
        });
        if let (Some(a), Value::Object(map)) = (asset, &mut metadata) {
            map.insert("asset_id".into(), json!(a.id));
            map.insert("asset_name".into(), json!(a.display_name()));
            map.insert("asset_serial".into(), json!(a.asset_serial));
            map.insert("asset_type".into(), json!(a.asset_type_name));
        }

        let mut doc = self.document(
            EntityKind::Ticket,
            ticket.id,
            semantic_id,
            lines.join("\n"),
            metadata,
            ticket.updated_at,
        );
        if let Some(ref tech) = ticket.assigned_tech_name {
            doc.primary_owners.push(BasicExpertInfo {
                display_name: tech.clone(),
                email: None,
            });
        }
        if let Some(name) = customer_name {
            doc.secondary_owners.push(BasicExpertInfo {
                display_name: name,
                email: customer.and_then(|c| c.email.clone()),
            });
        }
        doc
    }

    pub fn customer(&self, customer: &Customer) -> Document {
        let name = customer.full_name();
        let semantic_id = format!("Customer: {}", name);
        let address = customer.full_address();

        let mut lines = vec![
            "REPAIRSHOPR CUSTOMER PROFILE".to_string(),
            "=".repeat(50),
            String::new(),
            format!("NAME: {}", name),
            format!("BUSINESS: {}", or(customer.business_name.as_deref(), "Individual")),
        ];
        heading(&mut lines, "CONTACT INFORMATION:");
        lines.push(format!("Email: {}", or(customer.email.as_deref(), "Not provided")));
        lines.push(format!("Phone: {}", or(customer.phone.as_deref(), "Not provided")));
        lines.push(format!("Mobile: {}", or(customer.mobile.as_deref(), "Not provided")));
        heading(&mut lines, "ADDRESS:");
        lines.push(or(Some(address.as_str()), "No address on file").to_string());
        heading(&mut lines, "NOTES:");
        lines.push(or(customer.notes.as_deref(), "No notes recorded.").to_string());
        heading(&mut lines, "PREFERENCES:");
        lines.push(format!(
            "SMS Notifications: {}",
            if customer.get_sms { "Enabled" } else { "Disabled" }
        ));
        lines.push(format!("Email Opt-Out: {}", if customer.opt_out { "Yes" } else { "No" }));

        if !customer.contacts.is_empty() {
            heading(&mut lines, "ADDITIONAL CONTACTS:");
            for contact in &customer.contacts {
                lines.push(
                    format!(
                        "  - {}: {} {}",
                        or(contact.name.as_deref(), "Unnamed"),
                        contact.email.as_deref().unwrap_or(""),
                        contact.phone.as_deref().unwrap_or("")
                    )
                    .trim_end()
                    .to_string(),
                );
            }
        }

        let metadata = json!({
            "customer_id": customer.id,
            "customer_name": name,
            "business_name": customer.business_name,
            "email": customer.email,
            "phone": customer.phone.as_ref().or(customer.mobile.as_ref()),
            "city": customer.city,
            "state": customer.state,
            "created_at": iso(customer.created_at),
        });

        let mut doc = self.document(
            EntityKind::Customer,
            customer.id,
            semantic_id,
            lines.join("\n"),
            metadata,
            customer.updated_at,
        );
        doc.secondary_owners.push(BasicExpertInfo {
            display_name: name,
            email: customer.email.clone(),
        });
        doc
    }

    pub fn asset(&self, asset: &Asset, owner: Option<&Customer>) -> Document {
        let name = asset.display_name();
        let mut semantic_id = format!("Asset: {}", name);
        if let Some(ref serial) = asset.asset_serial {
            semantic_id.push_str(&format!(" ({})", serial));
        }
        let owner_name = owner.map(Customer::full_name);

        let mut lines = vec![
            "REPAIRSHOPR ASSET/DEVICE".to_string(),
            "=".repeat(50),
            String::new(),
            format!("NAME: {}", name),
            format!("TYPE: {}", or(asset.asset_type_name.as_deref(), "Unknown")),
            format!("SERIAL NUMBER: {}", or(asset.asset_serial.as_deref(), "N/A")),
        ];
        heading(&mut lines, "SPECIFICATIONS:");
        lines.push(format!("Manufacturer: {}", asset.manufacturer().as_deref().unwrap_or("N/A")));
        lines.push(format!("Model: {}", asset.model().as_deref().unwrap_or("N/A")));
        lines.push(format!(
            "Operating System: {}",
            asset.operating_system().as_deref().unwrap_or("N/A")
        ));
        heading(&mut lines, "OWNER:");
        lines.push(format!("Customer: {}", owner_name.as_deref().unwrap_or("Unknown Owner")));
        lines.push(String::new());
        lines.push(format!("CREATED: {}", fmt_day(asset.created_at).as_deref().unwrap_or("N/A")));

        let extra: Vec<String> = asset
            .properties
            .iter()
            .filter(|(k, _)| {
                !matches!(
                    k.to_ascii_lowercase().as_str(),
                    "manufacturer" | "model" | "os" | "operating system"
                )
            })
            .filter_map(|(k, v)| match v {
                Value::Null | Value::Bool(false) => None,
                Value::String(s) if s.trim().is_empty() => None,
                Value::String(s) => Some(format!("  {}: {}", k, s)),
                other => Some(format!("  {}: {}", k, other)),
            })
            .collect();
        if !extra.is_empty() {
            heading(&mut lines, "ADDITIONAL PROPERTIES:");
            lines.extend(extra);
        }

        let metadata = json!({
            "asset_id": asset.id,
            "asset_name": name,
            "asset_serial": asset.asset_serial,
            "asset_type": asset.asset_type_name,
            "customer_id": asset.customer_id,
            "customer_name": owner_name.as_deref().unwrap_or("Unknown Owner"),
            "manufacturer": asset.manufacturer(),
            "model": asset.model(),
            "created_at": iso(asset.created_at),
        });

        let mut doc = self.document(
            EntityKind::Asset,
            asset.id,
            semantic_id,
            lines.join("\n"),
            metadata,
            asset.updated_at,
        );
        if let Some(name) = owner_name {
            doc.secondary_owners.push(BasicExpertInfo {
                display_name: name,
                email: None,
            });
        }
        doc
    }

    pub fn invoice(&self, invoice: &Invoice, customer: Option<&Customer>) -> Document {
        let number = invoice
            .number
            .clone()
            .unwrap_or_else(|| invoice.id.to_string());
        let semantic_id = format!("Invoice #{}", number);
        let customer_name = customer
            .map(Customer::full_name)
            .unwrap_or_else(|| "Unknown Customer".to_string());

        let mut lines = vec![
            "REPAIRSHOPR INVOICE".to_string(),
            "=".repeat(50),
            String::new(),
            format!("INVOICE #: {}", number),
            format!("DATE: {}", fmt_day(invoice.date).as_deref().unwrap_or("N/A")),
            format!("STATUS: {}", if invoice.paid { "PAID" } else { "UNPAID" }),
            String::new(),
            format!("CUSTOMER: {}", customer_name),
            match invoice.ticket_id {
                Some(t) => format!("TICKET: #{}", t),
                None => "No linked ticket".to_string(),
            },
            String::new(),
            format!("TOTAL: ${:.2}", invoice.total),
            format!("BALANCE DUE: ${:.2}", invoice.balance_due),
        ];
        heading(&mut lines, "LINE ITEMS:");
        lines.push(Self::format_line_items(&invoice.line_items));

        let metadata = json!({
            "invoice_number": number,
            "invoice_id": invoice.id,
            "customer_id": invoice.customer_id,
            "customer_name": customer_name,
            "ticket_id": invoice.ticket_id,
            "total": invoice.total,
            "paid": invoice.paid,
            "date": iso(invoice.date),
        });

        self.document(
            EntityKind::Invoice,
            invoice.id,
            semantic_id,
            lines.join("\n"),
            metadata,
            invoice.updated_at,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_record;

    fn ticket(raw: Value) -> Ticket {
        parse_record(EntityKind::Ticket, &raw).unwrap()
    }

    fn customer() -> Customer {
        parse_record(
            EntityKind::Customer,
            &json!({"id": 5001, "firstname": "John", "lastname": "Smith", "email": "john@example.com"}),
        )
        .unwrap()
    }

    #[test]
    fn normalize_stringifies_and_drops_nulls() {
        let raw = json!({
            "flag": true,
            "count": 3,
            "ratio": 0.5,
            "gone": null,
            "tags": ["a", null, 2],
            "nested": {"k": "v"}
        });
        let Value::Object(map) = raw else { unreachable!() };
        let meta = normalize_metadata(map);

        assert_eq!(meta["flag"], MetaValue::Str("true".into()));
        assert_eq!(meta["count"], MetaValue::Str("3".into()));
        assert_eq!(meta["ratio"], MetaValue::Str("0.5".into()));
        assert!(!meta.contains_key("gone"));
        assert_eq!(meta["tags"], MetaValue::List(vec!["a".into(), "2".into()]));
        assert_eq!(meta["nested"], MetaValue::Str(r#"{"k":"v"}"#.into()));
    }

    #[test]
    fn ticket_document_shape() {
        let builder = DocumentBuilder::new("acme");
        let t = ticket(json!({
            "id": 12345,
            "number": 1001,
            "subject": "Laptop won't boot",
            "status": "In Progress",
            "customer_id": 5001,
            "updated_at": "2024-01-16T14:20:00Z",
        }));
        let doc = builder.ticket(&t, Some(&customer()), None);

        assert_eq!(doc.id, "rs_ticket_12345");
        assert_eq!(doc.source, "REPAIRSHOPR");
        assert_eq!(doc.semantic_identifier, "Ticket #1001: Laptop won't boot");
        assert_eq!(doc.sections[0].link, "https://acme.repairshopr.com/tickets/12345");
        assert!(doc.sections[0].text.contains("CUSTOMER: John Smith"));
        assert!(doc.sections[0].text.contains("CUSTOMER DETAILS:"));
        assert_eq!(doc.metadata["is_resolved"], MetaValue::Str("false".into()));
        assert_eq!(doc.metadata["customer_id"], MetaValue::Str("5001".into()));
        assert!(!doc.metadata.contains_key("technician"));
        assert_eq!(doc.doc_updated_at.to_rfc3339(), "2024-01-16T14:20:00+00:00");
        assert_eq!(doc.secondary_owners[0].email.as_deref(), Some("john@example.com"));
    }

    #[test]
    fn internal_comments_hidden_by_default() {
        let t = ticket(json!({
            "id": 1,
            "comments": [
                {"body": "Customer called", "tech": "Alice", "created_at": "2024-01-15T10:00:00Z"},
                {"body": "Tech-only note", "hidden": true, "created_at": "2024-01-15T11:00:00Z"}
            ]
        }));

        let public = DocumentBuilder::new("acme").ticket(&t, None, None);
        assert!(public.sections[0].text.contains("Customer called"));
        assert!(!public.sections[0].text.contains("Tech-only note"));
        assert_eq!(public.metadata["comment_count"], MetaValue::Str("1".into()));

        let internal = DocumentBuilder::new("acme")
            .with_internal_comments(true)
            .ticket(&t, None, None);
        assert!(internal.sections[0].text.contains("[INTERNAL]"));
        assert!(internal.sections[0].text.contains("Tech-only note"));
    }

    #[test]
    fn missing_updated_at_defaults_to_now() {
        let before = Utc::now();
        let doc = DocumentBuilder::new("acme").customer(&customer());
        assert!(doc.doc_updated_at >= before);
        assert_eq!(doc.id, "rs_customer_5001");
    }

    #[test]
    fn asset_and_invoice_links() {
        let builder = DocumentBuilder::new("acme");
        let asset: Asset = parse_record(
            EntityKind::Asset,
            &json!({"id": 8001, "name": "Dell", "asset_serial": "SN1", "properties": {"RAM": "16GB"}}),
        )
        .unwrap();
        let doc = builder.asset(&asset, Some(&customer()));
        assert_eq!(doc.semantic_identifier, "Asset: Dell (SN1)");
        assert_eq!(doc.sections[0].link, "https://acme.repairshopr.com/customer_assets/8001");
        assert!(doc.sections[0].text.contains("RAM: 16GB"));
        assert!(doc.sections[0].text.contains("Customer: John Smith"));

        let invoice: Invoice = parse_record(
            EntityKind::Invoice,
            &json!({"id": 77, "number": "INV-9", "total": "120.5", "paid": true,
                    "line_items": [{"name": "Labor", "quantity": 1, "price": 120.5}]}),
        )
        .unwrap();
        let doc = builder.invoice(&invoice, None);
        assert_eq!(doc.id, "rs_invoice_77");
        assert!(doc.sections[0].text.contains("STATUS: PAID"));
        assert!(doc.sections[0].text.contains("TOTAL: $120.50"));
        assert_eq!(doc.metadata["paid"], MetaValue::Str("true".into()));
    }

    #[test]
    fn serializes_to_sink_json() {
        let doc = DocumentBuilder::new("acme").customer(&customer());
        let v = serde_json::to_value(&doc).unwrap();
        assert_eq!(v["source"], "REPAIRSHOPR");
        assert_eq!(v["sections"][0]["link"], "https://acme.repairshopr.com/customers/5001");
        assert!(v["metadata"]["customer_name"].is_string());
    }
}
