//! Entity and event payload schemas.
//!
//! Payloads are validated when work is enqueued, so a malformed snapshot is
//! rejected at creation time instead of failing later at send time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Operation, Result};

/// Remote collection a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Products,
}

impl EntityType {
    /// Collection name, used both as storage key and URL segment.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Products => "products",
        }
    }

    /// Whether a 409 for this type goes through conflict resolution.
    pub fn supports_conflict_resolution(&self) -> bool {
        match self {
            EntityType::Products => true,
        }
    }

    /// Fields compared to decide whether a 409 is a real conflict.
    pub fn compared_fields(&self) -> &'static [&'static str] {
        match self {
            EntityType::Products => &["name", "sku", "category", "price", "quantity"],
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "products" => Ok(EntityType::Products),
            other => Err(Error::InvalidInput(format!("Unknown entity type: {}", other))),
        }
    }
}

/// A product as held by the point-of-sale client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Client-generated id. Doubles as the create idempotency key.
    pub id: String,
    /// Id assigned by the server after a successful create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub quantity: i64,
    /// Local last-modified time.
    #[serde(alias = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Product {
    fn validate(&self, operation: Operation) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidInput("Product id cannot be empty".to_string()));
        }
        if operation == Operation::Delete {
            return Ok(());
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("Product name cannot be empty".to_string()));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(Error::InvalidInput(format!(
                "Product price must be a non-negative number, got {}",
                self.price
            )));
        }
        if self.quantity < 0 {
            return Err(Error::InvalidInput(format!(
                "Product quantity cannot be negative, got {}",
                self.quantity
            )));
        }
        Ok(())
    }
}

/// Full snapshot of an entity, tagged by its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "payload", rename_all = "snake_case")]
pub enum EntityPayload {
    Products(Product),
}

impl EntityPayload {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityPayload::Products(_) => EntityType::Products,
        }
    }

    /// Client-side id of the entity.
    pub fn entity_id(&self) -> &str {
        match self {
            EntityPayload::Products(p) => &p.id,
        }
    }

    /// Server id carried in the snapshot, if the entity was created remotely.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            EntityPayload::Products(p) => p.server_id.as_deref(),
        }
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        match self {
            EntityPayload::Products(p) => p.updated_at,
        }
    }

    /// Check the snapshot is acceptable for the given operation.
    pub fn validate(&self, operation: Operation) -> Result<()> {
        match self {
            EntityPayload::Products(p) => p.validate(operation),
        }
    }

    /// JSON body sent to the server.
    pub fn to_value(&self) -> Result<Value> {
        match self {
            EntityPayload::Products(p) => Ok(serde_json::to_value(p)?),
        }
    }

    /// Parse a JSON snapshot of the given type.
    pub fn from_value(entity_type: EntityType, value: Value) -> Result<Self> {
        match entity_type {
            EntityType::Products => Ok(EntityPayload::Products(serde_json::from_value(value)?)),
        }
    }

    /// Overlay the keys of `patch` onto this snapshot and re-parse.
    ///
    /// The client id is always kept so the entity stays addressable locally.
    pub fn merged_with(&self, patch: &Value) -> Result<Self> {
        let Value::Object(patch) = patch else {
            return Err(Error::InvalidInput(
                "Merged payload must be a JSON object".to_string(),
            ));
        };
        let mut base = self.to_value()?;
        if let Value::Object(fields) = &mut base {
            for (key, value) in patch {
                if key != "id" {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }
        Self::from_value(self.entity_type(), base)
    }

    /// Copy the compared fields and timestamp from the server's version.
    pub fn overwritten_from_server(&self, server: &Value) -> Result<Self> {
        let mut patch = serde_json::Map::new();
        for field in self.entity_type().compared_fields() {
            if let Some(value) = server.get(*field) {
                patch.insert((*field).to_string(), value.clone());
            }
        }
        if let Some(ts) = server.get("updated_at").or_else(|| server.get("updatedAt")) {
            patch.insert("updated_at".to_string(), ts.clone());
        }
        self.merged_with(&Value::Object(patch))
    }
}

/// One line of a completed sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleLine {
    pub product_id: String,
    pub quantity: i64,
    pub unit_price: f64,
}

/// A completed sale, replayed verbatim to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    pub lines: Vec<SaleLine>,
    pub total: f64,
    pub payment_method: String,
}

impl Sale {
    pub fn validate(&self) -> Result<()> {
        if self.lines.is_empty() {
            return Err(Error::InvalidInput("Sale must have at least one line".to_string()));
        }
        for line in &self.lines {
            if line.product_id.trim().is_empty() {
                return Err(Error::InvalidInput("Sale line without product id".to_string()));
            }
            if line.quantity <= 0 {
                return Err(Error::InvalidInput(format!(
                    "Sale line for {} has non-positive quantity {}",
                    line.product_id, line.quantity
                )));
            }
            if !line.unit_price.is_finite() || line.unit_price < 0.0 {
                return Err(Error::InvalidInput(format!(
                    "Sale line for {} has invalid unit price",
                    line.product_id
                )));
            }
        }
        if !self.total.is_finite() || self.total < 0.0 {
            return Err(Error::InvalidInput("Sale total must be non-negative".to_string()));
        }
        if self.payment_method.trim().is_empty() {
            return Err(Error::InvalidInput("Payment method cannot be empty".to_string()));
        }
        Ok(())
    }
}
