//! Shipment records
//!
//! A [`ShipmentRecord`] is the durable view of one tracked parcel. Records are
//! keyed by tracking id in a [`RecordSet`] and only ever mutated through the
//! merge rules defined here:
//!
//! - a payload field that is present overwrites the stored value
//! - a payload field that is absent leaves the stored value alone
//! - `display_name` is never touched by a payload

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::traits::ShipmentPayload;

/// All tracked shipments, keyed by tracking id
pub type RecordSet = BTreeMap<String, ShipmentRecord>;

/// Message stored when a lookup starts and nothing is known yet
const INITIATED_MESSAGE: &str = "Tracking initiated";

/// Coarse shipment status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    /// Lookup started, no shipment data yet
    Pending,
    /// Any carrier-reported status that is not terminal
    InTransit,
    /// Delivered (terminal)
    Delivered,
    /// Archived by the remote service (terminal)
    Archived,
    /// Status missing from the response
    #[default]
    Unknown,
}

impl ShipmentStatus {
    /// Map a status string reported by the remote service
    pub fn from_remote(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "delivered" => Self::Delivered,
            "archived" => Self::Archived,
            "pending" => Self::Pending,
            "" | "unknown" => Self::Unknown,
            _ => Self::InTransit,
        }
    }

    /// Terminal statuses stop further polling
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Archived)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
            Self::Archived => "archived",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state of one tracked shipment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentRecord {
    /// Tracking id (immutable identity)
    pub tracking_id: String,

    /// User label, never overwritten by API responses
    #[serde(default)]
    pub display_name: Option<String>,

    /// Coarse status
    #[serde(default)]
    pub status: ShipmentStatus,

    /// Token for an in-progress remote lookup
    #[serde(default)]
    pub correlation_token: Option<String>,

    /// When the token was issued (RFC 3339 on disk)
    #[serde(default)]
    pub token_issued_at: Option<DateTime<Utc>>,

    /// Latest carrier status text
    #[serde(default)]
    pub message: Option<String>,

    /// Latest known location
    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub origin: Option<String>,

    #[serde(default)]
    pub destination: Option<String>,

    /// Detected carrier name
    #[serde(default)]
    pub carrier: Option<String>,

    #[serde(default)]
    pub days_in_transit: Option<u32>,

    /// Time of the most recent successful merge
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ShipmentRecord {
    /// Create a pending record for a tracking id seen for the first time
    pub fn new(tracking_id: impl Into<String>) -> Self {
        Self {
            tracking_id: tracking_id.into(),
            display_name: None,
            status: ShipmentStatus::Pending,
            correlation_token: None,
            token_issued_at: None,
            message: None,
            location: None,
            origin: None,
            destination: None,
            carrier: None,
            days_in_transit: None,
            last_updated: None,
        }
    }

    /// Set the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Return the correlation token if it can still be polled at `now`
    ///
    /// A token without an issue time is treated as expired, as is a token
    /// strictly older than `ttl`.
    pub fn fresh_token(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> Option<&str> {
        let token = self.correlation_token.as_deref()?;
        let issued_at = self.token_issued_at?;
        if now.signed_duration_since(issued_at) > ttl {
            return None;
        }
        Some(token)
    }

    /// Record a freshly issued correlation token
    pub fn apply_token(&mut self, token: impl Into<String>, now: DateTime<Utc>) {
        self.correlation_token = Some(token.into());
        self.token_issued_at = Some(now);
        self.status = ShipmentStatus::Pending;
        if self.message.is_none() {
            self.message = Some(INITIATED_MESSAGE.to_string());
        }
    }

    /// Merge a resolved shipment payload into this record
    ///
    /// Applying the same payload twice with the same `now` yields the same
    /// record as applying it once.
    pub fn merge_payload(&mut self, payload: &ShipmentPayload, now: DateTime<Utc>) {
        self.status = payload
            .status
            .as_deref()
            .map(ShipmentStatus::from_remote)
            .unwrap_or_default();

        merge_field(&mut self.message, &payload.message);
        merge_field(&mut self.location, &payload.location);
        merge_field(&mut self.origin, &payload.origin);
        merge_field(&mut self.destination, &payload.destination);
        merge_field(&mut self.carrier, &payload.carrier);
        merge_field(&mut self.days_in_transit, &payload.days_in_transit);

        self.correlation_token = None;
        self.token_issued_at = None;
        self.last_updated = Some(now);
    }

    /// Whether the record may be pruned at `now` given a retention window
    ///
    /// Only terminal records are prunable. A terminal record that was never
    /// stamped counts as stale.
    pub fn is_prunable(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        if !self.status.is_terminal() {
            return false;
        }
        match self.last_updated {
            Some(updated) => now.signed_duration_since(updated) > retention,
            None => true,
        }
    }
}

fn merge_field<T: Clone>(current: &mut Option<T>, incoming: &Option<T>) {
    if let Some(value) = incoming {
        *current = Some(value.clone());
    }
}
