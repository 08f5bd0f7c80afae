//! Canonical per-upload records maintained by the copy-status reconciler.

use crate::models::copy_status::{CopyStatus, Destination};
use crate::models::upload::Tguid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

/// Canonical per-upload record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Item {
    pub id: String,
    #[schema(value_type = String)]
    pub tguid: Tguid,
    #[serde(rename = "partitionKey")]
    pub partition_key: String,
    pub offset: u64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_destination_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_ext_event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_epoch: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_epoch: Option<i64>,
    /// Storage-assigned timestamp of the last write (epoch seconds)
    #[serde(rename = "_ts", default)]
    pub ts: i64,
}

impl Item {
    /// Record for a tguid whose upload metadata is not known yet.
    pub fn placeholder(tguid: &Tguid) -> Self {
        Self {
            id: tguid.to_string(),
            tguid: tguid.clone(),
            partition_key: tguid.to_string(),
            offset: 0,
            size: 0,
            meta_destination_id: None,
            meta_ext_event: None,
            filename: None,
            metadata: HashMap::new(),
            start_time_epoch: None,
            end_time_epoch: None,
            ts: 0,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.meta_destination_id.is_none() && self.size == 0 && self.filename.is_none()
    }
}

/// Item plus the independently tracked per-destination outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ItemCopyStatus {
    #[serde(flatten)]
    pub item: Item,
    #[serde(rename = "statusDEX", default)]
    #[schema(value_type = String)]
    pub status_dex: CopyStatus,
    #[serde(rename = "statusEDAV", default)]
    #[schema(value_type = String)]
    pub status_edav: CopyStatus,
}

/// Result of merging one partial update into a document.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Fields that moved to a later status
    pub applied: u8,
    /// Fields whose incoming status was earlier than the stored one
    pub rejected: u8,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.applied > 0
    }
}

impl ItemCopyStatus {
    pub fn new(item: Item) -> Self {
        Self {
            item,
            status_dex: CopyStatus::Unknown,
            status_edav: CopyStatus::Unknown,
        }
    }

    pub fn tguid(&self) -> &Tguid {
        &self.item.tguid
    }

    pub fn status(&self, destination: Destination) -> CopyStatus {
        match destination {
            Destination::Dex => self.status_dex,
            Destination::Edav => self.status_edav,
        }
    }

    fn status_mut(&mut self, destination: Destination) -> &mut CopyStatus {
        match destination {
            Destination::Dex => &mut self.status_dex,
            Destination::Edav => &mut self.status_edav,
        }
    }

    /// Field-level merge of a partial update.
    ///
    /// Absent fields are left untouched. A present field only replaces the stored value
    /// when it is not earlier in the status lattice; equal values are a no-op.
    pub fn merge(&mut self, update: &ItemInternalCopyStatus) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for destination in Destination::ALL {
            let Some(incoming) = update.status(destination) else {
                continue;
            };
            let current = self.status_mut(destination);
            if !current.accepts(incoming) {
                outcome.rejected += 1;
            } else if *current != incoming {
                *current = incoming;
                outcome.applied += 1;
            }
        }
        outcome
    }

    /// Fill metadata on a placeholder document without touching status fields.
    pub fn adopt_item(&mut self, item: &Item) -> bool {
        if !self.item.is_placeholder() || item.is_placeholder() {
            return false;
        }
        let ts = self.item.ts;
        self.item = item.clone();
        self.item.ts = ts;
        true
    }
}

/// Partial copy-status update as carried on the durable queue.
///
/// `None` means "no update for this destination in this message".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ItemInternalCopyStatus {
    #[serde(rename = "Tguid", default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub tguid: Option<Tguid>,
    #[serde(rename = "StatusDEX", default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub status_dex: Option<CopyStatus>,
    #[serde(rename = "StatusEDAV", default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub status_edav: Option<CopyStatus>,
}

impl ItemInternalCopyStatus {
    /// Update naming a single destination field.
    pub fn for_destination(tguid: Tguid, destination: Destination, status: CopyStatus) -> Self {
        let mut msg = Self {
            tguid: Some(tguid),
            ..Default::default()
        };
        match destination {
            Destination::Dex => msg.status_dex = Some(status),
            Destination::Edav => msg.status_edav = Some(status),
        }
        msg
    }

    pub fn status(&self, destination: Destination) -> Option<CopyStatus> {
        match destination {
            Destination::Dex => self.status_dex,
            Destination::Edav => self.status_edav,
        }
    }
}
