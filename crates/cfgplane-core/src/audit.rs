//! Audit records written alongside mutating operations.
//!
//! An audit row names the resource, the action, the operator and the request
//! id. Its `detail` column holds a typed field diff (`FieldChanges`) rather
//! than free-form text, so readers can tell exactly what moved.

use std::collections::BTreeMap;

use cfgplane_store::{AuditRow, IdKind, Txn};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::id::IdGenerator;
use crate::kit::Kit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResource {
    Strategy,
}

impl AuditResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResource::Strategy => "strategy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Delete,
    Publish,
    FinishPublish,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Delete => "delete",
            AuditAction::Publish => "publish",
            AuditAction::FinishPublish => "finish_publish",
        }
    }
}

/// Before/after value of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub before: Value,
    pub after: Value,
}

/// Field diff keyed by field name. Unchanged fields are not recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldChanges(BTreeMap<String, FieldChange>);

impl FieldChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `field` moving from `before` to `after`, if they differ.
    pub fn record<B, A>(mut self, field: &str, before: B, after: A) -> Result<Self>
    where
        B: Serialize,
        A: Serialize,
    {
        let before = to_value(field, before)?;
        let after = to_value(field, after)?;
        if before != after {
            self.0
                .insert(field.to_string(), FieldChange { before, after });
        }
        Ok(self)
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

fn to_value(field: &str, value: impl Serialize) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::InvalidParameter(format!("audit field {}: {}", field, e)))
}

/// Builder for one audit row.
#[derive(Debug, Clone)]
pub struct AuditBuilder {
    resource: AuditResource,
    action: AuditAction,
    biz_id: u32,
    app_id: u32,
    res_id: u32,
    changes: FieldChanges,
}

impl AuditBuilder {
    pub fn new(resource: AuditResource, action: AuditAction) -> Self {
        Self {
            resource,
            action,
            biz_id: 0,
            app_id: 0,
            res_id: 0,
            changes: FieldChanges::new(),
        }
    }

    pub fn tenant(mut self, biz_id: u32, app_id: u32) -> Self {
        self.biz_id = biz_id;
        self.app_id = app_id;
        self
    }

    pub fn resource_id(mut self, res_id: u32) -> Self {
        self.res_id = res_id;
        self
    }

    pub fn changes(mut self, changes: FieldChanges) -> Self {
        self.changes = changes;
        self
    }

    /// Allocate an id and write the row in the caller's transaction.
    pub async fn write(self, kit: &Kit, txn: &mut dyn Txn, ids: &IdGenerator) -> Result<u32> {
        if self.biz_id == 0 || self.res_id == 0 {
            return Err(Error::InvalidParameter(format!(
                "audit of {} {} needs a tenant and a resource id",
                self.resource.as_str(),
                self.action.as_str()
            )));
        }
        let detail = serde_json::to_value(&self.changes)
            .map_err(|e| Error::InvalidParameter(format!("audit detail: {}", e)))?;
        let row = AuditRow {
            id: ids.one(kit, IdKind::Audits).await?,
            biz_id: self.biz_id,
            app_id: self.app_id,
            res_type: self.resource.as_str().to_string(),
            res_id: self.res_id,
            action: self.action.as_str().to_string(),
            operator: kit.user.clone(),
            rid: kit.rid.clone(),
            detail,
            created_at: Utc::now(),
        };
        kit.exec(txn.insert_audit(&row)).await?;
        Ok(row.id)
    }
}
