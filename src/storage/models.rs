use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::modbus::types::RegisterBlockType;

/// One persisted register word or bit, scoped by server ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRecord {
    pub server_id: String,
    pub unit_id: u8,
    pub block_type: RegisterBlockType,
    pub address: u16,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub value: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterKey {
    pub server_id: String,
    pub unit_id: u8,
    pub block_type: RegisterBlockType,
    pub address: u16,
}

impl RegisterRecord {
    pub fn new(
        server_id: &str,
        unit_id: u8,
        block_type: RegisterBlockType,
        address: u16,
        value: u16,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            unit_id,
            block_type,
            address,
            created: now,
            modified: now,
            value,
        }
    }

    pub fn key(&self) -> RegisterKey {
        RegisterKey {
            server_id: self.server_id.clone(),
            unit_id: self.unit_id,
            block_type: self.block_type,
            address: self.address,
        }
    }
}

/// Current time at the millisecond precision records are stored with.
pub fn record_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
