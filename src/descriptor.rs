//! Report registry built from the HID report descriptor
//!
//! The registry is the set of report ids a device declares. It is captured
//! once when a session opens and never changes afterwards.

use crate::error::{HidrawError, Result};

/// Short item prefix for a global Report ID item with a 1-byte payload
const REPORT_ID_ITEM: u8 = 0x85;
/// Prefix introducing a long item
const LONG_ITEM: u8 = 0xFE;

/// Report ids declared by a device's report descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportRegistry {
    ids: Vec<u8>,
}

impl ReportRegistry {
    /// Walk the items of a raw report descriptor and collect every Report ID.
    pub fn from_descriptor(desc: &[u8]) -> Result<Self> {
        let mut ids = Vec::new();
        let mut pos = 0;

        while pos < desc.len() {
            let prefix = desc[pos];

            if prefix == LONG_ITEM {
                // [0xFE][data size][long tag][data...]
                let size = *desc.get(pos + 1).ok_or_else(|| truncated(pos))? as usize;
                let end = pos + 3 + size;
                if end > desc.len() {
                    return Err(truncated(pos));
                }
                pos = end;
                continue;
            }

            let size = match prefix & 0x03 {
                3 => 4,
                n => n as usize,
            };
            let end = pos + 1 + size;
            if end > desc.len() {
                return Err(truncated(pos));
            }

            if prefix == REPORT_ID_ITEM {
                let id = desc[pos + 1];
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            pos = end;
        }

        tracing::debug!("Report descriptor declares ids {:02X?}", ids);
        Ok(Self { ids })
    }

    /// Build a registry from a known list of ids.
    pub fn from_ids(ids: impl IntoIterator<Item = u8>) -> Self {
        let mut registry = Self::default();
        for id in ids {
            if !registry.ids.contains(&id) {
                registry.ids.push(id);
            }
        }
        registry
    }

    pub fn contains(&self, report_id: u8) -> bool {
        self.ids.contains(&report_id)
    }

    /// Report ids in descriptor order
    pub fn ids(&self) -> &[u8] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn truncated(offset: usize) -> HidrawError {
    HidrawError::DeviceDescriptor(format!("item at offset {offset} runs past end of descriptor"))
}
