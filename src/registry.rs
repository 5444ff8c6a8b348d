//! Per-device widget registry.
//!
//! Built once per device page and rebuilt on every reconnect. Indexes the
//! page's data streams three ways: by database id, by human name, and by
//! runtime pin (the id that appears in `vw` records).

use crate::device::{DataStream, DevicePage};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct WidgetRegistry {
    by_id: HashMap<i64, DataStream>,
    by_name: HashMap<String, DataStream>,
    by_pin: HashMap<String, DataStream>,
}

impl WidgetRegistry {
    /// Index every stream on the page. The vendor page has been observed to
    /// contain benign duplicate pins and names; later streams overwrite
    /// earlier ones with a warning.
    pub fn from_page(page: &DevicePage) -> Self {
        let mut registry = WidgetRegistry::default();
        for stream in page.streams() {
            if let Some(prev) = registry.by_id.insert(stream.id, stream.clone()) {
                log::warn!("duplicate stream id {} ({}), keeping later", prev.id, stream.name);
            }
            if let Some(prev) = registry
                .by_name
                .insert(stream.name.clone(), stream.clone())
            {
                log::warn!("duplicate stream name {:?}, keeping later", prev.name);
            }
            if let Some(prev) = registry.by_pin.insert(stream.pin.clone(), stream.clone()) {
                log::warn!("duplicate stream pin {} ({}), keeping later", prev.pin, stream.name);
            }
        }
        registry
    }

    pub fn by_id(&self, id: i64) -> Option<&DataStream> {
        self.by_id.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&DataStream> {
        self.by_name.get(name)
    }

    pub fn by_pin(&self, pin: &str) -> Option<&DataStream> {
        self.by_pin.get(pin)
    }

    /// Streams in database-id order, for deterministic publishing.
    pub fn streams(&self) -> Vec<&DataStream> {
        let mut streams: Vec<&DataStream> = self.by_id.values().collect();
        streams.sort_by_key(|stream| stream.id);
        streams
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
