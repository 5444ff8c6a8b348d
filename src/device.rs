//! Vendor document model.
//!
//! The dashboard service describes chargers with two JSON documents: the
//! device record returned by enumeration, and the per-device page tree
//! `dashboard → widgets[] → modules[] → displayDataStreams[]`. Field shapes
//! follow what the service actually emits; numbers and strings are both
//! accepted where the service has been seen to waver.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// One charger, as returned by device enumeration.
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    #[serde(rename = "deviceId")]
    pub device_id: i64,
    pub name: String,
    #[serde(rename = "productName", default)]
    pub product_name: Option<String>,
    #[serde(rename = "hardwareInfo", default)]
    pub hardware_info: Option<HardwareInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HardwareInfo {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
}

impl Device {
    /// Decode the DEVICE_QUERY response payload. The service wraps the list
    /// in a result object in some firmware generations and sends a bare
    /// array in others.
    pub fn list_from_response(value: &Value) -> Result<Vec<Device>> {
        let list = match value {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => map
                .get("devices")
                .or_else(|| map.get("items"))
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .ok_or_else(|| anyhow!("device query response has no device list"))?,
            _ => return Err(anyhow!("device query response is not a list or object")),
        };
        list.iter()
            .map(|item| {
                serde_json::from_value(item.clone())
                    .map_err(|e| anyhow!("bad device record: {}", e))
            })
            .collect()
    }
}

/// The per-device dashboard page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevicePage {
    #[serde(default)]
    pub dashboard: Dashboard,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dashboard {
    #[serde(default)]
    pub widgets: Vec<PageWidget>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageWidget {
    #[serde(default)]
    pub modules: Vec<WidgetModule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WidgetModule {
    #[serde(rename = "displayDataStreams", default)]
    pub display_data_streams: Vec<DataStream>,
}

/// One telemetry or control channel on the page.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DataStream {
    /// Database id.
    pub id: i64,
    /// Runtime pin; this is the id used in `vw` records.
    #[serde(deserialize_with = "stringlike")]
    pub pin: String,
    /// Human label, the key into the widget-mapping table.
    pub name: String,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub visualization: Option<Visualization>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Visualization {
    /// Current/last value as reported by the page.
    #[serde(default, deserialize_with = "opt_stringlike")]
    pub value: Option<String>,
}

impl DataStream {
    pub fn current_value(&self) -> Option<&str> {
        self.visualization.as_ref()?.value.as_deref()
    }
}

impl DevicePage {
    pub fn from_response(value: &Value) -> Result<DevicePage> {
        serde_json::from_value(value.clone()).map_err(|e| anyhow!("bad device page: {}", e))
    }

    pub fn streams(&self) -> impl Iterator<Item = &DataStream> {
        self.dashboard
            .widgets
            .iter()
            .flat_map(|widget| widget.modules.iter())
            .flat_map(|module| module.display_data_streams.iter())
    }
}

fn stringlike<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn opt_stringlike<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected string, number, or null, got {}",
            other
        ))),
    }
}
