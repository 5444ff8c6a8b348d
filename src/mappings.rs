//! Static widget-to-entity mapping tables.
//!
//! Only widgets named here become Home Assistant entities; everything else on
//! the device page is ignored. Entries carry the HA metadata the discovery
//! documents need.

/// How one named widget is rendered in Home Assistant.
#[derive(Debug, Clone, Copy)]
pub struct WidgetMapping {
    pub widget_name: &'static str,
    /// Stable topic segment; defaults to a slug of the widget name.
    pub topic_id: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub state_class: Option<&'static str>,
    pub unit: Option<&'static str>,
    pub icon: Option<&'static str>,
}

pub const WIDGET_MAPPINGS: &[WidgetMapping] = &[
    WidgetMapping {
        widget_name: "Voltage",
        topic_id: None,
        device_class: Some("voltage"),
        state_class: Some("measurement"),
        unit: Some("V"),
        icon: None,
    },
    WidgetMapping {
        widget_name: "Current",
        topic_id: None,
        device_class: Some("current"),
        state_class: Some("measurement"),
        unit: Some("A"),
        icon: None,
    },
    WidgetMapping {
        widget_name: "Power",
        topic_id: None,
        device_class: Some("power"),
        state_class: Some("measurement"),
        unit: Some("W"),
        icon: None,
    },
    WidgetMapping {
        widget_name: "Session energy",
        topic_id: Some("session_energy"),
        device_class: Some("energy"),
        state_class: Some("total_increasing"),
        unit: Some("kWh"),
        icon: None,
    },
    WidgetMapping {
        widget_name: "Total energy",
        topic_id: Some("total_energy"),
        device_class: Some("energy"),
        state_class: Some("total_increasing"),
        unit: Some("kWh"),
        icon: None,
    },
    WidgetMapping {
        widget_name: "Temperature",
        topic_id: None,
        device_class: Some("temperature"),
        state_class: Some("measurement"),
        unit: Some("°C"),
        icon: None,
    },
    WidgetMapping {
        widget_name: "Status",
        topic_id: Some("status"),
        device_class: None,
        state_class: None,
        unit: None,
        icon: Some("mdi:ev-station"),
    },
    WidgetMapping {
        widget_name: "Current max",
        topic_id: Some("current_max"),
        device_class: Some("current"),
        state_class: None,
        unit: Some("A"),
        icon: None,
    },
];

/// Widgets that additionally get a writable number entity and a command
/// topic.
pub const CONTROLLABLE_WIDGETS: &[&str] = &["Current"];

pub const STATUS_WIDGET: &str = "Status";
pub const CURRENT_MAX_WIDGET: &str = "Current max";

/// The pin the multi-step charging protocol writes to. Empirical; the bridge
/// refuses to wire the charging switch for a device whose Status stream
/// reports a different pin.
pub const CHARGING_PIN: &str = "15";

/// Slider ceiling when the device has no usable `Current max` widget.
pub const DEFAULT_CURRENT_MAX: f64 = 48.0;

/// Raw Status value meaning "charging".
pub const STATUS_CHARGING: &str = "2";

pub fn mapping_for(widget_name: &str) -> Option<&'static WidgetMapping> {
    WIDGET_MAPPINGS
        .iter()
        .find(|mapping| mapping.widget_name == widget_name)
}

pub fn is_controllable(widget_name: &str) -> bool {
    CONTROLLABLE_WIDGETS.contains(&widget_name)
}

/// Topic segment for a widget: the declared `topic_id`, else the name
/// lowercased with non-alphanumeric runs collapsed to `_`.
pub fn entity_id(widget_name: &str) -> String {
    if let Some(mapping) = mapping_for(widget_name) {
        if let Some(topic_id) = mapping.topic_id {
            return topic_id.to_string();
        }
    }
    slug(widget_name)
}

pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Human-readable form of the raw Status values.
pub fn translate_status(raw: &str) -> Option<&'static str> {
    match raw {
        "0" => Some("unplugged"),
        "1" => Some("plugged"),
        "2" => Some("charging"),
        "3" => Some("stopped"),
        _ => None,
    }
}
