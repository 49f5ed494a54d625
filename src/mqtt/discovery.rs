//! Home Assistant MQTT discovery payloads.
//!
//! Every value published on a pack's state topic gets one retained config
//! message under `{prefix}/{component}/seplos-mqtt-pack-{n}/{key}/config`.
//! Keys use the abbreviated discovery vocabulary (`stat_t`, `val_tpl`, ..).
use serde::Serialize;

use super::{availability_topic, state_topic};
use crate::cli::config::DiscoveryConfig;
use crate::protocol::{
    telesignalization::{BitKind, Status, BIT_FIELDS},
    CELL_COUNT, CELL_TEMPERATURE_COUNT,
};

pub const MANUFACTURER: &str = "Seplos";
pub const MODEL: &str = "BMS V14 / V16";

/// One retained message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Sensor,
    BinarySensor,
}

impl Component {
    fn as_str(self) -> &'static str {
        match self {
            Component::Sensor => "sensor",
            Component::BinarySensor => "binary_sensor",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Measurement {
    key: &'static str,
    name: &'static str,
    unit: Option<&'static str>,
    device_class: Option<&'static str>,
    state_class: Option<&'static str>,
    precision: Option<u8>,
    icon: &'static str,
}

const fn measurement(
    key: &'static str,
    name: &'static str,
    unit: &'static str,
    device_class: Option<&'static str>,
    precision: u8,
    icon: &'static str,
) -> Measurement {
    Measurement {
        key,
        name,
        unit: Some(unit),
        device_class,
        state_class: Some("measurement"),
        precision: Some(precision),
        icon,
    }
}

const VOLTAGE: Option<&str> = Some("voltage");
const TEMPERATURE: Option<&str> = Some("temperature");

static TELEMETRY_SENSORS: &[Measurement] = &[
    Measurement {
        state_class: None,
        ..measurement("min_cell_voltage", "Min Cell Voltage", "V", VOLTAGE, 3, "mdi:cog")
    },
    Measurement {
        state_class: None,
        ..measurement("max_cell_voltage", "Max Cell Voltage", "V", VOLTAGE, 3, "mdi:cog")
    },
    Measurement {
        state_class: None,
        ..measurement("min_pack_voltage", "Min Pack Voltage", "V", VOLTAGE, 2, "mdi:cog")
    },
    Measurement {
        state_class: None,
        ..measurement("max_pack_voltage", "Max Pack Voltage", "V", VOLTAGE, 2, "mdi:cog")
    },
    measurement("average_cell_voltage", "Average Cell Voltage", "V", VOLTAGE, 3, "mdi:chart-line"),
    Measurement {
        key: "lowest_cell",
        name: "Lowest Cell",
        unit: None,
        device_class: None,
        state_class: None,
        precision: None,
        icon: "mdi:numeric",
    },
    measurement("lowest_cell_voltage", "Lowest Cell Voltage", "V", VOLTAGE, 3, "mdi:arrow-down-thin"),
    Measurement {
        key: "highest_cell",
        name: "Highest Cell",
        unit: None,
        device_class: None,
        state_class: None,
        precision: None,
        icon: "mdi:numeric",
    },
    measurement("highest_cell_voltage", "Highest Cell Voltage", "V", VOLTAGE, 3, "mdi:arrow-up-thin"),
    measurement("delta_cell_voltage", "Delta Cell Voltage", "V", VOLTAGE, 3, "mdi:delta"),
    measurement("delta_cell_temperature", "Delta Cell Temperature", "°C", Some("temperature_delta"), 1, "mdi:delta"),
    measurement("ambient_temperature", "Ambient Temperature", "°C", TEMPERATURE, 1, "mdi:thermometer"),
    measurement("components_temperature", "Components Temperature", "°C", TEMPERATURE, 1, "mdi:thermometer"),
    measurement("dis_charge_current", "Dis-/Charge Current", "A", Some("current"), 2, "mdi:current-dc"),
    measurement("dis_charge_power", "Dis-/Charge Power", "W", Some("power"), 2, "mdi:flash"),
    measurement("total_pack_voltage", "Total Pack Voltage", "V", VOLTAGE, 2, "mdi:server"),
    Measurement {
        state_class: None,
        ..measurement("rated_capacity", "Rated Capacity", "Ah", None, 2, "mdi:battery")
    },
    measurement("battery_capacity", "Battery Capacity", "Ah", None, 2, "mdi:battery"),
    measurement("residual_capacity", "Residual Capacity", "Ah", None, 2, "mdi:battery-50"),
    measurement("soc", "State of Charge", "%", Some("battery"), 1, "mdi:battery"),
    Measurement {
        key: "cycles",
        name: "Charging Cycles",
        unit: Some("cycles"),
        device_class: None,
        state_class: Some("total_increasing"),
        precision: None,
        icon: "mdi:counter",
    },
    measurement("soh", "State of Health", "%", None, 1, "mdi:battery-heart"),
    measurement("port_voltage", "Port Voltage", "V", VOLTAGE, 2, "mdi:flash-triangle"),
];

/// Keys whose sign is flipped when charge measurements are inverted.
const SIGNED_KEYS: [&str; 2] = ["dis_charge_current", "dis_charge_power"];

#[derive(Debug, Clone, Serialize)]
struct Availability {
    t: String,
}

#[derive(Debug, Clone, Serialize)]
struct Device {
    ids: String,
    name: String,
    mf: &'static str,
    mdl: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    via_device: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct EntityConfig {
    name: String,
    uniq_id: String,
    obj_id: String,
    stat_t: String,
    val_tpl: String,
    avty: Availability,
    dev: Device,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_meas: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dev_cla: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stat_cla: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sug_dsp_prc: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ic: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ent_cat: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pl_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pl_off: Option<String>,
}

/// Builds discovery messages for one broker topic tree.
pub struct DiscoveryBuilder<'a> {
    topic: &'a str,
    config: &'a DiscoveryConfig,
}

impl<'a> DiscoveryBuilder<'a> {
    pub fn new(topic: &'a str, config: &'a DiscoveryConfig) -> Self {
        Self { topic, config }
    }

    /// Topic on which the platform announces it came back online.
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.config.prefix)
    }

    fn device(&self, pack: u8) -> Device {
        let role = if pack == 0 { "Master" } else { "Slave" };
        Device {
            ids: format!("seplos_bms_pack_{pack}"),
            name: format!("Seplos BMS Pack-{pack} ({role})"),
            mf: MANUFACTURER,
            mdl: MODEL,
            via_device: (pack > 0).then(|| "seplos_bms_pack_0".to_string()),
        }
    }

    fn entity(&self, pack: u8, key: &str, name: String, val_tpl: String) -> EntityConfig {
        let id = format!("seplos_bms_pack_{pack}_{key}");
        EntityConfig {
            name,
            uniq_id: id.clone(),
            obj_id: id,
            stat_t: state_topic(self.topic, pack),
            val_tpl,
            avty: Availability {
                t: availability_topic(self.topic),
            },
            dev: self.device(pack),
            unit_of_meas: None,
            dev_cla: None,
            stat_cla: None,
            sug_dsp_prc: None,
            ic: None,
            ent_cat: None,
            pl_on: None,
            pl_off: None,
        }
    }

    fn telemetry_template(&self, key: &str) -> String {
        if self.config.invert_charge_measurements && SIGNED_KEYS.contains(&key) {
            format!("{{{{ value_json.telemetry.{key} * -1 }}}}")
        } else {
            format!("{{{{ value_json.telemetry.{key} }}}}")
        }
    }

    fn measurement(&self, pack: u8, key: &str, name: String, meta: &Measurement) -> EntityConfig {
        EntityConfig {
            unit_of_meas: meta.unit,
            dev_cla: meta.device_class,
            stat_cla: meta.state_class,
            sug_dsp_prc: meta.precision,
            ic: Some(meta.icon),
            ..self.entity(pack, key, name, self.telemetry_template(key))
        }
    }

    fn status_sensor(&self, pack: u8, key: &str, name: String, icon: &'static str) -> EntityConfig {
        EntityConfig {
            ic: Some(icon),
            ent_cat: Some("diagnostic"),
            ..self.entity(
                pack,
                key,
                name,
                format!("{{{{ value_json.telesignalization.{key} }}}}"),
            )
        }
    }

    fn binary_sensor(
        &self,
        pack: u8,
        key: &str,
        name: String,
        device_class: &'static str,
        on: Status,
        off: Status,
    ) -> EntityConfig {
        EntityConfig {
            dev_cla: Some(device_class),
            ent_cat: Some("diagnostic"),
            pl_on: Some(on.to_string()),
            pl_off: Some(off.to_string()),
            ..self.entity(
                pack,
                key,
                name,
                format!("{{{{ value_json.telesignalization.{key} }}}}"),
            )
        }
    }

    fn entities(&self, pack: u8) -> Vec<(Component, String, EntityConfig)> {
        let mut entities = Vec::new();
        let mut sensor = |key: String, entity: EntityConfig| {
            entities.push((Component::Sensor, key, entity));
        };

        let cell_voltage = measurement("", "", "V", VOLTAGE, 3, "mdi:battery-outline");
        for cell in 1..=CELL_COUNT {
            let key = format!("voltage_cell_{cell}");
            let entity = self.measurement(pack, &key, format!("Voltage Cell {cell}"), &cell_voltage);
            sensor(key, entity);
        }
        let cell_temperature = measurement("", "", "°C", TEMPERATURE, 1, "mdi:thermometer");
        for sensor_no in 1..=CELL_TEMPERATURE_COUNT {
            let key = format!("cell_temperature_{sensor_no}");
            let entity = self.measurement(
                pack,
                &key,
                format!("Cell Temperature {sensor_no}"),
                &cell_temperature,
            );
            sensor(key, entity);
        }
        for meta in TELEMETRY_SENSORS {
            let entity = self.measurement(pack, meta.key, meta.name.to_string(), meta);
            sensor(meta.key.to_string(), entity);
        }
        sensor(
            "last_update".to_string(),
            EntityConfig {
                ic: Some("mdi:update"),
                ..self.entity(
                    pack,
                    "last_update",
                    "Last Update".to_string(),
                    "{{ value_json.last_update }}".to_string(),
                )
            },
        );

        for cell in 1..=CELL_COUNT {
            let key = format!("cell_voltage_alarm_{cell}");
            let entity = self.status_sensor(pack, &key, format!("Voltage Alarm Cell {cell}"), "mdi:flash-alert");
            sensor(key, entity);
        }
        for sensor_no in 1..=CELL_TEMPERATURE_COUNT {
            let key = format!("cell_temperature_alarm_{sensor_no}");
            let entity = self.status_sensor(
                pack,
                &key,
                format!("Cell Temperature Alarm {sensor_no}"),
                "mdi:thermometer-alert",
            );
            sensor(key, entity);
        }
        for (key, icon) in [
            ("any_cell_voltage_alarm", "mdi:flash-alert"),
            ("any_cell_temperature_alarm", "mdi:thermometer-alert"),
            ("ambient_temperature_alarm", "mdi:thermometer-alert"),
            ("component_temperature_alarm", "mdi:thermometer-alert"),
            ("dis_charging_current_alarm", "mdi:current-dc"),
            ("pack_voltage_alarm", "mdi:flash-alert"),
            ("system_status", "mdi:list-status"),
        ] {
            sensor(key.to_string(), self.status_sensor(pack, key, title_case(key), icon));
        }
        for field in BIT_FIELDS.iter().filter(|field| !field.kind.is_binary()) {
            sensor(
                field.name.to_string(),
                self.status_sensor(pack, field.name, title_case(field.name), "mdi:alert"),
            );
        }

        for cell in 1..=CELL_COUNT {
            let key = format!("balancer_cell_{cell}");
            let entity = self.binary_sensor(
                pack,
                &key,
                format!("Balancer Cell {cell}"),
                "running",
                Status::On,
                Status::Off,
            );
            entities.push((Component::BinarySensor, key, entity));
        }
        for cell in 1..=CELL_COUNT {
            let key = format!("disconnection_cell_{cell}");
            let entity = self.binary_sensor(
                pack,
                &key,
                format!("Connection Cell {cell}"),
                "connectivity",
                Status::Normal,
                Status::Warning,
            );
            entities.push((Component::BinarySensor, key, entity));
        }
        for field in BIT_FIELDS.iter() {
            if let BitKind::Flag {
                active, inactive, ..
            } = field.kind
            {
                let device_class = if active == Status::On { "running" } else { "problem" };
                let entity = self.binary_sensor(
                    pack,
                    field.name,
                    title_case(field.name),
                    device_class,
                    active,
                    inactive,
                );
                entities.push((Component::BinarySensor, field.name.to_string(), entity));
            }
        }
        entities
    }

    /// Every retained config message for `pack`.
    pub fn messages(&self, pack: u8) -> serde_json::Result<Vec<DiscoveryMessage>> {
        self.entities(pack)
            .into_iter()
            .map(|(component, key, entity)| {
                Ok(DiscoveryMessage {
                    topic: format!(
                        "{}/{}/seplos-mqtt-pack-{pack}/{key}/config",
                        self.config.prefix,
                        component.as_str()
                    ),
                    payload: serde_json::to_string(&entity)?,
                })
            })
            .collect()
    }
}

/// `cell_overvoltage` -> `Cell Overvoltage`
fn title_case(key: &str) -> String {
    key.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn payload(messages: &[DiscoveryMessage], topic: &str) -> serde_json::Value {
        let message = messages
            .iter()
            .find(|message| message.topic == topic)
            .unwrap_or_else(|| panic!("missing {topic}"));
        serde_json::from_str(&message.payload).unwrap()
    }

    #[test]
    fn test_topics_are_unique_and_well_formed() {
        let config = DiscoveryConfig::default();
        let messages = DiscoveryBuilder::new("seplos", &config).messages(1).unwrap();
        let topics: HashSet<&str> = messages.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics.len(), messages.len());
        assert!(messages.iter().all(|m| m.topic.starts_with("homeassistant/")
            && m.topic.contains("/seplos-mqtt-pack-1/")
            && m.topic.ends_with("/config")));
        assert!(topics.contains("homeassistant/sensor/seplos-mqtt-pack-1/voltage_cell_16/config"));
        assert!(topics.contains("homeassistant/binary_sensor/seplos-mqtt-pack-1/charge_switch/config"));
        assert!(topics.contains("homeassistant/sensor/seplos-mqtt-pack-1/cell_overvoltage/config"));
    }

    #[test]
    fn test_sensor_payload() {
        let config = DiscoveryConfig::default();
        let messages = DiscoveryBuilder::new("seplos", &config).messages(0).unwrap();
        let soc = payload(&messages, "homeassistant/sensor/seplos-mqtt-pack-0/soc/config");
        assert_eq!(soc["stat_t"], "seplos/pack-0/sensors");
        assert_eq!(soc["val_tpl"], "{{ value_json.telemetry.soc }}");
        assert_eq!(soc["avty"]["t"], "seplos/availability");
        assert_eq!(soc["unit_of_meas"], "%");
        assert_eq!(soc["uniq_id"], "seplos_bms_pack_0_soc");
        assert_eq!(soc["dev"]["name"], "Seplos BMS Pack-0 (Master)");
        assert!(soc["dev"].get("via_device").is_none());

        let cell = payload(&messages, "homeassistant/sensor/seplos-mqtt-pack-0/voltage_cell_3/config");
        assert_eq!(cell["name"], "Voltage Cell 3");
        assert_eq!(cell["val_tpl"], "{{ value_json.telemetry.voltage_cell_3 }}");
    }

    #[test]
    fn test_binary_sensor_payloads_match_status_vocabulary() {
        let config = DiscoveryConfig::default();
        let messages = DiscoveryBuilder::new("seplos", &config).messages(2).unwrap();
        let switch = payload(
            &messages,
            "homeassistant/binary_sensor/seplos-mqtt-pack-2/discharge_switch/config",
        );
        assert_eq!(switch["pl_on"], "on");
        assert_eq!(switch["pl_off"], "off");
        assert_eq!(switch["dev"]["via_device"], "seplos_bms_pack_0");
        assert_eq!(switch["dev"]["name"], "Seplos BMS Pack-2 (Slave)");

        let failure = payload(
            &messages,
            "homeassistant/binary_sensor/seplos-mqtt-pack-2/rtc_clock_failure/config",
        );
        assert_eq!(failure["pl_on"], "failure");
        assert_eq!(failure["pl_off"], "normal");
        assert_eq!(failure["dev_cla"], "problem");
    }

    #[test]
    fn test_charge_inversion() {
        let inverted = DiscoveryConfig::default();
        let messages = DiscoveryBuilder::new("seplos", &inverted).messages(0).unwrap();
        let current = payload(
            &messages,
            "homeassistant/sensor/seplos-mqtt-pack-0/dis_charge_current/config",
        );
        assert_eq!(current["val_tpl"], "{{ value_json.telemetry.dis_charge_current * -1 }}");

        let plain = DiscoveryConfig {
            invert_charge_measurements: false,
            ..DiscoveryConfig::default()
        };
        let messages = DiscoveryBuilder::new("seplos", &plain).messages(0).unwrap();
        let power = payload(
            &messages,
            "homeassistant/sensor/seplos-mqtt-pack-0/dis_charge_power/config",
        );
        assert_eq!(power["val_tpl"], "{{ value_json.telemetry.dis_charge_power }}");
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("cell_overvoltage"), "Cell Overvoltage");
        assert_eq!(title_case("soc_low"), "Soc Low");
    }
}
