//! Telesignalization (CID2 0x44) payload decoder.
//!
//! Alarm levels arrive as whole bytes, everything else as bit fields. Bit
//! fields are described once in [`BIT_FIELDS`]; decoding walks that table, so
//! adding a field never touches the decoder.
use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use serde::{ser::SerializeMap, Serialize, Serializer};
use strum::Display;

use super::{check_cell_count, check_payload_len, Command, DecodeError};
use super::{CELL_COUNT, CELL_TEMPERATURE_COUNT};

pub const PAYLOAD_LEN: usize = 49;

mod offset {
    pub const CELL_COUNT: usize = 2;
    pub const CELL_VOLTAGE_ALARMS: usize = 3;
    pub const CELL_TEMPERATURE_ALARMS: usize = 20;
    pub const AMBIENT_TEMPERATURE_ALARM: usize = 24;
    pub const COMPONENT_TEMPERATURE_ALARM: usize = 25;
    pub const CURRENT_ALARM: usize = 26;
    pub const PACK_VOLTAGE_ALARM: usize = 27;
    pub const EVENT_1: usize = 29;
    pub const EVENT_2: usize = 30;
    pub const EVENT_3: usize = 31;
    pub const EVENT_4: usize = 32;
    pub const EVENT_5: usize = 33;
    pub const EVENT_6: usize = 34;
    pub const SWITCHES: usize = 35;
    pub const BALANCER: usize = 36;
    pub const SYSTEM_STATUS: usize = 38;
    pub const DISCONNECTION: usize = 39;
    pub const EVENT_7: usize = 41;
    pub const EVENT_8: usize = 42;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    Normal,
    LowAlarm,
    HighAlarm,
    Alarm,
    Warning,
    Protection,
    Lockout,
    Failure,
    On,
    Off,
    Unknown,
}

impl Status {
    /// Whole-byte alarm level used by the per-cell and pack level alarms.
    pub fn from_alarm_byte(byte: u8) -> Self {
        match byte {
            0x00 => Status::Normal,
            0x01 => Status::LowAlarm,
            0x02 => Status::HighAlarm,
            0xF0 => Status::Alarm,
            _ => Status::Unknown,
        }
    }

    pub fn is_normal(self) -> bool {
        self == Status::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SystemStatus {
    Discharging,
    Charging,
    FloatingCharge,
    Standby,
    Off,
    Unknown,
}

const SYSTEM_STATUS_BITS: [(u8, SystemStatus); 5] = [
    (0, SystemStatus::Discharging),
    (1, SystemStatus::Charging),
    (2, SystemStatus::FloatingCharge),
    (4, SystemStatus::Standby),
    (5, SystemStatus::Off),
];

impl SystemStatus {
    /// The highest recognised bit wins when several are set.
    pub fn from_byte(byte: u8) -> Self {
        SYSTEM_STATUS_BITS
            .iter()
            .rev()
            .find(|(bit, _)| byte & (1 << bit) != 0)
            .map(|&(_, status)| status)
            .unwrap_or(SystemStatus::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitKind {
    /// One bit: `active` when set, `inactive` otherwise.
    Flag {
        bit: u8,
        active: Status,
        inactive: Status,
    },
    /// Two bits. `first` takes precedence when both are set.
    Pair {
        first: u8,
        second: u8,
        first_state: Status,
        second_state: Status,
    },
}

impl BitKind {
    pub fn decode(self, byte: u8) -> Status {
        let set = |bit: u8| bit < 8 && byte & (1 << bit) != 0;
        match self {
            BitKind::Flag { bit, .. } if bit > 7 => Status::Unknown,
            BitKind::Flag {
                bit,
                active,
                inactive,
            } => {
                if set(bit) {
                    active
                } else {
                    inactive
                }
            }
            BitKind::Pair { first, second, .. } if first > 7 || second > 7 => Status::Unknown,
            BitKind::Pair {
                first,
                second,
                first_state,
                second_state,
            } => {
                if set(first) {
                    first_state
                } else if set(second) {
                    second_state
                } else {
                    Status::Normal
                }
            }
        }
    }

    fn bits(self) -> impl Iterator<Item = u8> {
        let (a, b) = match self {
            BitKind::Flag { bit, .. } => (bit, None),
            BitKind::Pair { first, second, .. } => (first, Some(second)),
        };
        std::iter::once(a).chain(b)
    }

    /// On/off style fields are published as binary sensors.
    pub fn is_binary(self) -> bool {
        matches!(self, BitKind::Flag { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub name: &'static str,
    pub offset: usize,
    pub kind: BitKind,
}

const fn flag(name: &'static str, offset: usize, bit: u8, active: Status, inactive: Status) -> BitField {
    BitField {
        name,
        offset,
        kind: BitKind::Flag {
            bit,
            active,
            inactive,
        },
    }
}

const fn failure(name: &'static str, offset: usize, bit: u8) -> BitField {
    flag(name, offset, bit, Status::Failure, Status::Normal)
}

const fn warning(name: &'static str, offset: usize, bit: u8) -> BitField {
    flag(name, offset, bit, Status::Warning, Status::Normal)
}

const fn protection(name: &'static str, offset: usize, bit: u8) -> BitField {
    flag(name, offset, bit, Status::Protection, Status::Normal)
}

const fn on_off(name: &'static str, offset: usize, bit: u8) -> BitField {
    flag(name, offset, bit, Status::On, Status::Off)
}

/// Alarm bit first, protection bit second.
const fn alarm_protection(name: &'static str, offset: usize, first: u8, second: u8) -> BitField {
    BitField {
        name,
        offset,
        kind: BitKind::Pair {
            first,
            second,
            first_state: Status::Alarm,
            second_state: Status::Protection,
        },
    }
}

/// Protection bit first, lockout bit second.
const fn protection_lockout(name: &'static str, offset: usize, first: u8, second: u8) -> BitField {
    BitField {
        name,
        offset,
        kind: BitKind::Pair {
            first,
            second,
            first_state: Status::Protection,
            second_state: Status::Lockout,
        },
    }
}

use offset::*;

pub static BIT_FIELDS: [BitField; 41] = [
    failure("voltage_sensing_failure", EVENT_1, 0),
    failure("temperature_sensing_failure", EVENT_1, 1),
    failure("current_sensing_failure", EVENT_1, 2),
    failure("power_switch_failure", EVENT_1, 3),
    failure("cell_voltage_difference_sensing_failure", EVENT_1, 4),
    failure("charging_switch_failure", EVENT_1, 5),
    failure("discharging_switch_failure", EVENT_1, 6),
    failure("current_limit_switch_failure", EVENT_1, 7),
    alarm_protection("cell_overvoltage", EVENT_2, 0, 1),
    alarm_protection("cell_voltage_low", EVENT_2, 2, 3),
    alarm_protection("pack_overvoltage", EVENT_2, 4, 5),
    alarm_protection("pack_voltage_low", EVENT_2, 6, 7),
    alarm_protection("charging_temperature_high", EVENT_3, 0, 1),
    alarm_protection("charging_temperature_low", EVENT_3, 2, 3),
    alarm_protection("discharging_temperature_high", EVENT_3, 4, 5),
    alarm_protection("discharging_temperature_low", EVENT_3, 6, 7),
    alarm_protection("ambient_temperature_high", EVENT_4, 0, 1),
    alarm_protection("ambient_temperature_low", EVENT_4, 2, 3),
    alarm_protection("component_temperature_high", EVENT_4, 4, 5),
    on_off("low_temperature_heating", EVENT_4, 6),
    alarm_protection("charging_overcurrent", EVENT_5, 0, 1),
    alarm_protection("discharging_overcurrent", EVENT_5, 2, 3),
    protection_lockout("transient_overcurrent", EVENT_5, 4, 6),
    protection_lockout("output_short_circuit", EVENT_5, 5, 7),
    protection("charging_high_voltage_protection", EVENT_6, 0),
    warning("intermittent_power_supplement", EVENT_6, 1),
    alarm_protection("soc_low", EVENT_6, 2, 3),
    protection("cell_low_voltage_forbidden_charging", EVENT_6, 4),
    protection("output_reverse_polarity_protection", EVENT_6, 5),
    failure("output_connection_failure", EVENT_6, 6),
    on_off("discharge_switch", SWITCHES, 0),
    on_off("charge_switch", SWITCHES, 1),
    on_off("current_limit_switch", SWITCHES, 2),
    on_off("heating_switch", SWITCHES, 3),
    warning("auto_charging_wait", EVENT_7, 4),
    warning("manual_charging_wait", EVENT_7, 5),
    failure("eep_storage_failure", EVENT_8, 0),
    failure("rtc_clock_failure", EVENT_8, 1),
    warning("no_calibration_of_voltage", EVENT_8, 2),
    warning("no_calibration_of_current", EVENT_8, 3),
    warning("no_calibration_of_null_point", EVENT_8, 4),
];

/// Bytes whose every bit is expected to be described by [`BIT_FIELDS`].
const EVENT_BYTES: [usize; 9] = [
    EVENT_1, EVENT_2, EVENT_3, EVENT_4, EVENT_5, EVENT_6, SWITCHES, EVENT_7, EVENT_8,
];

static FIELD_INDEX: Lazy<HashMap<(usize, u8), &'static BitField>> = Lazy::new(|| {
    BIT_FIELDS
        .iter()
        .flat_map(|field| field.kind.bits().map(move |bit| ((field.offset, bit), field)))
        .collect()
});

/// Field occupying `bit` of the byte at `offset`, if any.
pub fn field_at(offset: usize, bit: u8) -> Option<&'static BitField> {
    FIELD_INDEX.get(&(offset, bit)).copied()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelesignalizationRecord {
    pub cell_voltage_alarms: [Status; CELL_COUNT],
    pub cell_temperature_alarms: [Status; CELL_TEMPERATURE_COUNT],
    pub ambient_temperature_alarm: Status,
    pub component_temperature_alarm: Status,
    pub dis_charging_current_alarm: Status,
    pub pack_voltage_alarm: Status,
    /// Named bit fields, plus `unknown_bit_{offset}_{bit}` for set bits the
    /// table does not describe.
    pub flags: BTreeMap<String, Status>,
    pub system_status: SystemStatus,
    pub cell_balancing: [Status; CELL_COUNT],
    pub cell_disconnection: [Status; CELL_COUNT],
}

fn aggregate(alarms: &[Status]) -> Status {
    if alarms.iter().all(|status| status.is_normal()) {
        Status::Normal
    } else {
        Status::Alarm
    }
}

fn per_cell(payload: &[u8], first_byte: usize, active: Status, inactive: Status) -> [Status; CELL_COUNT] {
    let mut cells = [inactive; CELL_COUNT];
    for (index, cell) in cells.iter_mut().enumerate() {
        let byte = payload[first_byte + index / 8];
        if byte & (1 << (index % 8)) != 0 {
            *cell = active;
        }
    }
    cells
}

impl TelesignalizationRecord {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        check_payload_len(Command::Telesignalization, payload)?;
        check_cell_count(Command::Telesignalization, payload[offset::CELL_COUNT])?;

        let mut cell_voltage_alarms = [Status::Normal; CELL_COUNT];
        for (index, status) in cell_voltage_alarms.iter_mut().enumerate() {
            *status = Status::from_alarm_byte(payload[CELL_VOLTAGE_ALARMS + index]);
        }
        let mut cell_temperature_alarms = [Status::Normal; CELL_TEMPERATURE_COUNT];
        for (index, status) in cell_temperature_alarms.iter_mut().enumerate() {
            *status = Status::from_alarm_byte(payload[CELL_TEMPERATURE_ALARMS + index]);
        }

        let mut flags: BTreeMap<String, Status> = BIT_FIELDS
            .iter()
            .map(|field| (field.name.to_string(), field.kind.decode(payload[field.offset])))
            .collect();
        for &at in &EVENT_BYTES {
            for bit in 0..8u8 {
                if payload[at] & (1 << bit) != 0 && field_at(at, bit).is_none() {
                    log::debug!("unrecognised status bit {bit} set in byte {at}");
                    flags.insert(format!("unknown_bit_{at}_{bit}"), Status::Unknown);
                }
            }
        }

        Ok(Self {
            cell_voltage_alarms,
            cell_temperature_alarms,
            ambient_temperature_alarm: Status::from_alarm_byte(payload[AMBIENT_TEMPERATURE_ALARM]),
            component_temperature_alarm: Status::from_alarm_byte(
                payload[COMPONENT_TEMPERATURE_ALARM],
            ),
            dis_charging_current_alarm: Status::from_alarm_byte(payload[CURRENT_ALARM]),
            pack_voltage_alarm: Status::from_alarm_byte(payload[PACK_VOLTAGE_ALARM]),
            flags,
            system_status: SystemStatus::from_byte(payload[SYSTEM_STATUS]),
            cell_balancing: per_cell(payload, BALANCER, Status::On, Status::Off),
            cell_disconnection: per_cell(payload, DISCONNECTION, Status::Warning, Status::Normal),
        })
    }

    pub fn any_cell_voltage_alarm(&self) -> Status {
        aggregate(&self.cell_voltage_alarms)
    }

    pub fn any_cell_temperature_alarm(&self) -> Status {
        aggregate(&self.cell_temperature_alarms)
    }

    /// Status of a named bit field, `Unknown` if the name is not in the table.
    pub fn flag(&self, name: &str) -> Status {
        self.flags.get(name).copied().unwrap_or(Status::Unknown)
    }
}

impl Serialize for TelesignalizationRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (index, status) in self.cell_voltage_alarms.iter().enumerate() {
            map.serialize_entry(&format!("cell_voltage_alarm_{}", index + 1), status)?;
        }
        map.serialize_entry("any_cell_voltage_alarm", &self.any_cell_voltage_alarm())?;
        for (index, status) in self.cell_temperature_alarms.iter().enumerate() {
            map.serialize_entry(&format!("cell_temperature_alarm_{}", index + 1), status)?;
        }
        map.serialize_entry("any_cell_temperature_alarm", &self.any_cell_temperature_alarm())?;
        map.serialize_entry("ambient_temperature_alarm", &self.ambient_temperature_alarm)?;
        map.serialize_entry("component_temperature_alarm", &self.component_temperature_alarm)?;
        map.serialize_entry("dis_charging_current_alarm", &self.dis_charging_current_alarm)?;
        map.serialize_entry("pack_voltage_alarm", &self.pack_voltage_alarm)?;
        for (name, status) in &self.flags {
            map.serialize_entry(name, status)?;
        }
        map.serialize_entry("system_status", &self.system_status)?;
        for (index, status) in self.cell_balancing.iter().enumerate() {
            map.serialize_entry(&format!("balancer_cell_{}", index + 1), status)?;
        }
        for (index, status) in self.cell_disconnection.iter().enumerate() {
            map.serialize_entry(&format!("disconnection_cell_{}", index + 1), status)?;
        }
        map.end()
    }
}

/// Builder for synthetic telesignalization payloads, shared with the
/// integration tests.
#[doc(hidden)]
pub mod fixture {
    use super::{offset, PAYLOAD_LEN};

    pub struct TelesignalizationPayload {
        bytes: [u8; PAYLOAD_LEN],
    }

    impl Default for TelesignalizationPayload {
        fn default() -> Self {
            let mut bytes = [0; PAYLOAD_LEN];
            bytes[offset::CELL_COUNT] = 16;
            bytes[19] = 4;
            bytes[28] = 20;
            Self { bytes }
        }
    }

    impl TelesignalizationPayload {
        pub fn set(mut self, at: usize, value: u8) -> Self {
            self.bytes[at] = value;
            self
        }

        pub fn build(self) -> Vec<u8> {
            self.bytes.to_vec()
        }
    }
}
