//! Telemetry (CID2 0x42) payload decoder.
//!
//! The payload is a fixed 75 byte layout of big-endian words. Every field is
//! read from a constant offset and scaled to physical units here, so a record
//! never holds raw register values.
use serde::{ser::SerializeMap, Serialize, Serializer};

use super::{check_cell_count, check_payload_len, metrics, Command, DecodeError};
use super::{CELL_COUNT, CELL_TEMPERATURE_COUNT};

pub const PAYLOAD_LEN: usize = 75;

/// Kelvin offset in 0.1 K units used by every temperature word.
const KELVIN_OFFSET: i32 = 2731;

mod offset {
    pub const CELL_COUNT: usize = 2;
    pub const CELL_VOLTAGES: usize = 3;
    pub const CELL_TEMPERATURES: usize = 36;
    pub const AMBIENT_TEMPERATURE: usize = 44;
    pub const COMPONENT_TEMPERATURE: usize = 46;
    pub const CURRENT: usize = 48;
    pub const TOTAL_VOLTAGE: usize = 50;
    pub const RESIDUAL_CAPACITY: usize = 52;
    pub const BATTERY_CAPACITY: usize = 55;
    pub const SOC: usize = 57;
    pub const RATED_CAPACITY: usize = 59;
    pub const CYCLES: usize = 61;
    pub const SOH: usize = 63;
    pub const PORT_VOLTAGE: usize = 65;
}

/// Configured cell voltage references. Pack limits are derived from these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellVoltageLimits {
    pub min: f64,
    pub max: f64,
}

impl Default for CellVoltageLimits {
    fn default() -> Self {
        Self {
            min: 2.5,
            max: 3.65,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub min_cell_voltage: f64,
    pub max_cell_voltage: f64,
    pub min_pack_voltage: f64,
    pub max_pack_voltage: f64,
    pub cell_voltages: [f64; CELL_COUNT],
    pub average_cell_voltage: f64,
    pub lowest_cell: metrics::CellExtreme,
    pub highest_cell: metrics::CellExtreme,
    pub delta_cell_voltage: f64,
    pub cell_temperatures: [f64; CELL_TEMPERATURE_COUNT],
    pub delta_cell_temperature: f64,
    pub ambient_temperature: f64,
    pub components_temperature: f64,
    /// Amperes, positive while charging.
    pub dis_charge_current: f64,
    pub total_pack_voltage: f64,
    pub dis_charge_power: f64,
    pub rated_capacity: f64,
    pub battery_capacity: f64,
    pub residual_capacity: f64,
    pub soc: f64,
    pub cycles: u16,
    pub soh: f64,
    pub port_voltage: f64,
}

fn word(payload: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([payload[at], payload[at + 1]])
}

fn scaled(payload: &[u8], at: usize, divisor: f64) -> f64 {
    word(payload, at) as f64 / divisor
}

fn temperature(payload: &[u8], at: usize) -> f64 {
    (word(payload, at) as i32 - KELVIN_OFFSET) as f64 / 10.0
}

impl TelemetryRecord {
    /// Decode a validated telemetry payload.
    pub fn decode(payload: &[u8], limits: &CellVoltageLimits) -> Result<Self, DecodeError> {
        check_payload_len(Command::Telemetry, payload)?;
        check_cell_count(Command::Telemetry, payload[offset::CELL_COUNT])?;

        let mut cell_voltages = [0.0; CELL_COUNT];
        for (index, voltage) in cell_voltages.iter_mut().enumerate() {
            *voltage = scaled(payload, offset::CELL_VOLTAGES + index * 2, 1000.0);
        }
        let mut cell_temperatures = [0.0; CELL_TEMPERATURE_COUNT];
        for (index, value) in cell_temperatures.iter_mut().enumerate() {
            *value = temperature(payload, offset::CELL_TEMPERATURES + index * 2);
        }

        let lowest_cell = metrics::lowest_cell(&cell_voltages);
        let highest_cell = metrics::highest_cell(&cell_voltages);
        let current = word(payload, offset::CURRENT) as i16 as f64 / 100.0;
        let total_pack_voltage = scaled(payload, offset::TOTAL_VOLTAGE, 100.0);

        Ok(Self {
            min_cell_voltage: limits.min,
            max_cell_voltage: limits.max,
            min_pack_voltage: metrics::round_to(limits.min * CELL_COUNT as f64, 3),
            max_pack_voltage: metrics::round_to(limits.max * CELL_COUNT as f64, 3),
            average_cell_voltage: metrics::average_cell_voltage(&cell_voltages),
            delta_cell_voltage: metrics::delta_cell_voltage(lowest_cell, highest_cell),
            lowest_cell,
            highest_cell,
            cell_voltages,
            delta_cell_temperature: metrics::delta_temperature(&cell_temperatures),
            cell_temperatures,
            ambient_temperature: temperature(payload, offset::AMBIENT_TEMPERATURE),
            components_temperature: temperature(payload, offset::COMPONENT_TEMPERATURE),
            dis_charge_current: current,
            total_pack_voltage,
            dis_charge_power: metrics::power(total_pack_voltage, current),
            rated_capacity: scaled(payload, offset::RATED_CAPACITY, 100.0),
            battery_capacity: scaled(payload, offset::BATTERY_CAPACITY, 100.0),
            residual_capacity: scaled(payload, offset::RESIDUAL_CAPACITY, 100.0),
            soc: scaled(payload, offset::SOC, 10.0),
            cycles: word(payload, offset::CYCLES),
            soh: scaled(payload, offset::SOH, 10.0),
            port_voltage: scaled(payload, offset::PORT_VOLTAGE, 100.0),
        })
    }
}

/// Flat key layout consumed by the broker and the discovery templates.
impl Serialize for TelemetryRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("min_cell_voltage", &self.min_cell_voltage)?;
        map.serialize_entry("max_cell_voltage", &self.max_cell_voltage)?;
        map.serialize_entry("min_pack_voltage", &self.min_pack_voltage)?;
        map.serialize_entry("max_pack_voltage", &self.max_pack_voltage)?;
        for (index, voltage) in self.cell_voltages.iter().enumerate() {
            map.serialize_entry(&format!("voltage_cell_{}", index + 1), voltage)?;
        }
        map.serialize_entry("average_cell_voltage", &self.average_cell_voltage)?;
        map.serialize_entry("lowest_cell", &self.lowest_cell.cell)?;
        map.serialize_entry("lowest_cell_voltage", &self.lowest_cell.voltage)?;
        map.serialize_entry("highest_cell", &self.highest_cell.cell)?;
        map.serialize_entry("highest_cell_voltage", &self.highest_cell.voltage)?;
        map.serialize_entry("delta_cell_voltage", &self.delta_cell_voltage)?;
        for (index, value) in self.cell_temperatures.iter().enumerate() {
            map.serialize_entry(&format!("cell_temperature_{}", index + 1), value)?;
        }
        map.serialize_entry("delta_cell_temperature", &self.delta_cell_temperature)?;
        map.serialize_entry("ambient_temperature", &self.ambient_temperature)?;
        map.serialize_entry("components_temperature", &self.components_temperature)?;
        map.serialize_entry("dis_charge_current", &self.dis_charge_current)?;
        map.serialize_entry("total_pack_voltage", &self.total_pack_voltage)?;
        map.serialize_entry("dis_charge_power", &self.dis_charge_power)?;
        map.serialize_entry("rated_capacity", &self.rated_capacity)?;
        map.serialize_entry("battery_capacity", &self.battery_capacity)?;
        map.serialize_entry("residual_capacity", &self.residual_capacity)?;
        map.serialize_entry("soc", &self.soc)?;
        map.serialize_entry("cycles", &self.cycles)?;
        map.serialize_entry("soh", &self.soh)?;
        map.serialize_entry("port_voltage", &self.port_voltage)?;
        map.end()
    }
}

/// Builder for synthetic telemetry payloads, shared with the integration tests.
#[doc(hidden)]
pub mod fixture {
    use super::{offset, PAYLOAD_LEN};

    pub struct TelemetryPayload {
        bytes: [u8; PAYLOAD_LEN],
    }

    impl Default for TelemetryPayload {
        fn default() -> Self {
            let mut payload = Self {
                bytes: [0; PAYLOAD_LEN],
            };
            payload.bytes[offset::CELL_COUNT] = 16;
            payload.bytes[35] = 6;
            payload.bytes[54] = 10;
            payload
                .cells_mv([3300; 16])
                .temperatures_raw([2981; 4])
                .put(offset::AMBIENT_TEMPERATURE, 2961)
                .put(offset::COMPONENT_TEMPERATURE, 3001)
                .put(offset::TOTAL_VOLTAGE, 5280)
                .put(offset::RESIDUAL_CAPACITY, 18000)
                .put(offset::BATTERY_CAPACITY, 20000)
                .put(offset::SOC, 900)
                .put(offset::RATED_CAPACITY, 20000)
                .put(offset::CYCLES, 42)
                .put(offset::SOH, 1000)
                .put(offset::PORT_VOLTAGE, 5279)
        }
    }

    impl TelemetryPayload {
        pub fn put(mut self, at: usize, value: u16) -> Self {
            self.bytes[at..at + 2].copy_from_slice(&value.to_be_bytes());
            self
        }

        pub fn cells_mv(mut self, cells: [u16; 16]) -> Self {
            for (index, mv) in cells.into_iter().enumerate() {
                self = self.put(offset::CELL_VOLTAGES + index * 2, mv);
            }
            self
        }

        pub fn temperatures_raw(mut self, raw: [u16; 4]) -> Self {
            for (index, value) in raw.into_iter().enumerate() {
                self = self.put(offset::CELL_TEMPERATURES + index * 2, value);
            }
            self
        }

        /// Current in 10 mA steps, positive while charging.
        pub fn current_centiamps(self, value: i16) -> Self {
            self.put(offset::CURRENT, value as u16)
        }

        pub fn build(self) -> Vec<u8> {
            self.bytes.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixture::TelemetryPayload;
    use super::*;

    #[test]
    fn test_decode_scales_every_field() {
        let payload = TelemetryPayload::default()
            .current_centiamps(-1050)
            .build();
        let record = TelemetryRecord::decode(&payload, &CellVoltageLimits::default()).unwrap();

        assert_eq!(record.cell_voltages, [3.3; 16]);
        assert_eq!(record.cell_temperatures, [25.0; 4]);
        assert_eq!(record.ambient_temperature, 23.0);
        assert_eq!(record.components_temperature, 27.0);
        assert_eq!(record.dis_charge_current, -10.5);
        assert_eq!(record.total_pack_voltage, 52.8);
        assert_eq!(record.dis_charge_power, -554.4);
        assert_eq!(record.residual_capacity, 180.0);
        assert_eq!(record.battery_capacity, 200.0);
        assert_eq!(record.rated_capacity, 200.0);
        assert_eq!(record.soc, 90.0);
        assert_eq!(record.cycles, 42);
        assert_eq!(record.soh, 100.0);
        assert_eq!(record.port_voltage, 52.79);
        assert_eq!(record.min_pack_voltage, 40.0);
        assert_eq!(record.max_pack_voltage, 58.4);
    }

    #[test]
    fn test_below_freezing_temperature() {
        let payload = TelemetryPayload::default()
            .temperatures_raw([2681, 2731, 2732, 2981])
            .build();
        let record = TelemetryRecord::decode(&payload, &CellVoltageLimits::default()).unwrap();
        assert_eq!(record.cell_temperatures, [-5.0, 0.0, 0.1, 25.0]);
        assert_eq!(record.delta_cell_temperature, 30.0);
    }

    #[test]
    fn test_derived_cell_metrics() {
        let mut cells = [3300u16; 16];
        cells[2] = 3291;
        cells[9] = 3312;
        let payload = TelemetryPayload::default().cells_mv(cells).build();
        let record = TelemetryRecord::decode(&payload, &CellVoltageLimits::default()).unwrap();

        assert_eq!(record.lowest_cell.cell, 3);
        assert_eq!(record.lowest_cell.voltage, 3.291);
        assert_eq!(record.highest_cell.cell, 10);
        assert_eq!(record.highest_cell.voltage, 3.312);
        assert_eq!(record.delta_cell_voltage, 0.021);
        // (14 * 3300 + 3291 + 3312) / 16 = 3300.1875 mV
        assert_eq!(record.average_cell_voltage, 3.3);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let payload = TelemetryPayload::default()
            .current_centiamps(733)
            .build();
        let limits = CellVoltageLimits::default();
        let first = TelemetryRecord::decode(&payload, &limits).unwrap();
        let second = TelemetryRecord::decode(&payload, &limits).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_wrong_length_or_cell_count_is_rejected() {
        let limits = CellVoltageLimits::default();
        let payload = TelemetryPayload::default().build();

        assert!(matches!(
            TelemetryRecord::decode(&payload[..74], &limits),
            Err(DecodeError::PayloadLength { actual: 74, .. })
        ));
        let mut longer = payload.clone();
        longer.push(0);
        assert!(TelemetryRecord::decode(&longer, &limits).is_err());

        let mut wrong_cells = payload;
        wrong_cells[2] = 15;
        assert!(matches!(
            TelemetryRecord::decode(&wrong_cells, &limits),
            Err(DecodeError::CellCount { actual: 15, .. })
        ));
    }

    #[test]
    fn test_serialized_keys() {
        let payload = TelemetryPayload::default().build();
        let record = TelemetryRecord::decode(&payload, &CellVoltageLimits::default()).unwrap();
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["voltage_cell_1"], 3.3);
        assert_eq!(json["voltage_cell_16"], 3.3);
        assert_eq!(json["cell_temperature_4"], 25.0);
        assert_eq!(json["lowest_cell"], 1);
        assert_eq!(json["cycles"], 42);
        assert!(json.get("voltage_cell_17").is_none());
        assert!(json.get("cell_voltages").is_none());
    }
}
