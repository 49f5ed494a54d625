//! Values derived from a decoded telemetry frame.
//!
//! Everything here is a pure function of its inputs so the telemetry decoder
//! and the tests can share them.

/// A cell identified by its 1-based position in the pack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellExtreme {
    pub cell: usize,
    pub voltage: f64,
}

/// Round to a fixed number of decimals (protocol precision of a field).
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

pub fn average_cell_voltage(cells: &[f64]) -> f64 {
    if cells.is_empty() {
        return 0.0;
    }
    round_to(cells.iter().sum::<f64>() / cells.len() as f64, 3)
}

/// First cell holding the minimum voltage.
pub fn lowest_cell(cells: &[f64]) -> CellExtreme {
    extreme(cells, |candidate, current| candidate < current)
}

/// First cell holding the maximum voltage.
pub fn highest_cell(cells: &[f64]) -> CellExtreme {
    extreme(cells, |candidate, current| candidate > current)
}

fn extreme(cells: &[f64], better: impl Fn(f64, f64) -> bool) -> CellExtreme {
    let mut found = CellExtreme {
        cell: 0,
        voltage: 0.0,
    };
    for (index, &voltage) in cells.iter().enumerate() {
        if found.cell == 0 || better(voltage, found.voltage) {
            found = CellExtreme {
                cell: index + 1,
                voltage,
            };
        }
    }
    found
}

pub fn delta_cell_voltage(lowest: CellExtreme, highest: CellExtreme) -> f64 {
    round_to(highest.voltage - lowest.voltage, 3)
}

/// Spread between the warmest and coldest sensor, 0.1 °C precision.
pub fn delta_temperature(temperatures: &[f64]) -> f64 {
    let max = temperatures.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = temperatures.iter().copied().fold(f64::INFINITY, f64::min);
    if temperatures.is_empty() {
        return 0.0;
    }
    round_to(max - min, 1)
}

/// Pack power in watts. Follows the sign of the current: positive while
/// charging, negative while discharging.
pub fn power(voltage: f64, current: f64) -> f64 {
    round_to(voltage * current, 3)
}
