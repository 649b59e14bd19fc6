//! Monitor: renders mirrored device state as one text line per device.

use trackrelay_core::{DeviceDescriptor, DeviceState, DeviceStateTable, TrackingType};

/// Which devices the monitor prints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Only devices whose name contains this text; `None` prints all.
    pub name_contains: Option<String>,
}

impl DeviceFilter {
    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        self.name_contains
            .as_deref()
            .map_or(true, |needle| descriptor.name.contains(needle))
    }
}

/// One line describing `state`.
///
/// ```text
/// [0] up/wand      pos=( 1.000,  2.000,  3.000) buttons=01 ts=1000
/// [1] up/tracker1  invalid ts=1000
/// ```
pub fn format_device(index: usize, descriptor: &DeviceDescriptor, state: &DeviceState) -> String {
    let mut line = format!("[{index}] {:<12}", descriptor.name);
    if !state.valid {
        line.push_str(&format!(" invalid ts={}", state.time_stamp));
        return line;
    }

    let p = state.pose.position;
    let q = state.pose.orientation;
    match descriptor.tracking {
        TrackingType::None => {}
        TrackingType::Position => {
            line.push_str(&format!(" pos=({:>6.3}, {:>6.3}, {:>6.3})", p.x, p.y, p.z));
        }
        TrackingType::PositionOrientation => {
            line.push_str(&format!(
                " pos=({:>6.3}, {:>6.3}, {:>6.3}) rot=({:>6.3}, {:>6.3}, {:>6.3}, {:>6.3})",
                p.x, p.y, p.z, q.x, q.y, q.z, q.w
            ));
        }
    }
    if !state.buttons.is_empty() {
        let bits: String = state.buttons.iter().map(|&b| if b { '1' } else { '0' }).collect();
        line.push_str(&format!(" buttons={bits}"));
    }
    if !state.valuators.is_empty() {
        let values: Vec<String> = state.valuators.iter().map(|v| format!("{v:.2}")).collect();
        line.push_str(&format!(" valuators=[{}]", values.join(", ")));
    }
    if state.late {
        line.push_str(" late");
    }
    line.push_str(&format!(" ts={}", state.time_stamp));
    line
}

/// Lines for the devices in `indices` (or every device if `None`) that pass `filter`.
pub fn format_devices(
    table: &DeviceStateTable,
    indices: Option<&[usize]>,
    filter: &DeviceFilter,
) -> Vec<String> {
    let states = table.snapshot();
    let descriptors = table.descriptors();
    let all: Vec<usize> = (0..descriptors.len()).collect();
    indices
        .unwrap_or(&all)
        .iter()
        .filter_map(|&i| Some((i, descriptors.get(i)?, states.get(i)?)))
        .filter(|(_, descriptor, _)| filter.matches(descriptor))
        .map(|(i, descriptor, state)| format_device(i, descriptor, state))
        .collect()
}
