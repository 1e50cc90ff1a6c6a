//! Device queue builder (C3).
//!
//! Pure functions: (substrate grid, active layout, labels, bitmask selection)
//! -> ordered [`PixelDescriptor`] queue. No I/O, no instrument access -
//! everything here is a deterministic function of its inputs, which is what
//! makes the round-trip property in the spec's testable-properties section
//! meaningful.
//!
//! Bit-to-pixel convention, grounded in the reference `cli.py::buildQ`: bits
//! are consumed MSB-first *within* each substrate's byte (mask `0x80` is
//! pixel 1, mask `0x01` is pixel 8 for an 8-pad board), while substrates
//! themselves are ordered so substrate 0 occupies the least-significant byte
//! of the hex bitmask.

use crate::error::DaqError;
use crate::types::PixelDescriptor;

/// A rectangular grid of substrate centers for one experiment kind (solarsim
/// or eqe).
#[derive(Debug, Clone)]
pub struct SubstrateGrid {
    /// Number of substrate rows.
    pub rows: usize,
    /// Number of substrate columns.
    pub cols: usize,
    /// Center-to-center spacing per axis, mm: `[row_spacing, col_spacing]`.
    pub spacing_mm: [f64; 2],
    /// Absolute position of the grid's center, mm: `[row, col]`.
    pub center_mm: [f64; 2],
}

impl SubstrateGrid {
    /// Compute absolute substrate-center coordinates, row-major order.
    ///
    /// Even axis counts are offset half a spacing from the center; odd axis
    /// counts are centered directly on the middle row/column.
    pub fn centers(&self) -> Vec<[f64; 2]> {
        let row_coords = axis_coords(self.rows, self.spacing_mm[0], self.center_mm[0]);
        let col_coords = axis_coords(self.cols, self.spacing_mm[1], self.center_mm[1]);
        let mut out = Vec::with_capacity(self.rows * self.cols);
        for r in &row_coords {
            for c in &col_coords {
                out.push([*r, *c]);
            }
        }
        out
    }
}

fn axis_coords(count: usize, spacing: f64, center: f64) -> Vec<f64> {
    if count == 0 {
        return Vec::new();
    }
    let n = count as f64;
    let start = if count % 2 == 0 {
        center - (n / 2.0 - 0.5) * spacing
    } else {
        center - ((n - 1.0) / 2.0) * spacing
    };
    (0..count).map(|i| start + i as f64 * spacing).collect()
}

/// Per-pixel offsets (from substrate center) and areas for one PCB layout.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Name of this layout, as referenced by config.
    pub pcb_name: String,
    /// 1-based pixel indices present on this layout (length == `positions.len()`).
    pub pixels: Vec<usize>,
    /// Offset from substrate center, mm, one entry per axis, per pixel.
    pub positions: Vec<Vec<f64>>,
    /// Active area, cm^2, per pixel. `-1.0` means "use caller override",
    /// `0.0` means "skip this pixel silently".
    pub areas: Vec<f64>,
    /// Number of contact pads per substrate on this PCB (bitmask bits consumed per substrate).
    pub contact_pads_per_substrate: usize,
}

/// Decode a hex bitmask string into a little-endian (substrate-major) bit
/// vector, one bool per contact pad across every substrate.
///
/// Substrate 0 occupies the least-significant byte; within a byte, bit 7
/// (mask `0x80`) is pad/pixel index 1 and bit 0 (mask `0x01`) is the last pad.
fn decode_bitmask(hex: &str, substrate_count: usize, pads_per_substrate: usize) -> Result<Vec<bool>, DaqError> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    let bytes = hex_to_bytes(hex)?;
    let total_bits = substrate_count * pads_per_substrate;
    let mut bits = vec![false; total_bits];
    let bytes_needed = substrate_count * ((pads_per_substrate + 7) / 8);
    for substrate in 0..substrate_count {
        let byte_index = substrate; // one byte per substrate, matching an 8-pad board
        if byte_index >= bytes.len() {
            continue;
        }
        let byte = bytes[bytes.len() - 1 - byte_index];
        for pad in 0..pads_per_substrate.min(8) {
            let mask = 0x80u8 >> pad;
            bits[substrate * pads_per_substrate + pad] = byte & mask != 0;
        }
    }
    let _ = bytes_needed;
    Ok(bits)
}

fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, DaqError> {
    let hex = if hex.len() % 2 == 1 { format!("0{hex}") } else { hex.to_string() };
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let chars: Vec<char> = hex.chars().collect();
    for pair in chars.chunks(2) {
        let s: String = pair.iter().collect();
        let b = u8::from_str_radix(&s, 16)
            .map_err(|_| DaqError::Config(format!("invalid hex bitmask digit group '{s}'")))?;
        bytes.push(b);
    }
    Ok(bytes)
}

/// Inputs needed to build one experiment's work queue.
pub struct QueueInputs<'a> {
    /// Substrate grid for this experiment kind.
    pub grid: &'a SubstrateGrid,
    /// Active layout.
    pub layout: &'a Layout,
    /// Substrate labels, indexed by row-major substrate order. Length must
    /// equal `grid.rows * grid.cols`.
    pub labels: &'a [String],
    /// Substrate system labels (same indexing as `labels`).
    pub system_labels: &'a [String],
    /// Hex bitmask selection string, e.g. `"0xF0"`.
    pub selection: &'a str,
    /// Per-pixel area override, applied wherever `layout.areas[i] == -1.0`.
    /// `None` means no override was supplied.
    pub area_override_cm2: Option<f64>,
}

/// Build the ordered work queue per §4.3.
pub fn build(inputs: &QueueInputs) -> Result<Vec<PixelDescriptor>, DaqError> {
    let centers = inputs.grid.centers();
    let substrate_count = centers.len();

    if inputs.labels.len() != substrate_count {
        return Err(DaqError::Config(format!(
            "label list length {} does not match substrate count {}",
            inputs.labels.len(),
            substrate_count
        )));
    }
    if inputs.system_labels.len() != substrate_count {
        return Err(DaqError::Config(format!(
            "system label list length {} does not match substrate count {}",
            inputs.system_labels.len(),
            substrate_count
        )));
    }

    let bits = decode_bitmask(inputs.selection, substrate_count, inputs.layout.contact_pads_per_substrate)?;

    let mut queue = Vec::new();
    for (substrate_idx, center) in centers.iter().enumerate() {
        let pad_bits = &bits[substrate_idx * inputs.layout.contact_pads_per_substrate
            ..(substrate_idx + 1) * inputs.layout.contact_pads_per_substrate];
        for (layout_slot, &pixel_index) in inputs.layout.pixels.iter().enumerate() {
            let pad = pixel_index - 1;
            if pad >= pad_bits.len() || !pad_bits[pad] {
                continue;
            }
            let area = inputs.layout.areas[layout_slot];
            let resolved_area = if area == -1.0 {
                inputs.area_override_cm2.unwrap_or(0.0)
            } else {
                area
            };
            if resolved_area == 0.0 {
                continue;
            }
            let offset = &inputs.layout.positions[layout_slot];
            let position: Vec<f64> = center.iter().zip(offset.iter()).map(|(c, o)| c + o).collect();
            queue.push(PixelDescriptor {
                label: format!("{}{}", inputs.labels[substrate_idx], pixel_index),
                system_label: inputs.system_labels[substrate_idx].clone(),
                layout: inputs.layout.pcb_name.clone(),
                pixel_index,
                position,
                area_cm2: resolved_area,
                mux_string: format!("s{}{}", inputs.labels[substrate_idx], pixel_index),
            });
        }
    }
    Ok(queue)
}

/// Build a work queue directly from a pre-resolved device table (§6's
/// `IV_stuff`/`EQE_stuff`), bypassing bitmask decoding and coordinate math
/// entirely - every field in the row is already absolute.
pub fn from_device_table(rows: &[crate::action::DeviceTableRow]) -> Vec<PixelDescriptor> {
    rows.iter()
        .map(|row| PixelDescriptor {
            label: row.label.clone(),
            system_label: row.system_label.clone(),
            layout: row.layout.clone(),
            pixel_index: row.mux_index,
            position: row.loc.clone(),
            area_cm2: row.area,
            mux_string: row.mux_string.clone(),
        })
        .collect()
}

/// Build the synthetic single-entry queue used when a calibration action is
/// requested with an empty selection bitmask (external reference diode).
pub fn external_reference_queue() -> Vec<PixelDescriptor> {
    vec![PixelDescriptor {
        label: "external".to_string(),
        system_label: "external".to_string(),
        layout: "external".to_string(),
        pixel_index: 1,
        position: Vec::new(),
        area_cm2: 1.0,
        mux_string: "s".to_string(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s1_inputs() -> (SubstrateGrid, Layout, Vec<String>, Vec<String>) {
        let grid = SubstrateGrid { rows: 2, cols: 1, spacing_mm: [30.0, 30.0], center_mm: [0.0, 0.0] };
        let layout = Layout {
            pcb_name: "4pixel".to_string(),
            pixels: vec![1, 2, 3, 4],
            positions: vec![
                vec![-5.0, 0.0],
                vec![5.0, 0.0],
                vec![-5.0, 10.0],
                vec![5.0, 10.0],
            ],
            areas: vec![0.1, 0.1, 0.1, 0.1],
            contact_pads_per_substrate: 4,
        };
        let labels = vec!["A".to_string(), "B".to_string()];
        let system_labels = labels.clone();
        (grid, layout, labels, system_labels)
    }

    #[test]
    fn substrate_centers_even_row_count_straddles_center() {
        let grid = SubstrateGrid { rows: 2, cols: 1, spacing_mm: [30.0, 30.0], center_mm: [0.0, 0.0] };
        let centers = grid.centers();
        assert_eq!(centers, vec![[-15.0, 0.0], [15.0, 0.0]]);
    }

    #[test]
    fn substrate_centers_odd_count_centers_on_middle() {
        let grid = SubstrateGrid { rows: 3, cols: 1, spacing_mm: [10.0, 10.0], center_mm: [0.0, 0.0] };
        let centers = grid.centers();
        assert_eq!(centers, vec![[-10.0, 0.0], [0.0, 0.0], [10.0, 0.0]]);
    }

    /// Scenario S1 from the spec's concrete test table.
    #[test]
    fn s1_bitmask_to_queue() {
        let (grid, layout, labels, system_labels) = s1_inputs();
        let inputs = QueueInputs {
            grid: &grid,
            layout: &layout,
            labels: &labels,
            system_labels: &system_labels,
            selection: "0xF0",
            area_override_cm2: None,
        };
        let queue = build(&inputs).unwrap();
        assert_eq!(queue.len(), 4);
        let positions: Vec<Vec<f64>> = queue.iter().map(|p| p.position.clone()).collect();
        assert_eq!(
            positions,
            vec![
                vec![-20.0, 0.0],
                vec![-10.0, 0.0],
                vec![-20.0, 10.0],
                vec![-10.0, 10.0],
            ]
        );
        assert!(queue.iter().all(|p| p.system_label == "A"));
    }

    #[test]
    fn zero_area_pixel_is_skipped_not_errored() {
        let (grid, mut layout, labels, system_labels) = s1_inputs();
        layout.areas[0] = 0.0;
        let inputs = QueueInputs {
            grid: &grid,
            layout: &layout,
            labels: &labels,
            system_labels: &system_labels,
            selection: "0xF0",
            area_override_cm2: None,
        };
        let queue = build(&inputs).unwrap();
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn area_override_applies_only_to_negative_one_sentinel() {
        let (grid, mut layout, labels, system_labels) = s1_inputs();
        layout.areas[0] = -1.0;
        let inputs = QueueInputs {
            grid: &grid,
            layout: &layout,
            labels: &labels,
            system_labels: &system_labels,
            selection: "0xF0",
            area_override_cm2: Some(0.25),
        };
        let queue = build(&inputs).unwrap();
        assert_eq!(queue[0].area_cm2, 0.25);
        assert_eq!(queue[1].area_cm2, 0.1);
    }

    #[test]
    fn label_count_mismatch_is_config_error() {
        let (grid, layout, _labels, system_labels) = s1_inputs();
        let labels = vec!["A".to_string()];
        let inputs = QueueInputs {
            grid: &grid,
            layout: &layout,
            labels: &labels,
            system_labels: &system_labels,
            selection: "0xF0",
            area_override_cm2: None,
        };
        assert!(matches!(build(&inputs), Err(DaqError::Config(_))));
    }

    #[test]
    fn external_reference_queue_has_one_synthetic_entry() {
        let q = external_reference_queue();
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].label, "external");
    }

    #[test]
    fn from_device_table_passes_fields_through_unchanged() {
        use crate::action::DeviceTableRow;
        let rows = vec![DeviceTableRow {
            label: "A1".to_string(),
            system_label: "A".to_string(),
            layout: "4pixel".to_string(),
            mux_index: 1,
            loc: vec![-20.0, 0.0],
            area: 0.1,
            mux_string: "sA1".to_string(),
        }];
        let queue = from_device_table(&rows);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].label, "A1");
        assert_eq!(queue[0].position, vec![-20.0, 0.0]);
        assert_eq!(queue[0].area_cm2, 0.1);
    }
}
