pub const DEFAULT_ASPECT_RATIO: f64 = 16.0 / 9.0;

/// Which sides of the container carry the unused margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Letterbox {
    /// Margins left and right: the container is wider than the grid, so video
    /// fills the full height and overlay chrome auto-hides.
    Vertical,
    /// Margins top and bottom: chrome stays pinned in the spare space.
    Horizontal,
}

impl Letterbox {
    #[must_use]
    pub const fn hides_chrome(self) -> bool {
        matches!(self, Self::Vertical)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Layout units per terminal row. A terminal cell is about twice as tall as
/// it is wide, so one column is one unit and one row is two.
pub const TERMINAL_ROW_UNITS: u32 = 2;

/// Container size in layout units for a terminal area of `columns` x `rows`.
#[must_use]
pub fn terminal_units(columns: u16, rows: u16) -> (u32, u32) {
    (u32::from(columns), u32::from(rows) * TERMINAL_ROW_UNITS)
}

impl CellRect {
    /// Converts a rect laid out in [`terminal_units`] back to columns and rows.
    #[must_use]
    pub const fn to_terminal(self) -> Self {
        Self {
            x: self.x,
            y: self.y / TERMINAL_ROW_UNITS,
            width: self.width,
            height: self.height / TERMINAL_ROW_UNITS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridLayout {
    pub columns: usize,
    pub rows: usize,
    pub cell_width: u32,
    pub cell_height: u32,
    pub letterbox: Letterbox,
    pub cells: Vec<CellRect>,
}

impl GridLayout {
    fn empty() -> Self {
        Self {
            columns: 0,
            rows: 0,
            cell_width: 0,
            cell_height: 0,
            letterbox: Letterbox::Horizontal,
            cells: Vec::new(),
        }
    }
}

/// Computes row-major cell placement for `cell_count` viewports of
/// `aspect_ratio` inside a `container_width` x `container_height` box.
///
/// Portrait containers are biased toward a single column (up to five cells).
/// A partially filled last row is centered horizontally.
#[must_use]
pub fn compute_layout(
    container_width: u32,
    container_height: u32,
    cell_count: usize,
    aspect_ratio: f64,
) -> GridLayout {
    if cell_count == 0 || container_width == 0 || container_height == 0 {
        return GridLayout::empty();
    }
    let aspect = if aspect_ratio.is_finite() && aspect_ratio > 0.0 {
        aspect_ratio
    } else {
        DEFAULT_ASPECT_RATIO
    };

    let (columns, rows) = grid_dimensions(container_width, container_height, cell_count);

    let container_ratio = f64::from(container_width) / f64::from(container_height);
    let grid_ratio = aspect * columns as f64 / rows as f64;
    let (cell_width, cell_height, letterbox) = if container_ratio > grid_ratio {
        let cell_height = container_height / rows as u32;
        let cell_width = (f64::from(cell_height) * aspect).round() as u32;
        (cell_width, cell_height, Letterbox::Vertical)
    } else {
        let cell_width = container_width / columns as u32;
        let cell_height = (f64::from(cell_width) / aspect).round() as u32;
        (cell_width, cell_height, Letterbox::Horizontal)
    };

    let last_row_start = (rows - 1) * columns;
    let last_row_len = cell_count - last_row_start;
    let last_row_margin = if last_row_len < columns {
        cell_width * (columns - last_row_len) as u32 / 2
    } else {
        0
    };

    let cells = (0..cell_count)
        .map(|idx| {
            let row = idx / columns;
            let col = idx % columns;
            let margin = if idx >= last_row_start {
                last_row_margin
            } else {
                0
            };
            CellRect {
                x: margin + col as u32 * cell_width,
                y: row as u32 * cell_height,
                width: cell_width,
                height: cell_height,
            }
        })
        .collect();

    GridLayout {
        columns,
        rows,
        cell_width,
        cell_height,
        letterbox,
        cells,
    }
}

fn grid_dimensions(container_width: u32, container_height: u32, cell_count: usize) -> (usize, usize) {
    let count = cell_count as i64;
    let cell_qty = if container_height > container_width {
        // One column for up to five cells.
        (count - 5 / count).max(4) as f64 / 4.0
    } else {
        count as f64
    };
    let columns = (cell_qty.sqrt().ceil() as usize).max(1);
    let rows = cell_count.div_ceil(columns);
    (columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn landscape_four_cells_is_two_by_two() {
        let layout = compute_layout(1920, 1080, 4, DEFAULT_ASPECT_RATIO);
        assert_eq!((layout.columns, layout.rows), (2, 2));
        assert_eq!((layout.cell_width, layout.cell_height), (960, 540));
        assert_eq!(layout.cells[3], CellRect { x: 960, y: 540, width: 960, height: 540 });
    }

    #[test]
    fn portrait_prefers_single_column() {
        let layout = compute_layout(1080, 1920, 3, DEFAULT_ASPECT_RATIO);
        assert_eq!((layout.columns, layout.rows), (1, 3));
        assert_eq!(layout.letterbox, Letterbox::Horizontal);
        assert_eq!(layout.cell_width, 1080);
        assert_eq!(layout.cells[2].y, 2 * layout.cell_height);

        let six = compute_layout(1080, 1920, 6, DEFAULT_ASPECT_RATIO);
        assert_eq!((six.columns, six.rows), (2, 3));
    }

    #[test]
    fn partial_last_row_is_centered() {
        let layout = compute_layout(1920, 1080, 3, DEFAULT_ASPECT_RATIO);
        assert_eq!((layout.columns, layout.rows), (2, 2));
        let last = layout.cells[2];
        assert_eq!(last.x, layout.cell_width / 2);
        assert_eq!(last.y, layout.cell_height);
        assert_eq!(layout.cells[1].x, layout.cell_width);

        let seven = compute_layout(3000, 1000, 7, DEFAULT_ASPECT_RATIO);
        assert_eq!((seven.columns, seven.rows), (3, 3));
        assert_eq!(seven.cells[6].x, seven.cell_width);
    }

    #[test]
    fn wide_container_letterboxes_vertically() {
        let wide = compute_layout(3000, 1000, 1, DEFAULT_ASPECT_RATIO);
        assert_eq!(wide.letterbox, Letterbox::Vertical);
        assert!(wide.letterbox.hides_chrome());
        assert_eq!(wide.cell_height, 1000);
        assert_eq!(wide.cell_width, 1778);

        let tall = compute_layout(1000, 1000, 1, DEFAULT_ASPECT_RATIO);
        assert_eq!(tall.letterbox, Letterbox::Horizontal);
        assert!(!tall.letterbox.hides_chrome());
        assert_eq!(tall.cell_width, 1000);
    }

    #[test]
    fn degenerate_inputs_yield_empty_layout() {
        assert!(compute_layout(1920, 1080, 0, DEFAULT_ASPECT_RATIO).cells.is_empty());
        assert!(compute_layout(0, 1080, 3, DEFAULT_ASPECT_RATIO).cells.is_empty());
        let fallback = compute_layout(1920, 1080, 1, f64::NAN);
        assert_eq!(fallback.cell_height, 1080);
    }

    #[test]
    fn terminal_rows_count_double() {
        assert_eq!(terminal_units(160, 45), (160, 90));
        let layout = compute_layout(160, 90, 1, DEFAULT_ASPECT_RATIO);
        let cell = layout.cells[0].to_terminal();
        assert_eq!((cell.width, cell.height), (160, 45));
    }

    proptest! {
        #[test]
        fn grid_has_no_spare_row_or_column(
            count in 1usize..=16,
            width in 100u32..4000,
            height in 100u32..4000,
        ) {
            let layout = compute_layout(width, height, count, DEFAULT_ASPECT_RATIO);
            let (cols, rows) = (layout.columns, layout.rows);
            prop_assert!(cols * rows >= count);
            prop_assert!((cols - 1) * rows < count);
            prop_assert!(cols * (rows - 1) < count);
            prop_assert_eq!(layout.cells.len(), count);
        }

        #[test]
        fn cells_fit_inside_container(count in 1usize..=16, width in 200u32..4000, height in 200u32..4000) {
            let layout = compute_layout(width, height, count, DEFAULT_ASPECT_RATIO);
            for cell in &layout.cells {
                prop_assert!(cell.x + cell.width <= width + layout.columns as u32);
                prop_assert!(cell.y + cell.height <= height + layout.rows as u32);
            }
        }
    }
}
