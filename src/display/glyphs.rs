//! Tiny 3x5 block font for tag ids.

/// Rows of a glyph, top to bottom; bit 2 is the left column.
type Glyph = [u8; 5];

const ROWS: usize = 5;
const COLS: usize = 3;

fn glyph(c: char) -> Option<Glyph> {
    Some(match c {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b011, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b010, 0b010, 0b010],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        ' ' => [0; ROWS],
        _ => return None,
    })
}

/// A filled square cell of a laid-out string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub x: f32,
    pub y: f32,
    pub size: f32,
}

/// Width and height of `text` at glyph height `height`.
pub fn extent(text: &str, height: f32) -> (f32, f32) {
    let cell = height / ROWS as f32;
    let chars = text.chars().count();
    if chars == 0 {
        return (0.0, height);
    }
    // One blank column between glyphs.
    let columns = chars * COLS + (chars - 1);
    (columns as f32 * cell, height)
}

/// Lay out `text` centered on `(cx, cy)`.
///
/// Returns `None` if the text contains a character without a glyph.
pub fn layout(text: &str, cx: f32, cy: f32, height: f32) -> Option<Vec<Cell>> {
    let cell = height / ROWS as f32;
    let (width, _) = extent(text, height);
    let left = cx - width / 2.0;
    let top = cy - height / 2.0;

    let mut cells = Vec::new();
    for (index, c) in text.chars().enumerate() {
        let rows = glyph(c)?;
        let glyph_left = left + (index * (COLS + 1)) as f32 * cell;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..COLS {
                if bits & (1 << (COLS - 1 - col)) != 0 {
                    cells.push(Cell {
                        x: glyph_left + col as f32 * cell,
                        y: top + row as f32 * cell,
                        size: cell,
                    });
                }
            }
        }
    }
    Some(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_of_two_digits() {
        // 3 + 1 + 3 columns of 20 px.
        assert_eq!(extent("42", 100.0), (140.0, 100.0));
        assert_eq!(extent("", 100.0), (0.0, 100.0));
    }

    #[test]
    fn test_layout_is_centered() {
        let cells = layout("8", 50.0, 50.0, 50.0).unwrap();
        // "8" lights 13 of its 15 cells.
        assert_eq!(cells.len(), 13);
        let min_x = cells.iter().map(|c| c.x).fold(f32::INFINITY, f32::min);
        let max_x = cells.iter().map(|c| c.x + c.size).fold(f32::NEG_INFINITY, f32::max);
        assert_eq!((min_x + max_x) / 2.0, 50.0);
        assert_eq!(cells[0].y, 25.0);
    }

    #[test]
    fn test_negative_ids_and_unknown_chars() {
        assert!(layout("-17", 0.0, 0.0, 10.0).is_some());
        assert!(layout("x", 0.0, 0.0, 10.0).is_none());
    }
}
