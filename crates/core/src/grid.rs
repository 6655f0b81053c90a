//! Flat time-frequency matrix.

/// A `columns × rows` matrix of `f32` stored in one buffer.
///
/// A column is one time step (an STFT frame or a downsampled level column)
/// and holds `rows` frequency cells contiguously, lowest frequency first.
/// Cell `(column, row)` lives at `column * rows + row`.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    columns: usize,
    rows: usize,
    data: Vec<f32>,
}

impl Grid {
    pub fn new(columns: usize, rows: usize, fill: f32) -> Self {
        Self {
            columns,
            rows,
            data: vec![fill; columns * rows],
        }
    }

    /// Wrap an existing buffer. Returns `None` when the length does not match.
    pub fn from_vec(columns: usize, rows: usize, data: Vec<f32>) -> Option<Self> {
        if data.len() != columns * rows {
            return None;
        }
        Some(Self { columns, rows, data })
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Distance between the starts of two consecutive columns.
    pub fn stride(&self) -> usize {
        self.rows
    }

    pub fn get(&self, column: usize, row: usize) -> f32 {
        self.data[column * self.rows + row]
    }

    pub fn set(&mut self, column: usize, row: usize, value: f32) {
        self.data[column * self.rows + row] = value;
    }

    pub fn column(&self, column: usize) -> &[f32] {
        let start = column * self.rows;
        &self.data[start..start + self.rows]
    }

    pub fn column_mut(&mut self, column: usize) -> &mut [f32] {
        let start = column * self.rows;
        &mut self.data[start..start + self.rows]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexing_is_column_major() {
        let mut grid = Grid::new(3, 2, 0.0);
        grid.set(1, 0, 5.0);
        grid.set(2, 1, 7.0);
        assert_eq!(grid.as_slice(), &[0.0, 0.0, 5.0, 0.0, 0.0, 7.0]);
        assert_eq!(grid.column(2), &[0.0, 7.0]);
        assert_eq!(grid.stride(), 2);
    }

    #[test]
    fn test_from_vec_checks_length() {
        assert!(Grid::from_vec(2, 2, vec![0.0; 3]).is_none());
        let grid = Grid::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(grid.get(1, 0), 3.0);
    }

    #[test]
    fn test_column_mut() {
        let mut grid = Grid::new(2, 3, 1.0);
        grid.column_mut(0).iter_mut().for_each(|v| *v = -1.0);
        assert_eq!(grid.into_vec(), vec![-1.0, -1.0, -1.0, 1.0, 1.0, 1.0]);
    }
}
