//! The (x, y) <-> (i, j) mapping a [`super::HashGrid2D`] needs from its
//! caller. Geometry itself (points, cell sizing, bounds) is an external
//! collaborator out of scope for this crate; `GridTraits` is the seam a
//! caller's own grid-geometry type plugs into.

/// Supplies cell-index arithmetic and containment checks to a grid.
///
/// Grounded in `geometrix::grid_traits`, referenced by
/// `concurrent_hash_grid_2d` but never implemented by the original itself
/// (`geometrix` supplies it) — this crate only needs the seam.
pub trait GridTraits {
  /// Maps an x-coordinate to its cell column index.
  fn x_index(&self, x: f64) -> u32;

  /// Maps a y-coordinate to its cell row index.
  fn y_index(&self, y: f64) -> u32;

  /// Whether `(x, y)` falls within the grid's bounds.
  fn is_contained(&self, x: f64, y: f64) -> bool;
}

/// A regular grid over an axis-aligned bounding box, the common case for
/// [`GridTraits`] and a convenient default for tests.
pub struct RegularGridTraits {
  /// Lower bound on the x-axis.
  pub min_x: f64,
  /// Lower bound on the y-axis.
  pub min_y: f64,
  /// Upper bound on the x-axis.
  pub max_x: f64,
  /// Upper bound on the y-axis.
  pub max_y: f64,
  /// Cell width/height.
  pub cell_size: f64,
}

impl GridTraits for RegularGridTraits {
  fn x_index(&self, x: f64) -> u32 {
    (((x - self.min_x) / self.cell_size).floor()) as u32
  }

  fn y_index(&self, y: f64) -> u32 {
    (((y - self.min_y) / self.cell_size).floor()) as u32
  }

  fn is_contained(&self, x: f64, y: f64) -> bool {
    (self.min_x..=self.max_x).contains(&x) && (self.min_y..=self.max_y).contains(&y)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn indexes_by_cell_size() {
    let traits = RegularGridTraits {
      min_x: 0.0,
      min_y: 0.0,
      max_x: 100.0,
      max_y: 100.0,
      cell_size: 10.0,
    };
    assert_eq!(traits.x_index(25.0), 2);
    assert_eq!(traits.y_index(95.0), 9);
    assert!(traits.is_contained(50.0, 50.0));
    assert!(!traits.is_contained(150.0, 50.0));
  }
}
