//! Greedy nearest-neighbour ordering of the unique track points.
//!
//! Both engines walk the same tour: the remaining point nearest (by
//! [`SpatialPoint::sqr_dist`]) to the current one is taken next, the earliest
//! remaining point wins ties, and a current point whose nearest successor is
//! farther than the threshold is excluded as an outlier.

use std::collections::HashMap;

use crate::point::SpatialPoint;
use crate::SequencingEngine;

#[derive(Clone, Debug, Default)]
pub(crate) struct Sequenced {
    pub sorted: Vec<SpatialPoint>,
    pub excluded: Vec<SpatialPoint>,
}

trait Remaining {
    /// Remove the point nearest to `from` and return it with its distance.
    fn pop_nearest(&mut self, from: &SpatialPoint) -> Option<(SpatialPoint, f64)>;
}

pub(crate) fn sequence(
    mut points: Vec<SpatialPoint>,
    threshold: f64,
    engine: SequencingEngine,
) -> Sequenced {
    if points.is_empty() {
        return Sequenced::default();
    }
    // Any point works as a start; the loop's origin and direction stay arbitrary.
    let first = points.remove(0);
    match engine {
        SequencingEngine::Exhaustive => greedy_tour(first, ScanRemaining { points }, threshold),
        SequencingEngine::Grid => {
            greedy_tour(first, GridRemaining::new(points, threshold), threshold)
        }
    }
}

fn greedy_tour<R: Remaining>(first: SpatialPoint, mut remaining: R, threshold: f64) -> Sequenced {
    let mut out = Sequenced::default();
    let mut current = first;
    while let Some((next, dist)) = remaining.pop_nearest(&current) {
        if dist > threshold {
            out.excluded.push(current);
        } else {
            out.sorted.push(current);
        }
        current = next;
    }
    match out.sorted.last() {
        Some(last) if current.sqr_dist(last) <= threshold => out.sorted.push(current),
        _ => out.excluded.push(current),
    }
    out
}

struct ScanRemaining {
    points: Vec<SpatialPoint>,
}

impl Remaining for ScanRemaining {
    fn pop_nearest(&mut self, from: &SpatialPoint) -> Option<(SpatialPoint, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (i, p) in self.points.iter().enumerate() {
            let d = from.sqr_dist(p);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((i, d));
            }
        }
        let (index, dist) = best?;
        Some((self.points.remove(index), dist))
    }
}

type CellKey = (i64, i64);

/// Remaining points bucketed into square cells of `cell` units.
///
/// Ring `r` around the query cell holds points whose coordinate offset exceeds
/// `(r - 1) * cell`, which bounds their distance from below and lets the
/// search stop early without changing which point wins.
struct GridRemaining {
    cell: f64,
    points: Vec<SpatialPoint>,
    cells: HashMap<CellKey, Vec<usize>>,
    remaining: usize,
    min_cell: CellKey,
    max_cell: CellKey,
}

impl GridRemaining {
    fn new(points: Vec<SpatialPoint>, cell: f64) -> Self {
        let mut grid = Self {
            cell,
            points: Vec::new(),
            cells: HashMap::new(),
            remaining: points.len(),
            min_cell: (i64::MAX, i64::MAX),
            max_cell: (i64::MIN, i64::MIN),
        };
        for (i, p) in points.iter().enumerate() {
            let key = grid.key(p);
            grid.min_cell = (grid.min_cell.0.min(key.0), grid.min_cell.1.min(key.1));
            grid.max_cell = (grid.max_cell.0.max(key.0), grid.max_cell.1.max(key.1));
            grid.cells.entry(key).or_default().push(i);
        }
        grid.points = points;
        grid
    }

    fn key(&self, p: &SpatialPoint) -> CellKey {
        (
            (p.x / self.cell).floor() as i64,
            (p.y / self.cell).floor() as i64,
        )
    }

    fn consider(&self, from: &SpatialPoint, key: CellKey, best: &mut Option<(f64, usize, CellKey)>) {
        let Some(indices) = self.cells.get(&key) else {
            return;
        };
        for &i in indices {
            let d = from.sqr_dist(&self.points[i]);
            let better = match best {
                Some((bd, bi, _)) => d < *bd || (d == *bd && i < *bi),
                None => true,
            };
            if better {
                *best = Some((d, i, key));
            }
        }
    }

    fn ring_keys(center: CellKey, r: i64) -> Vec<CellKey> {
        if r == 0 {
            return vec![center];
        }
        let (cx, cy) = center;
        let mut keys = Vec::with_capacity((8 * r) as usize);
        for x in (cx - r)..=(cx + r) {
            keys.push((x, cy - r));
            keys.push((x, cy + r));
        }
        for y in (cy - r + 1)..=(cy + r - 1) {
            keys.push((cx - r, y));
            keys.push((cx + r, y));
        }
        keys
    }
}

impl Remaining for GridRemaining {
    fn pop_nearest(&mut self, from: &SpatialPoint) -> Option<(SpatialPoint, f64)> {
        if self.remaining == 0 {
            return None;
        }
        let center = self.key(from);
        let max_ring = [
            (center.0 - self.min_cell.0).abs(),
            (self.max_cell.0 - center.0).abs(),
            (center.1 - self.min_cell.1).abs(),
            (self.max_cell.1 - center.1).abs(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0);

        let mut best: Option<(f64, usize, CellKey)> = None;
        for r in 0..=max_ring {
            if 8 * r as usize > self.cells.len() {
                // Sparse leftovers: scanning the occupied cells is cheaper than the ring.
                let keys: Vec<CellKey> = self.cells.keys().copied().collect();
                for key in keys {
                    self.consider(from, key, &mut best);
                }
                break;
            }
            for key in Self::ring_keys(center, r) {
                self.consider(from, key, &mut best);
            }
            if let Some((bd, _, _)) = best {
                if r >= 1 && bd <= (r - 1) as f64 * self.cell {
                    break;
                }
            }
        }

        let (dist, index, key) = best?;
        if let Some(indices) = self.cells.get_mut(&key) {
            if let Ok(pos) = indices.binary_search(&index) {
                indices.remove(pos);
            }
            if indices.is_empty() {
                self.cells.remove(&key);
            }
        }
        self.remaining -= 1;
        Some((self.points[index], dist))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pts(coords: &[(f64, f64)]) -> Vec<SpatialPoint> {
        coords.iter().map(|&(x, y)| SpatialPoint::new(x, y)).collect()
    }

    #[test]
    fn test_square_is_walked_in_order() {
        for engine in [SequencingEngine::Exhaustive, SequencingEngine::Grid] {
            let out = sequence(
                pts(&[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]),
                200.0,
                engine,
            );
            let order: Vec<(f64, f64)> = out.sorted.iter().map(|p| (p.x, p.y)).collect();
            assert_eq!(order, vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]);
            assert!(out.excluded.is_empty());
        }
    }

    #[test]
    fn test_ties_go_to_earliest_remaining_point() {
        for engine in [SequencingEngine::Exhaustive, SequencingEngine::Grid] {
            // (0, 10) and (10, 0) are equally far from the start.
            let out = sequence(
                pts(&[(0.0, 0.0), (0.0, 10.0), (10.0, 0.0), (20.0, 0.0)]),
                200.0,
                engine,
            );
            assert_eq!(out.sorted[1].y, 10.0);
            assert_eq!(out.sorted[2].x, 10.0);
        }
    }

    #[test]
    fn test_isolated_point_is_excluded() {
        for engine in [SequencingEngine::Exhaustive, SequencingEngine::Grid] {
            let out = sequence(
                pts(&[(5000.0, 5000.0), (0.0, 0.0), (50.0, 0.0), (100.0, 0.0)]),
                200.0,
                engine,
            );
            assert_eq!(out.sorted.len(), 3);
            assert_eq!(out.excluded.len(), 1);
            assert_eq!(out.excluded[0].x, 5000.0);
        }
    }

    #[test]
    fn test_unclosed_last_point_is_excluded() {
        let out = sequence(
            pts(&[(0.0, 0.0), (100.0, 0.0), (900.0, 0.0)]),
            200.0,
            SequencingEngine::Exhaustive,
        );
        assert_eq!(out.sorted.len(), 1);
        assert_eq!(out.excluded.len(), 2);
    }

    #[test]
    fn test_empty_input() {
        let out = sequence(Vec::new(), 200.0, SequencingEngine::Grid);
        assert!(out.sorted.is_empty());
        assert!(out.excluded.is_empty());
    }

    proptest! {
        #[test]
        fn test_engines_agree(coords in prop::collection::vec((0i32..2000, 0i32..2000), 2..250)) {
            let mut seen = std::collections::HashSet::new();
            let points: Vec<SpatialPoint> = coords
                .into_iter()
                .filter(|c| seen.insert(*c))
                .map(|(x, y)| SpatialPoint::new(x as f64, y as f64))
                .collect();
            let scan = sequence(points.clone(), 200.0, SequencingEngine::Exhaustive);
            let grid = sequence(points, 200.0, SequencingEngine::Grid);
            prop_assert_eq!(scan.sorted, grid.sorted);
            prop_assert_eq!(scan.excluded, grid.excluded);
        }
    }
}
