use super::Cell;
use std::cmp::Ordering;

/// An owned primary-key tuple, ordered by per-column typed comparison.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnedKey(pub Vec<Cell>);

impl OwnedKey {
    pub fn new(cells: Vec<Cell>) -> Self {
        Self(cells)
    }

    pub fn cells(&self) -> &[Cell] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Cell>> for OwnedKey {
    fn from(cells: Vec<Cell>) -> Self {
        Self(cells)
    }
}

/// Typed comparison of two cells of the same column.
/// Null sorts first; cells of different types order by type tag, which only
/// happens for keys that failed schema validation upstream.
pub fn cmp_cells(a: &Cell, b: &Cell) -> Ordering {
    use Cell::*;
    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Bool(x), Bool(y)) => x.cmp(y),
        (Int32(x), Int32(y)) => x.cmp(y),
        (Uint32(x), Uint32(y)) => x.cmp(y),
        (Int64(x), Int64(y)) => x.cmp(y),
        (Uint64(x), Uint64(y)) => x.cmp(y),
        (Utf8(x), Utf8(y)) => x.cmp(y),
        (Bytes(x), Bytes(y)) => x.cmp(y),
        (Timestamp(x), Timestamp(y)) => x.cmp(y),
        _ => {
            let ta = a.cell_type().map(|t| t as u8).unwrap_or(0);
            let tb = b.cell_type().map(|t| t as u8).unwrap_or(0);
            ta.cmp(&tb)
        }
    }
}

impl PartialOrd for OwnedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OwnedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match cmp_cells(a, b) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

/// Which end of a range a bound belongs to. Bounds shorter than the key
/// arity are padded with -inf on the `From` side and +inf on the `To` side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundSide {
    From,
    To,
}

/// One end of a key range: a (possibly short) key prefix plus inclusivity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyBound {
    pub cells: Vec<Cell>,
    pub inclusive: bool,
}

impl KeyBound {
    pub fn inclusive(cells: Vec<Cell>) -> Self {
        Self { cells, inclusive: true }
    }

    pub fn exclusive(cells: Vec<Cell>) -> Self {
        Self { cells, inclusive: false }
    }

    /// An unbounded end: matches -inf as a From bound and +inf as a To bound.
    pub fn unbounded() -> Self {
        Self { cells: Vec::new(), inclusive: true }
    }
}

/// Compares a full key against a range bound, honoring prefix padding.
pub fn cmp_key_to_bound(key: &[Cell], bound: &[Cell], side: BoundSide) -> Ordering {
    for (a, b) in key.iter().zip(bound.iter()) {
        match cmp_cells(a, b) {
            Ordering::Equal => continue,
            non_eq => return non_eq,
        }
    }
    if key.len() >= bound.len() {
        if key.len() == bound.len() {
            Ordering::Equal
        } else {
            // Bound is a strict prefix of the key: the missing bound cells pad
            // to -inf (From) or +inf (To).
            match side {
                BoundSide::From => Ordering::Greater,
                BoundSide::To => Ordering::Less,
            }
        }
    } else {
        match side {
            BoundSide::From => Ordering::Less,
            BoundSide::To => Ordering::Greater,
        }
    }
}

/// A key range with per-end inclusivity flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub from: KeyBound,
    pub to: KeyBound,
}

impl KeyRange {
    pub fn new(from: KeyBound, to: KeyBound) -> Self {
        Self { from, to }
    }

    /// The range covering every key sharing `prefix` in its leading cells.
    /// Equivalent to `[prefix, prefix⁺)` where prefix⁺ increments the last
    /// defined cell: a To bound shorter than the key pads to +inf.
    pub fn from_prefix(prefix: Vec<Cell>) -> Self {
        Self {
            from: KeyBound::inclusive(prefix.clone()),
            to: KeyBound::inclusive(prefix),
        }
    }

    /// The degenerate range holding exactly `key`.
    pub fn from_point(key: OwnedKey) -> Self {
        Self {
            from: KeyBound::inclusive(key.0.clone()),
            to: KeyBound::inclusive(key.0),
        }
    }

    pub fn contains(&self, key: &[Cell]) -> bool {
        let from = cmp_key_to_bound(key, &self.from.cells, BoundSide::From);
        match (from, self.from.inclusive) {
            (Ordering::Less, _) => return false,
            (Ordering::Equal, false) => return false,
            _ => (),
        }
        let to = cmp_key_to_bound(key, &self.to.cells, BoundSide::To);
        match (to, self.to.inclusive) {
            (Ordering::Greater, _) => false,
            (Ordering::Equal, false) => false,
            _ => true,
        }
    }

    /// Whether two ranges share at least one point, assuming well-formed bounds.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        // self.from <= other.to && other.from <= self.to, with inclusivity.
        !bound_after_bound(&self.from, &other.to) && !bound_after_bound(&other.from, &self.to)
    }
}

// True when the From bound `from` lies strictly above the To bound `to`.
fn bound_after_bound(from: &KeyBound, to: &KeyBound) -> bool {
    let min_len = from.cells.len().min(to.cells.len());
    for i in 0..min_len {
        match cmp_cells(&from.cells[i], &to.cells[i]) {
            Ordering::Less => return false,
            Ordering::Greater => return true,
            Ordering::Equal => continue,
        }
    }
    if from.cells.len() > to.cells.len() {
        // `to` pads with +inf.
        return false;
    }
    if from.cells.len() < to.cells.len() {
        // `from` pads with -inf.
        return false;
    }
    // Exactly equal prefixes: empty only if either end excludes the point.
    !(from.inclusive && to.inclusive)
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(cells: &[u32]) -> OwnedKey {
        OwnedKey::new(cells.iter().map(|c| Cell::Uint32(*c)).collect())
    }

    fn cells(values: &[u32]) -> Vec<Cell> {
        values.iter().map(|c| Cell::Uint32(*c)).collect()
    }

    #[test]
    fn key_ordering() {
        assert!(key(&[1, 1, 1]) < key(&[1, 1, 2]));
        assert!(key(&[1, 2]) < key(&[2, 1]));
        assert!(key(&[1]) < key(&[1, 0]));
        assert_eq!(key(&[3, 3, 3]), key(&[3, 3, 3]));

        let mut k = key(&[5, 5, 5]).0;
        k[0] = Cell::Null;
        assert!(OwnedKey::new(k) < key(&[0, 0, 0]));
    }

    #[test]
    fn range_with_inclusive_ends() {
        let range = KeyRange::new(
            KeyBound::inclusive(cells(&[1, 1, 1])),
            KeyBound::inclusive(cells(&[5, 5, 5])),
        );
        assert!(range.contains(&cells(&[1, 1, 1])));
        assert!(range.contains(&cells(&[3, 3, 3])));
        assert!(range.contains(&cells(&[5, 5, 5])));
        assert!(!range.contains(&cells(&[0, 9, 9])));
        assert!(!range.contains(&cells(&[5, 5, 6])));
    }

    #[test]
    fn range_with_exclusive_ends() {
        let range = KeyRange::new(
            KeyBound::exclusive(cells(&[1, 1, 1])),
            KeyBound::exclusive(cells(&[5, 5, 5])),
        );
        assert!(!range.contains(&cells(&[1, 1, 1])));
        assert!(range.contains(&cells(&[1, 1, 2])));
        assert!(range.contains(&cells(&[3, 3, 3])));
        assert!(!range.contains(&cells(&[5, 5, 5])));
    }

    #[test]
    fn short_bounds_pad_to_infinities() {
        // From bound (8) pads with -inf, To bound (8) pads with +inf, so the
        // range [(8), (8)] covers every key with first cell == 8.
        let range = KeyRange::new(
            KeyBound::inclusive(cells(&[8])),
            KeyBound::inclusive(cells(&[8])),
        );
        assert!(range.contains(&cells(&[8, 0, 0])));
        assert!(range.contains(&cells(&[8, 1, 1])));
        assert!(!range.contains(&cells(&[7, 9, 9])));
        assert!(!range.contains(&cells(&[9, 0, 0])));
    }

    #[test]
    fn prefix_range_matches_prefixed_keys() {
        let range = KeyRange::from_prefix(cells(&[8, 1]));
        assert!(range.contains(&cells(&[8, 1, 0])));
        assert!(range.contains(&cells(&[8, 1, 1])));
        assert!(!range.contains(&cells(&[8, 0, 1])));
        assert!(!range.contains(&cells(&[8, 2, 0])));
    }

    #[test]
    fn unbounded_ends() {
        let range = KeyRange::new(KeyBound::unbounded(), KeyBound::inclusive(cells(&[3, 3, 3])));
        assert!(range.contains(&cells(&[0, 0, 0])));
        assert!(range.contains(&cells(&[3, 3, 3])));
        assert!(!range.contains(&cells(&[3, 3, 4])));
    }

    #[test]
    fn range_intersection() {
        let a = KeyRange::new(
            KeyBound::inclusive(cells(&[1, 1, 1])),
            KeyBound::inclusive(cells(&[5, 5, 5])),
        );
        let b = KeyRange::new(
            KeyBound::inclusive(cells(&[5, 5, 5])),
            KeyBound::inclusive(cells(&[9, 9, 9])),
        );
        let c = KeyRange::new(
            KeyBound::exclusive(cells(&[5, 5, 5])),
            KeyBound::inclusive(cells(&[9, 9, 9])),
        );
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));

        let point = KeyRange::from_point(key(&[4, 4, 4]));
        assert!(a.intersects(&point));
        assert!(!b.intersects(&point));
    }
}
