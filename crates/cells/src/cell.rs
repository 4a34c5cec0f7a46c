use bytes::Bytes;

/// Column value types supported by the shard storage layer.
/// The numeric discriminant is the wire tag of the cellvec codec.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(u8)]
pub enum CellType {
    Bool = 1,
    Int32 = 2,
    Uint32 = 3,
    Int64 = 4,
    Uint64 = 5,
    Utf8 = 6,
    Bytes = 7,
    /// Microseconds since the unix epoch.
    Timestamp = 8,
}

impl CellType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Bool),
            2 => Some(Self::Int32),
            3 => Some(Self::Uint32),
            4 => Some(Self::Int64),
            5 => Some(Self::Uint64),
            6 => Some(Self::Utf8),
            7 => Some(Self::Bytes),
            8 => Some(Self::Timestamp),
            _ => None,
        }
    }
}

/// A single typed column value. `Null` is a valid value for any column type,
/// and sorts before every non-null value of the column.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Cell {
    Null,
    Bool(bool),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Utf8(String),
    Bytes(Bytes),
    Timestamp(u64),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// The type of a non-null cell; None for `Null`, which is typed by its column.
    pub fn cell_type(&self) -> Option<CellType> {
        match self {
            Cell::Null => None,
            Cell::Bool(_) => Some(CellType::Bool),
            Cell::Int32(_) => Some(CellType::Int32),
            Cell::Uint32(_) => Some(CellType::Uint32),
            Cell::Int64(_) => Some(CellType::Int64),
            Cell::Uint64(_) => Some(CellType::Uint64),
            Cell::Utf8(_) => Some(CellType::Utf8),
            Cell::Bytes(_) => Some(CellType::Bytes),
            Cell::Timestamp(_) => Some(CellType::Timestamp),
        }
    }

    /// Matches a cell against a column type. Null matches everything.
    pub fn matches(&self, column_type: CellType) -> bool {
        self.cell_type().map_or(true, |t| t == column_type)
    }

    /// Size of the value payload, used for quota accounting.
    pub fn payload_len(&self) -> usize {
        match self {
            Cell::Null => 0,
            Cell::Bool(_) => 1,
            Cell::Int32(_) | Cell::Uint32(_) => 4,
            Cell::Int64(_) | Cell::Uint64(_) | Cell::Timestamp(_) => 8,
            Cell::Utf8(s) => s.len(),
            Cell::Bytes(b) => b.len(),
        }
    }
}

impl From<u32> for Cell {
    fn from(value: u32) -> Self {
        Cell::Uint32(value)
    }
}

impl From<u64> for Cell {
    fn from(value: u64) -> Self {
        Cell::Uint64(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Utf8(value.to_string())
    }
}
