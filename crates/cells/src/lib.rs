mod cell;
mod codec;
mod key;
mod schema;

pub use cell::{Cell, CellType};
pub use codec::{decode_cells, encode_cells, encoded_cells_len};
pub use key::{cmp_cells, cmp_key_to_bound, BoundSide, KeyBound, KeyRange, OwnedKey};
pub use schema::{test_schema, ColumnDef, TableSchema};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cell payload truncated at offset {0}")]
    Truncated(usize),
    #[error("unknown cell type tag {0}")]
    UnknownTypeTag(u8),
    #[error("invalid utf8 payload in cell")]
    InvalidUtf8,
    #[error("cell type {actual:?} does not match column type {expected:?}")]
    TypeMismatch { expected: CellType, actual: CellType },
}

pub type Result<T> = std::result::Result<T, Error>;
