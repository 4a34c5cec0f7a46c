use crate::Error;
use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Int32Builder, Int64Builder, StringBuilder,
    TimestampMicrosecondBuilder, UInt32Builder, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use cells::{encode_cells, Cell, CellType, ColumnDef};
use std::sync::Arc;

/// Encodes projected rows as one cellvec buffer per row.
pub fn build_cellvec(rows: &[Vec<Cell>]) -> Vec<Vec<u8>> {
    rows.iter().map(|row| encode_cells(row)).collect()
}

fn arrow_type(column_type: CellType) -> DataType {
    match column_type {
        CellType::Bool => DataType::Boolean,
        CellType::Int32 => DataType::Int32,
        CellType::Uint32 => DataType::UInt32,
        CellType::Int64 => DataType::Int64,
        CellType::Uint64 => DataType::UInt64,
        CellType::Utf8 => DataType::Utf8,
        CellType::Bytes => DataType::Binary,
        CellType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
    }
}

/// Encodes projected rows as a single IPC-framed record batch whose schema
/// carries the projected columns in request order.
pub fn build_arrow(columns: &[&ColumnDef], rows: &[Vec<Cell>]) -> Result<Vec<u8>, Error> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| Field::new(c.name.clone(), arrow_type(c.column_type), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for (index, column) in columns.iter().enumerate() {
        let array = build_column(column.column_type, rows, index)?;
        arrays.push(array);
    }

    let batch = RecordBatch::try_new(schema.clone(), arrays).map_err(Error::Arrow)?;
    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, &schema).map_err(Error::Arrow)?;
        writer.write(&batch).map_err(Error::Arrow)?;
        writer.finish().map_err(Error::Arrow)?;
    }
    Ok(buf)
}

fn build_column(column_type: CellType, rows: &[Vec<Cell>], index: usize) -> Result<ArrayRef, Error> {
    macro_rules! build {
        ($builder:ty, $variant:path) => {{
            let mut builder = <$builder>::with_capacity(rows.len());
            for row in rows {
                match &row[index] {
                    Cell::Null => builder.append_null(),
                    $variant(v) => builder.append_value(v.clone()),
                    other => {
                        return Err(Error::CellTypeMismatch {
                            expected: column_type,
                            actual: other.cell_type(),
                        })
                    }
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }};
    }

    Ok(match column_type {
        CellType::Bool => build!(BooleanBuilder, Cell::Bool),
        CellType::Int32 => build!(Int32Builder, Cell::Int32),
        CellType::Uint32 => build!(UInt32Builder, Cell::Uint32),
        CellType::Int64 => build!(Int64Builder, Cell::Int64),
        CellType::Uint64 => build!(UInt64Builder, Cell::Uint64),
        CellType::Timestamp => {
            let mut builder = TimestampMicrosecondBuilder::with_capacity(rows.len());
            for row in rows {
                match &row[index] {
                    Cell::Null => builder.append_null(),
                    Cell::Timestamp(v) => builder.append_value(*v as i64),
                    other => {
                        return Err(Error::CellTypeMismatch {
                            expected: column_type,
                            actual: other.cell_type(),
                        })
                    }
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }
        CellType::Utf8 => {
            let mut builder = StringBuilder::new();
            for row in rows {
                match &row[index] {
                    Cell::Null => builder.append_null(),
                    Cell::Utf8(v) => builder.append_value(v),
                    other => {
                        return Err(Error::CellTypeMismatch {
                            expected: column_type,
                            actual: other.cell_type(),
                        })
                    }
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }
        CellType::Bytes => {
            let mut builder = BinaryBuilder::new();
            for row in rows {
                match &row[index] {
                    Cell::Null => builder.append_null(),
                    Cell::Bytes(v) => builder.append_value(v),
                    other => {
                        return Err(Error::CellTypeMismatch {
                            expected: column_type,
                            actual: other.cell_type(),
                        })
                    }
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }
    })
}

/// Decodes an IPC-framed batch back into rows, for consumers and tests.
pub fn decode_arrow(buf: &[u8], columns: &[&ColumnDef]) -> Result<Vec<Vec<Cell>>, Error> {
    use arrow::array::{
        Array, BinaryArray, BooleanArray, Int32Array, Int64Array, StringArray,
        TimestampMicrosecondArray, UInt32Array, UInt64Array,
    };
    use arrow::ipc::reader::StreamReader;

    let reader = StreamReader::try_new(std::io::Cursor::new(buf), None).map_err(Error::Arrow)?;
    let mut rows: Vec<Vec<Cell>> = Vec::new();

    for batch in reader {
        let batch = batch.map_err(Error::Arrow)?;
        let base = rows.len();
        rows.resize(base + batch.num_rows(), Vec::with_capacity(columns.len()));

        for (col_index, column) in columns.iter().enumerate() {
            let array = batch.column(col_index);
            for row_index in 0..batch.num_rows() {
                let cell = if array.is_null(row_index) {
                    Cell::Null
                } else {
                    match column.column_type {
                        CellType::Bool => Cell::Bool(
                            array.as_any().downcast_ref::<BooleanArray>().expect("bool array").value(row_index),
                        ),
                        CellType::Int32 => Cell::Int32(
                            array.as_any().downcast_ref::<Int32Array>().expect("i32 array").value(row_index),
                        ),
                        CellType::Uint32 => Cell::Uint32(
                            array.as_any().downcast_ref::<UInt32Array>().expect("u32 array").value(row_index),
                        ),
                        CellType::Int64 => Cell::Int64(
                            array.as_any().downcast_ref::<Int64Array>().expect("i64 array").value(row_index),
                        ),
                        CellType::Uint64 => Cell::Uint64(
                            array.as_any().downcast_ref::<UInt64Array>().expect("u64 array").value(row_index),
                        ),
                        CellType::Utf8 => Cell::Utf8(
                            array.as_any().downcast_ref::<StringArray>().expect("utf8 array").value(row_index).to_string(),
                        ),
                        CellType::Bytes => Cell::Bytes(bytes::Bytes::copy_from_slice(
                            array.as_any().downcast_ref::<BinaryArray>().expect("binary array").value(row_index),
                        )),
                        CellType::Timestamp => Cell::Timestamp(
                            array
                                .as_any()
                                .downcast_ref::<TimestampMicrosecondArray>()
                                .expect("timestamp array")
                                .value(row_index) as u64,
                        ),
                    }
                };
                rows[base + row_index].push(cell);
            }
        }
    }
    Ok(rows)
}
