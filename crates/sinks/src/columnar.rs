//! Columnar (Parquet) encoding of one record batch. The schema derives
//! from the first record carrying a `new_image` (falling back to
//! `old_image`), plus a synthetic `operation_type` column; delete and TTL
//! rows read their cells from `old_image`.

use parquet::basic::{ConvertedType, Repetition, Type as PhysicalType};
use parquet::data_type::{
    BoolType, ByteArray, ByteArrayType, DoubleType, FloatType, Int32Type, Int64Type,
};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::{SerializedColumnWriter, SerializedFileWriter};
use parquet::schema::types::Type;
use std::sync::Arc;
use streams::{CellValue, ChangeRecord, Error, Result};

/// The column shape each cell kind maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int32,
    Int64,
    Float,
    Double,
    Utf8,
    Binary,
}

impl ColumnKind {
    fn of(value: &CellValue) -> Self {
        match value {
            CellValue::Boolean(_) => Self::Bool,
            CellValue::Int(_) => Self::Int32,
            CellValue::BigInt(_) | CellValue::Timestamp(_) => Self::Int64,
            CellValue::Float(_) => Self::Float,
            CellValue::Double(_) => Self::Double,
            CellValue::Blob(_) => Self::Binary,
            CellValue::Text(_)
            | CellValue::Inet(_)
            | CellValue::Date(_)
            | CellValue::Decimal(_) => Self::Utf8,
        }
    }

    fn physical(&self) -> PhysicalType {
        match self {
            Self::Bool => PhysicalType::BOOLEAN,
            Self::Int32 => PhysicalType::INT32,
            Self::Int64 => PhysicalType::INT64,
            Self::Float => PhysicalType::FLOAT,
            Self::Double => PhysicalType::DOUBLE,
            Self::Utf8 | Self::Binary => PhysicalType::BYTE_ARRAY,
        }
    }
}

struct Column {
    name: String,
    kind: ColumnKind,
}

pub fn write_batch(batch: &[ChangeRecord]) -> Result<Vec<u8>> {
    let template = batch
        .iter()
        .find_map(|record| record.new_image.as_ref().or(record.old_image.as_ref()))
        .ok_or_else(|| {
            Error::UnsupportedType("no record in the batch carries an image".to_string())
        })?;

    let mut columns: Vec<Column> = template
        .iter()
        .map(|(name, value)| Column {
            name: name.clone(),
            kind: ColumnKind::of(value),
        })
        .collect();
    columns.push(Column {
        name: "operation_type".to_string(),
        kind: ColumnKind::Utf8,
    });

    let fields: Vec<Arc<Type>> = columns
        .iter()
        .map(|column| {
            let mut builder = Type::primitive_type_builder(&column.name, column.kind.physical())
                .with_repetition(Repetition::OPTIONAL);
            if column.kind == ColumnKind::Utf8 {
                builder = builder.with_converted_type(ConvertedType::UTF8);
            }
            builder.build().map(Arc::new).map_err(fatal)
        })
        .collect::<Result<_>>()?;

    let schema = Arc::new(
        Type::group_type_builder("schema")
            .with_fields(fields)
            .build()
            .map_err(fatal)?,
    );

    let mut out = Vec::new();
    let mut writer =
        SerializedFileWriter::new(&mut out, schema, Arc::new(WriterProperties::builder().build()))
            .map_err(fatal)?;

    let mut row_group = writer.next_row_group().map_err(fatal)?;
    let mut column_index = 0;
    while let Some(mut column_writer) = row_group.next_column().map_err(fatal)? {
        if column_index + 1 == columns.len() {
            write_operation_column(&mut column_writer, batch)?;
        } else {
            write_cell_column(&mut column_writer, &columns[column_index], batch)?;
        }
        column_writer.close().map_err(fatal)?;
        column_index += 1;
    }
    row_group.close().map_err(fatal)?;
    writer.close().map_err(fatal)?;

    Ok(out)
}

fn fatal(err: parquet::errors::ParquetError) -> Error {
    Error::Fatal(anyhow::Error::new(err))
}

fn write_operation_column(
    writer: &mut SerializedColumnWriter<'_>,
    batch: &[ChangeRecord],
) -> Result<()> {
    let values: Vec<ByteArray> = batch
        .iter()
        .map(|record| ByteArray::from(record.operation.as_str()))
        .collect();
    let def_levels = vec![1i16; batch.len()];
    writer
        .typed::<ByteArrayType>()
        .write_batch(&values, Some(&def_levels), None)
        .map_err(fatal)?;
    Ok(())
}

/// Write one image-backed column. A record missing the column, or whose
/// cell kind no longer matches the first-record schema, contributes a null.
fn write_cell_column(
    writer: &mut SerializedColumnWriter<'_>,
    column: &Column,
    batch: &[ChangeRecord],
) -> Result<()> {
    let cells: Vec<Option<&CellValue>> = batch
        .iter()
        .map(|record| {
            record
                .state_image()
                .and_then(|image| image.get(&column.name))
        })
        .collect();

    macro_rules! write_typed {
        ($parquet_type:ty, $extract:expr) => {{
            let mut values: Vec<<$parquet_type as parquet::data_type::DataType>::T> = Vec::new();
            let mut def_levels: Vec<i16> = Vec::with_capacity(cells.len());
            for cell in &cells {
                match cell.and_then($extract) {
                    Some(value) => {
                        values.push(value);
                        def_levels.push(1);
                    }
                    None => def_levels.push(0),
                }
            }
            writer
                .typed::<$parquet_type>()
                .write_batch(&values, Some(&def_levels), None)
                .map_err(fatal)?;
        }};
    }

    match column.kind {
        ColumnKind::Bool => write_typed!(BoolType, |value: &CellValue| match value {
            CellValue::Boolean(b) => Some(*b),
            _ => None,
        }),
        ColumnKind::Int32 => write_typed!(Int32Type, |value: &CellValue| match value {
            CellValue::Int(n) => Some(*n),
            _ => None,
        }),
        ColumnKind::Int64 => write_typed!(Int64Type, |value: &CellValue| match value {
            CellValue::BigInt(n) | CellValue::Timestamp(n) => Some(*n),
            _ => None,
        }),
        ColumnKind::Float => write_typed!(FloatType, |value: &CellValue| match value {
            CellValue::Float(f) => Some(*f),
            _ => None,
        }),
        ColumnKind::Double => write_typed!(DoubleType, |value: &CellValue| match value {
            CellValue::Double(f) => Some(*f),
            _ => None,
        }),
        ColumnKind::Binary => write_typed!(ByteArrayType, |value: &CellValue| match value {
            CellValue::Blob(bytes) => Some(ByteArray::from(bytes.clone())),
            _ => None,
        }),
        ColumnKind::Utf8 => write_typed!(ByteArrayType, |value: &CellValue| match value {
            CellValue::Text(s) => Some(ByteArray::from(s.as_str())),
            CellValue::Inet(ip) => Some(ByteArray::from(ip.to_string().into_bytes())),
            CellValue::Date(d) =>
                Some(ByteArray::from(d.format("%Y-%m-%d").to_string().into_bytes())),
            CellValue::Decimal(d) => Some(ByteArray::from(d.to_string().into_bytes())),
            _ => None,
        }),
    }
    Ok(())
}
