/*!
# Parquet Export of Sample Tables

Converts a sample table, as written by [`CsvCheckpoint`](crate::io::csv::CsvCheckpoint), into a
single-batch Parquet file with the same columns. Enable via the `parquet` feature.
*/

use arrow::array::{ArrayRef, Float64Builder, UInt32Builder, UInt64Builder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use std::error::Error;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::checkpoint::SampleRow;

/**
Saves sample rows to a Parquet file.

The schema is `rank` (UInt32), `iteration` (UInt64), `log_likelihood`, `log_prior` and one
Float64 column per entry of `param_names`.

# Example

```rust
use pta_cw_sampler::checkpoint::SampleRow;
use pta_cw_sampler::io::parquet::save_parquet;

let rows = vec![SampleRow {
    rank: 0,
    iteration: 0,
    log_likelihood: -1.0,
    log_prior: 0.0,
    params: vec![0.5],
}];
save_parquet(&["phase0".to_string()], &rows, "/tmp/samples.parquet")?;
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/
pub fn save_parquet<P: AsRef<Path>>(
    param_names: &[String],
    rows: &[SampleRow],
    filename: P,
) -> Result<(), Box<dyn Error>> {
    let mut fields = vec![
        Field::new("rank", DataType::UInt32, false),
        Field::new("iteration", DataType::UInt64, false),
        Field::new("log_likelihood", DataType::Float64, false),
        Field::new("log_prior", DataType::Float64, false),
    ];
    for name in param_names {
        fields.push(Field::new(name, DataType::Float64, false));
    }
    let schema = Arc::new(Schema::new(fields));

    let mut rank_builder = UInt32Builder::new();
    let mut iteration_builder = UInt64Builder::new();
    let mut ll_builder = Float64Builder::new();
    let mut lp_builder = Float64Builder::new();
    let mut param_builders: Vec<Float64Builder> =
        param_names.iter().map(|_| Float64Builder::new()).collect();

    for row in rows {
        if row.params.len() != param_names.len() {
            return Err(format!(
                "row at iteration {} has {} parameters, expected {}",
                row.iteration,
                row.params.len(),
                param_names.len()
            )
            .into());
        }
        rank_builder.append_value(row.rank as u32);
        iteration_builder.append_value(row.iteration);
        ll_builder.append_value(row.log_likelihood);
        lp_builder.append_value(row.log_prior);
        for (builder, value) in param_builders.iter_mut().zip(&row.params) {
            builder.append_value(*value);
        }
    }

    let mut arrays = vec![
        Arc::new(rank_builder.finish()) as ArrayRef,
        Arc::new(iteration_builder.finish()) as ArrayRef,
        Arc::new(ll_builder.finish()) as ArrayRef,
        Arc::new(lp_builder.finish()) as ArrayRef,
    ];
    for mut builder in param_builders {
        arrays.push(Arc::new(builder.finish()) as ArrayRef);
    }
    let record_batch = RecordBatch::try_new(schema.clone(), arrays)?;

    let file = File::create(filename)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&record_batch)?;
    // metadata is only written on close
    writer.close()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, UInt32Array, UInt64Array};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReader;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_table_has_no_batches() -> Result<(), Box<dyn Error>> {
        let file = NamedTempFile::new()?;
        save_parquet(&["x".to_string()], &[], file.path())?;

        let mut reader = ParquetRecordBatchReader::try_new(File::open(file.path())?, 1024)?;
        assert!(reader.next().is_none());
        Ok(())
    }

    #[test]
    fn rows_keep_their_columns() -> Result<(), Box<dyn Error>> {
        let names = vec!["log10_h".to_string(), "psi".to_string()];
        let rows = vec![
            SampleRow {
                rank: 0,
                iteration: 0,
                log_likelihood: -3.0,
                log_prior: 0.5,
                params: vec![-14.0, 1.0],
            },
            SampleRow {
                rank: 1,
                iteration: 10,
                log_likelihood: -4.0,
                log_prior: 0.25,
                params: vec![-15.0, 2.0],
            },
        ];
        let file = NamedTempFile::new()?;
        save_parquet(&names, &rows, file.path())?;

        let mut reader = ParquetRecordBatchReader::try_new(File::open(file.path())?, 1024)?;
        let batch = reader.next().expect("Expected a record batch")?;
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 6);
        assert_eq!(batch.schema().field(5).name(), "psi");

        let rank = batch
            .column(0)
            .as_any()
            .downcast_ref::<UInt32Array>()
            .unwrap();
        let iteration = batch
            .column(1)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap();
        let psi = batch
            .column(5)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(rank.value(1), 1);
        assert_eq!(iteration.value(1), 10);
        assert_eq!(psi.value(0), 1.0);
        Ok(())
    }

    #[test]
    fn ragged_row_is_rejected() {
        let file = NamedTempFile::new().unwrap();
        let rows = vec![SampleRow {
            rank: 0,
            iteration: 0,
            log_likelihood: 0.0,
            log_prior: 0.0,
            params: vec![],
        }];
        assert!(save_parquet(&["x".to_string()], &rows, file.path()).is_err());
    }
}
