/*!
Writing sample tables to disk.
*/

pub mod csv;

#[cfg(feature = "parquet")]
pub mod parquet;
