//! 基础设施层：时限、文件、运行状态存储、列式输出

pub mod deadline;
pub mod files;
pub mod output_writer;
pub mod run_state;

pub use deadline::Deadline;
pub use output_writer::{ColumnarRecord, ParquetBatchWriter, TableWriters};
pub use run_state::{AttributeUnion, RetryState, RunStateStore};
