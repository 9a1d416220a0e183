pub mod page;
pub mod records;
pub mod state;

pub use page::{Attachment, DocumentField, PrimaryPage, SecondaryPage, Sections};
pub use records::{AttributeRecord, DownloadStatus, FileRecord, GuaranteeRecord, Status};
pub use state::{Checkpoint, Run, RunStats};
