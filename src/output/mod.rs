mod summary;

pub use summary::{build_summary_markdown, write_summary};
