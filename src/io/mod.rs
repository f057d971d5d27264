pub(crate) mod file;

pub use file::FileExt;
