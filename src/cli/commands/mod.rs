pub mod convert;
pub mod merge;
pub mod test;
pub mod train;

pub use convert::ConvertCommand;
pub use merge::MergeCommand;
pub use test::TestCommand;
pub use train::TrainCommand;
