use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Errors {
  #[error("the key is empty")]
  KeyIsEmpty,

  #[error("failed to open data file")]
  FailedToOpenDataFile,

  #[error("failed to read from data file")]
  FailedToReadFromDataFile,

  #[error("failed to write to data file")]
  FailedToWriteToDataFile,

  #[error("failed to sync data file")]
  FailedToSyncDataFile,

  #[error("read data file eof")]
  ReadDataFileEOF,

  #[error("failed to create the database directory")]
  FailedToCreateDatabaseDir,

  #[error("failed to read the database directory")]
  FailedToReadDatabaseDir,

  #[error("the database directory maybe corrupted")]
  DataDirectoryCorrupted,

  #[error("the database directory is used by another process")]
  DatabaseIsUsing,

  #[error("invalid database options")]
  InvalidDbOptions,

  #[error("data file not found")]
  DataFileNotFound,

  #[error("the engine is closed")]
  EngineClosed,

  #[error("failed to start background worker")]
  FailedToStartWorker,

  #[error("compaction is already in progress")]
  CompactionInProgress,

  #[error("compaction ratio unreached")]
  CompactionRatioUnreached,

  #[error("not enough disk space for compaction")]
  CompactionNoEnoughSpace,
}

pub type Result<T> = std::result::Result<T, Errors>;
