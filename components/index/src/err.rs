use std::sync::Arc;

use snafu::{Location, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("delta list {list} overflowed"))]
    Overflow {
        list: u32,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("corrupt data: {reason}"))]
    CorruptData {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("index was not saved cleanly"))]
    IndexNotSavedCleanly {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("offset {offset} is out of range for region {region} of {size} bytes"))]
    OutOfRange {
        region: String,
        offset: u64,
        size: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("short read in region {region}"))]
    ShortRead {
        region: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("io error on {what}"))]
    Io {
        what: String,
        #[snafu(implicit)]
        location: Location,
        source: std::io::Error,
    },

    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("invalid geometry: {reason}"))]
    InvalidGeometry {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("invalid config: {reason}"))]
    InvalidConfig {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("name is already present in delta list {list}"))]
    DuplicateName {
        list: u32,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("bad state: {reason}"))]
    BadState {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("operation suspended"))]
    Suspended {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("writing chapter {chapter} failed"))]
    ChapterWrite {
        chapter: u64,
        #[snafu(implicit)]
        location: Location,
        source: Arc<Error>,
    },

    #[snafu(display("worker {id} is stopped"))]
    WorkerStopped {
        id: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("request was dropped before completion"))]
    Disconnected {
        #[snafu(implicit)]
        location: Location,
    },
}

impl Error {
    pub fn is_overflow(&self) -> bool { matches!(self, Error::Overflow { .. }) }

    pub fn is_corrupt(&self) -> bool { matches!(self, Error::CorruptData { .. }) }

    pub fn is_not_saved_cleanly(&self) -> bool { matches!(self, Error::IndexNotSavedCleanly { .. }) }

    pub fn is_duplicate_name(&self) -> bool { matches!(self, Error::DuplicateName { .. }) }

    pub fn is_suspended(&self) -> bool { matches!(self, Error::Suspended { .. }) }

    /// Load failures that a rebuild from the volume can recover from.
    pub fn is_recoverable_by_rebuild(&self) -> bool {
        matches!(
            self,
            Error::CorruptData { .. }
                | Error::IndexNotSavedCleanly { .. }
                | Error::ShortRead { .. }
                | Error::OutOfRange { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
