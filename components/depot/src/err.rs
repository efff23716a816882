use std::sync::Arc;

use dedupe_common::PhysicalBlockNumber;
use snafu::{Location, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("no free blocks in zone {zone}"))]
    NoSpace {
        zone: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("block {pbn} is outside {what}"))]
    OutOfRange {
        pbn:  PhysicalBlockNumber,
        what: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("invalid reference count change: {reason}"))]
    RefCountInvalid {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("corrupt journal: {reason}"))]
    CorruptJournal {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("depot is read-only after: {cause}"))]
    ReadOnly {
        cause: Arc<Error>,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("bad state: {reason}"))]
    BadState {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("corrupt {component}: {reason}"))]
    CorruptComponent {
        component: &'static str,
        reason:    String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("invalid mapping to block {pbn}: {reason}"))]
    BadMapping {
        pbn:    PhysicalBlockNumber,
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("failed to {what}"))]
    Io {
        what:   String,
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("growing to {requested} blocks adds no slab"))]
    IncrementTooSmall {
        requested: u64,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Error {
    pub fn is_no_space(&self) -> bool { matches!(self, Error::NoSpace { .. }) }

    pub fn is_out_of_range(&self) -> bool { matches!(self, Error::OutOfRange { .. }) }

    pub fn is_read_only(&self) -> bool { matches!(self, Error::ReadOnly { .. }) }

    pub fn is_corrupt_journal(&self) -> bool { matches!(self, Error::CorruptJournal { .. }) }

    pub fn is_ref_count_invalid(&self) -> bool { matches!(self, Error::RefCountInvalid { .. }) }
}

pub type Result<T> = std::result::Result<T, Error>;
