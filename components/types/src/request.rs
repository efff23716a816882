use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::record::{RecordData, RecordName};

/// The operations a caller can ask of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    /// Look a name up and, if absent, index it with the new metadata.
    Post,
    /// Index a name with new metadata whether or not it was present.
    Update,
    /// Look a name up, refreshing its chapter when it is found.
    Query,
    /// Look a name up without changing anything.
    QueryNoUpdate,
    /// Forget a name.
    Delete,
}

impl RequestType {
    pub fn name(&self) -> &'static str {
        match self {
            RequestType::Post => "post",
            RequestType::Update => "update",
            RequestType::Query => "query",
            RequestType::QueryNoUpdate => "query_no_update",
            RequestType::Delete => "delete",
        }
    }
}

impl Display for RequestType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.name()) }
}

/// A request as submitted to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub request_type: RequestType,
    pub name:         RecordName,
    /// The metadata to index the name with, for posts and updates.
    pub new_metadata: RecordData,
}

impl Request {
    pub fn new(request_type: RequestType, name: RecordName, new_metadata: RecordData) -> Self {
        Self {
            request_type,
            name,
            new_metadata,
        }
    }

    pub fn post(name: RecordName, new_metadata: RecordData) -> Self { Self::new(RequestType::Post, name, new_metadata) }

    pub fn update(name: RecordName, new_metadata: RecordData) -> Self {
        Self::new(RequestType::Update, name, new_metadata)
    }

    pub fn query(name: RecordName) -> Self { Self::new(RequestType::Query, name, RecordData::default()) }

    pub fn query_no_update(name: RecordName) -> Self {
        Self::new(RequestType::QueryNoUpdate, name, RecordData::default())
    }

    pub fn delete(name: RecordName) -> Self { Self::new(RequestType::Delete, name, RecordData::default()) }
}

/// Where a request found (or expects to find) its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IndexRegion {
    /// Not yet resolved.
    #[default]
    Unknown,
    /// Resolved, and the record is not in the index.
    Unavailable,
    InOpenChapter,
    InDense,
    InSparse,
    /// A volume reader already found the record on its record page.
    RecordPageLookup,
}

/// The answer delivered to a request's completion channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub request_type: RequestType,
    pub name: RecordName,
    /// Whether the name was already present.
    pub found: bool,
    /// The metadata the name carried before this request, if found.
    pub old_metadata: Option<RecordData>,
    pub location: IndexRegion,
    /// The chapter the record was found in.
    pub virtual_chapter: Option<u64>,
}
