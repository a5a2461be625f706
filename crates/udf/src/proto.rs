//! Wire messages exchanged with UDF workers.
//!
//! Hand-rolled prost structs matching the worker protocol: a `Request`
//! and `Response` envelope, each a one-of over control RPCs
//! (info/init/snapshot/restore/keepalive) and data flow
//! (begin/point/end). Fields travel as four parallel typed maps.

use std::collections::HashMap;

/// Edge type a worker consumes or produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum EdgeType {
    Stream = 0,
    Batch = 1,
}

/// Scalar type of an option value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ValueType {
    Bool = 0,
    Int = 1,
    Double = 2,
    String = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InfoRequest {}

/// Value types a recognized option accepts, in positional order.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OptionInfo {
    #[prost(enumeration = "ValueType", repeated, tag = "1")]
    pub value_types: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InfoResponse {
    #[prost(enumeration = "EdgeType", tag = "1")]
    pub wants: i32,
    #[prost(enumeration = "EdgeType", tag = "2")]
    pub provides: i32,
    #[prost(map = "string, message", tag = "3")]
    pub options: HashMap<String, OptionInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OptionValue {
    #[prost(enumeration = "ValueType", tag = "1")]
    pub value_type: i32,
    #[prost(oneof = "option_value::Value", tags = "2, 3, 4, 5")]
    pub value: Option<option_value::Value>,
}

pub mod option_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(bool, tag = "2")]
        Bool(bool),
        #[prost(int64, tag = "3")]
        Int(i64),
        #[prost(double, tag = "4")]
        Double(f64),
        #[prost(string, tag = "5")]
        String(::prost::alloc::string::String),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UdfOption {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub values: Vec<OptionValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitRequest {
    #[prost(message, repeated, tag = "1")]
    pub options: Vec<UdfOption>,
    #[prost(string, tag = "2")]
    pub task_id: String,
    #[prost(string, tag = "3")]
    pub node_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub snapshot: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RestoreRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub snapshot: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RestoreResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeepaliveRequest {
    /// Nanosecond wall-clock time of the request.
    #[prost(int64, tag = "1")]
    pub time: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeepaliveResponse {
    #[prost(int64, tag = "1")]
    pub time: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorResponse {
    #[prost(string, tag = "1")]
    pub error: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BeginBatch {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub group: String,
    #[prost(map = "string, string", tag = "3")]
    pub tags: HashMap<String, String>,
    #[prost(int64, tag = "4")]
    pub size: i64,
    #[prost(bool, tag = "5")]
    pub by_name: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Point {
    /// Nanoseconds since the epoch, UTC.
    #[prost(int64, tag = "1")]
    pub time: i64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub database: String,
    #[prost(string, tag = "4")]
    pub retention_policy: String,
    #[prost(string, tag = "5")]
    pub group: String,
    #[prost(string, repeated, tag = "6")]
    pub dimensions: Vec<String>,
    #[prost(bool, tag = "7")]
    pub by_name: bool,
    #[prost(map = "string, string", tag = "8")]
    pub tags: HashMap<String, String>,
    #[prost(map = "string, double", tag = "9")]
    pub fields_double: HashMap<String, f64>,
    #[prost(map = "string, int64", tag = "10")]
    pub fields_int: HashMap<String, i64>,
    #[prost(map = "string, string", tag = "11")]
    pub fields_string: HashMap<String, String>,
    #[prost(map = "string, bool", tag = "12")]
    pub fields_bool: HashMap<String, bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EndBatch {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub group: String,
    #[prost(int64, tag = "3")]
    pub tmax: i64,
    #[prost(map = "string, string", tag = "4")]
    pub tags: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(oneof = "request::Msg", tags = "1, 2, 3, 4, 5, 16, 17, 18")]
    pub msg: Option<request::Msg>,
}

pub mod request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        Info(super::InfoRequest),
        #[prost(message, tag = "2")]
        Init(super::InitRequest),
        #[prost(message, tag = "3")]
        Keepalive(super::KeepaliveRequest),
        #[prost(message, tag = "4")]
        Snapshot(super::SnapshotRequest),
        #[prost(message, tag = "5")]
        Restore(super::RestoreRequest),
        #[prost(message, tag = "16")]
        Begin(super::BeginBatch),
        #[prost(message, tag = "17")]
        Point(super::Point),
        #[prost(message, tag = "18")]
        End(super::EndBatch),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(oneof = "response::Msg", tags = "1, 2, 3, 4, 5, 6, 16, 17, 18")]
    pub msg: Option<response::Msg>,
}

pub mod response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        Info(super::InfoResponse),
        #[prost(message, tag = "2")]
        Init(super::InitResponse),
        #[prost(message, tag = "3")]
        Keepalive(super::KeepaliveResponse),
        #[prost(message, tag = "4")]
        Snapshot(super::SnapshotResponse),
        #[prost(message, tag = "5")]
        Restore(super::RestoreResponse),
        #[prost(message, tag = "6")]
        Error(super::ErrorResponse),
        #[prost(message, tag = "16")]
        Begin(super::BeginBatch),
        #[prost(message, tag = "17")]
        Point(super::Point),
        #[prost(message, tag = "18")]
        End(super::EndBatch),
    }
}

impl Request {
    pub fn of(msg: request::Msg) -> Self {
        Request { msg: Some(msg) }
    }
}

impl Response {
    pub fn of(msg: response::Msg) -> Self {
        Response { msg: Some(msg) }
    }
}
