pub mod error;
pub mod context;
pub mod kv;
pub mod document;
pub mod command;
pub mod schema;
pub mod index;
pub mod query;
pub mod hooks;
pub mod bus;
pub mod db;

pub use bus::ChangeStream;
pub use command::{Action, Command};
pub use context::Context;
pub use db::{Database, Tx, CDC_COLLECTION};
pub use document::Document;
pub use error::{Error, ErrorKind, Result};
pub use hooks::{PersistHook, ReadHook, Validator, WhereHook};
pub use kv::{DriverRegistry, IterOpts, KvBatch, KvDriver, KvIter, KvTx};
pub use query::{
    Aggregate, Direction, Join, Optimization, OrderBy, Page, PageStats, Query, Select, Where,
    WhereOp,
};
pub use schema::{CollectionSchema, Index};
