pub mod db;
pub mod kv;
pub mod model;
pub mod pin;

pub use db::RedbStore;
pub use kv::{Condition, KvStore, Mutation, Page, StoreError};
pub use model::{AccessMode, ContentType, SecretRecord, ShareMetadata};
