//! HTTP surface of the sync service.
//!
//! Two feature scopes (`clone`, `update`) share the multipart form shape,
//! CSV table parsing and the stream-launching orchestration in the private
//! sibling modules.

pub mod clone;
pub mod update;

mod form;
mod stream;
mod table;
