// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session persistence adapters for the conversation engine: the
//! [`SessionStore`] contract plus in-memory and JSON-file
//! implementations.  SQL-backed stores live outside this workspace and
//! implement the same trait.

mod file;
mod memory;
mod store;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::{MetadataPatch, SessionMetadata, SessionStore, StoreError, StoredSession};
