//! # tds-testing
//!
//! Test infrastructure for the TDS engine crates.
//!
//! ## Features
//!
//! - Token stream builders that encode server responses byte for byte
//! - A packetizer that splits payloads into TDS packets
//! - A scripted in-memory server speaking TDS over duplex pipes
//!
//! ## Token stream example
//!
//! ```rust
//! use tds_testing::{MockColumn, ScalarValue, TokenStreamBuilder, packetize};
//! use tds_wire::{DoneStatus, PacketType};
//!
//! let tokens = TokenStreamBuilder::new()
//!     .col_metadata(&[MockColumn::int("id")])
//!     .row(&[ScalarValue::Int(1)])
//!     .done(DoneStatus::COUNT, 1)
//!     .build();
//! let wire = packetize(PacketType::TabularResult, &tokens, 512);
//! assert_eq!(wire.len(), tokens.len() + 8);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock_server;
pub mod tokens;

pub use mock_server::{
    MockRequest, MockResponse, MockServerBuilder, MockServerConfig, MockServerError, MockTdsServer,
};
pub use tokens::{MockColumn, PLP_CHUNK_SIZE, ScalarValue, TokenStreamBuilder, packetize};
