//! Reader and writer configuration.

use tds_wire::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, Validation};

use crate::error::StreamError;

/// Default read buffer capacity.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Inbound stream options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ReaderOptions {
    /// Capacity of the fixed read buffer.
    pub buffer_size: usize,
    /// How strictly packet headers and tokens are checked.
    pub validation: Validation,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_READ_BUFFER_SIZE,
            validation: Validation::Lenient,
        }
    }
}

impl ReaderOptions {
    /// Create options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read buffer capacity.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the validation mode.
    #[must_use]
    pub fn validation(mut self, validation: Validation) -> Self {
        self.validation = validation;
        self
    }

    /// Check the options.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.buffer_size < MAX_PACKET_SIZE {
            return Err(StreamError::InvalidArgument(format!(
                "read buffer size {} is smaller than the maximum packet size {MAX_PACKET_SIZE}",
                self.buffer_size
            )));
        }
        Ok(())
    }
}

/// Outbound stream options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct WriterOptions {
    /// Negotiated packet size including the header.
    pub packet_size: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

impl WriterOptions {
    /// Create options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the packet size.
    #[must_use]
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Check the options.
    pub fn validate(&self) -> Result<(), StreamError> {
        validate_packet_size(self.packet_size)
    }
}

/// Check that a packet size lies within what the protocol allows.
pub fn validate_packet_size(size: usize) -> Result<(), StreamError> {
    if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        return Err(StreamError::InvalidArgument(format!(
            "packet size {size} outside {MIN_PACKET_SIZE}..={MAX_PACKET_SIZE}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ReaderOptions::default().validate().is_ok());
        assert!(WriterOptions::default().validate().is_ok());
        assert_eq!(WriterOptions::default().packet_size, 4096);
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(ReaderOptions::new().buffer_size(4096).validate().is_err());
        assert!(WriterOptions::new().packet_size(511).validate().is_err());
        assert!(WriterOptions::new().packet_size(32768).validate().is_err());
        assert!(WriterOptions::new().packet_size(512).validate().is_ok());
    }
}
