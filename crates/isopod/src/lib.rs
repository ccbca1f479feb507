//! ISO 9660 (ECMA-119) library: read, manipulate, and write optical-disc
//! filesystem images, including the Joliet, Rock Ridge, El Torito, and XA
//! extensions.

mod codec;
mod directory;
mod eltorito;
mod error;
mod extent;
mod joliet;
mod path_table;
mod rockridge;
mod session;
mod tree;
mod volume;

pub use codec::RecordTimestamp;
pub use directory::FileFlags;
pub use eltorito::{Emulation, PlatformId};
pub use error::{Error, LookupReason};
pub use rockridge::PosixAttributes;
pub use session::{BootConfig, EntryInfo, EntryKind, Extensions, Iso, WriterMetadata};
pub use volume::JolietLevel;

/// Result type for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// ISO 9660 standard constants.
pub mod constants {
    /// Standard identifier for ISO 9660 ("CD001").
    pub const ISO_STANDARD_ID: &[u8; 5] = b"CD001";

    /// Sector size in bytes.
    pub const SECTOR_SIZE: usize = 2048;

    /// Maximum filename length in ISO 9660 Level 1.
    pub const MAX_FILENAME_LENGTH_LEVEL_1: usize = 8;

    /// Maximum extension length in ISO 9660 Level 1.
    pub const MAX_EXTENSION_LENGTH_LEVEL_1: usize = 3;

    /// Maximum directory nesting depth without Rock Ridge relocation.
    pub const MAX_PATH_DEPTH: usize = 8;
}
