//! FTP-facing filesystem over the blobftp metadata cache.
//!
//! An FTP server front end (the protocol state machine is not part of
//! this crate) talks to [`StorageFs`] for every filesystem question and
//! wraps each `STOR` in the [`upload`] protocol. Directory listings are
//! produced by [`listing`], and errors carry their FTP reply via
//! [`FsError::reply`].
//!
//! # Example
//!
//! ```ignore
//! use blobftp_ftp::{FsConfig, listing};
//!
//! let fs = FsConfig::from_file(Path::new("blobftp.toml"))?.build().await?;
//! fs.upload("/incoming/report.csv", Box::new(body)).await?;
//! for line in listing::list_command(&fs, "/incoming", now).await? {
//!     data_channel.write_all(line.as_bytes()).await?;
//! }
//! fs.persist()?;
//! ```

pub mod config;
pub mod error;
pub mod filesystem;
pub mod listing;
pub mod upload;

pub use config::FsConfig;
pub use error::{FsError, FsResult, Reply};
pub use filesystem::{FileWriter, OpenFile, OpenMode, PseudoStat, StorageFs};
pub use upload::{AbortReason, UploadCoordinator, UploadState, UploadTicket};
