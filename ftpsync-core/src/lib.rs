mod client;
mod fs_remote;
mod ftp;
mod memory;

pub use client::{
    RemoteClient, RemoteConnector, RemoteEntry, RemoteError, RemoteErrorClass, join_remote,
    parent_remote,
};
pub use fs_remote::{FsConnector, FsRemote};
pub use ftp::{DEFAULT_PORT, FtpClient, FtpConfig, FtpConnector};
pub use memory::{MemoryConnector, MemoryRemote, MemorySession};
