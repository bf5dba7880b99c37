//! Serial Remote Drive Core
//!
//! This crate bridges a DOS-like guest machine to a modern host's
//! filesystem over an asynchronous serial line. It provides both halves
//! of the protocol:
//! - `Server`: executes guest commands against one served root directory
//! - `driver::RemoteDrive`: the guest-side driver core that packages
//!   filesystem calls into wire commands and splices the results back
//!   into the guest's FCB
//!
//! # Architecture
//!
//! The design is layered:
//! - `transport`: sync-scanned frames over any `SerialLink` byte stream
//! - `proto`: the command set, defined once and shared by both endpoints
//! - `names` / `dostime`: guest CP932 names and packed timestamps
//! - `server` / `driver`: the two endpoints with their session state
//! - `loopback`: an in-process link joining both halves for testing

pub mod dostime;
pub mod driver;
pub mod error;
pub mod hostfs;
pub mod loopback;
pub mod names;
pub mod proto;
pub mod server;
pub mod transport;

pub use driver::{DriverConfig, Fcb, RemoteDrive, FCB_SIZE};
pub use error::{DosError, RemoteError, RemoteResult};
pub use loopback::LoopbackLink;
pub use proto::{FilesInfo, Namebuf, DATA_CHUNK, PAYLOAD_MAX};
pub use server::Server;
pub use transport::{SerialLink, RECOVERY_FLOOD};
