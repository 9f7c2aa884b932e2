//! Manual Mapping Library.
//!
//! This library maps PE images into a foreign process without the OS loader and runs code
//! inside that process through a persistent remote worker.
//! It is organized into several modules:
//! - `image`: Image parsing into an `ImageDescriptor`.
//! - `resolver`: Module names, image sources and dependency walks.
//! - `layout`: Local layout, remote reservation and section protections.
//! - `fixup`: Relocations, import binding and TLS/exception preparation.
//! - `remote`: The remote execution engine.
//! - `registration`: Loader list registration.
//! - `mapper`: Mapping sessions tying the above together.
//! - `target`: Traits the target process collaborators implement.
//! - `arch`: Architecture-specific backend logic.
//! - `config`: CLI configuration.

pub mod arch;
pub mod config;
pub mod error;
pub mod fixup;
pub mod image;
pub mod layout;
pub mod mapper;
pub mod privileged;
pub mod registration;
pub mod remote;
pub mod resolver;
pub mod symbol;
pub mod target;
pub mod threads;
pub mod utils;
pub mod writer;

pub use error::{MapError, TargetError};
pub use mapper::{MapOptions, MappedModule, MappingSession, ModuleState, Registration};
pub use remote::{Arg, RemoteCall, RemoteExecutor, ReturnWidth};
