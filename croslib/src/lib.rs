pub mod assemble;
pub mod cache;
pub mod chunk;
pub mod error;
pub mod file;
pub mod manifest;
pub mod progress;
pub mod recovery;
pub mod shim;
mod transfer;
pub mod transport;
pub mod version;

#[cfg(test)]
mod testutil;
