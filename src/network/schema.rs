//! Proto schema compilation for the RPC manager
//!
//! Schemas arrive as raw proto text. Each compile gets its own scratch
//! directory under the configured root; the directory is a `TempDir`, so it
//! is removed when compilation returns, fails or panics.

use prost_reflect::{DescriptorPool, MethodDescriptor, ServiceDescriptor};
use std::fs;
use std::path::Path;

use crate::constants::{SCHEMA_FILE_NAME, SCHEMA_SCRATCH_PREFIX};
use crate::error::ManagerError;
use crate::messages::network::{MethodInfo, ServiceInfo};

/// How a method moves messages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallMode {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidirectional,
}

impl CallMode {
    pub fn of(method: &MethodDescriptor) -> Self {
        match (method.is_client_streaming(), method.is_server_streaming()) {
            (false, false) => CallMode::Unary,
            (false, true) => CallMode::ServerStreaming,
            (true, false) => CallMode::ClientStreaming,
            (true, true) => CallMode::Bidirectional,
        }
    }
}

fn schema_error(context: &str, e: impl std::fmt::Display) -> ManagerError {
    ManagerError::Schema(format!("{}: {}", context, e))
}

/// Compile on a blocking thread
pub async fn compile(proto: &str, scratch_root: &Path) -> Result<DescriptorPool, ManagerError> {
    let proto = proto.to_string();
    let root = scratch_root.to_path_buf();
    tokio::task::spawn_blocking(move || compile_in(&proto, &root))
        .await
        .map_err(|e| schema_error("compiler crashed", e))?
}

fn compile_in(proto: &str, scratch_root: &Path) -> Result<DescriptorPool, ManagerError> {
    fs::create_dir_all(scratch_root).map_err(|e| schema_error("scratch directory", e))?;
    let scratch = tempfile::Builder::new()
        .prefix(SCHEMA_SCRATCH_PREFIX)
        .tempdir_in(scratch_root)
        .map_err(|e| schema_error("scratch directory", e))?;
    fs::write(scratch.path().join(SCHEMA_FILE_NAME), proto)
        .map_err(|e| schema_error("writing schema", e))?;

    let mut compiler =
        protox::Compiler::new([scratch.path()]).map_err(|e| schema_error("compiler", e))?;
    compiler.include_imports(true);
    compiler
        .open_file(SCHEMA_FILE_NAME)
        .map_err(|e| schema_error("invalid schema", e))?;
    tracing::debug!(dir = %scratch.path().display(), "Compiled schema");
    Ok(compiler.descriptor_pool())
}

/// Look a service up by full name (`pkg.Service`), then by short name
pub fn resolve_service(pool: &DescriptorPool, name: &str) -> Result<ServiceDescriptor, ManagerError> {
    let name = name.trim();
    pool.get_service_by_name(name)
        .or_else(|| pool.services().find(|s| s.name() == name))
        .ok_or_else(|| ManagerError::Schema(format!("service not found: {}", name)))
}

pub fn resolve_method(
    service: &ServiceDescriptor,
    name: &str,
) -> Result<MethodDescriptor, ManagerError> {
    let name = name.trim();
    service
        .methods()
        .find(|m| m.name() == name)
        .ok_or_else(|| {
            ManagerError::Schema(format!("method not found: {}.{}", service.full_name(), name))
        })
}

/// Services and methods declared in the pool, in declaration order
pub fn describe(pool: &DescriptorPool) -> Vec<ServiceInfo> {
    pool.services()
        .map(|service| ServiceInfo {
            name: service.full_name().to_string(),
            methods: service
                .methods()
                .map(|m| MethodInfo {
                    name: m.name().to_string(),
                    input_type: m.input().full_name().to_string(),
                    output_type: m.output().full_name().to_string(),
                    client_streaming: m.is_client_streaming(),
                    server_streaming: m.is_server_streaming(),
                })
                .collect(),
        })
        .collect()
}
