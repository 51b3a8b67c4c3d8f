/*!
Client interface to the compute engine.

The engine owns the authoritative molecular data and is reached through a
single asynchronous call shape: a command name plus an argument list, answered
by a status and a result. Entities and the time capsule receive the client by
injection.
*/

#[cfg(test)]
pub(crate) mod fake;

use crate::{CapsuleError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Names of the engine commands used by the persistence layer.
pub mod commands {
    /// `[text coordinates, text name]` -> int molNo
    pub const READ_COORDINATES: &str = "shim_read_pdb";
    /// `[int molNo, text format]` -> text coordinates
    pub const GET_ATOMS: &str = "get_atoms";
    /// `[int molNo]` -> status
    pub const DELETE: &str = "delete";
    /// `[text cif, int molNo]` -> status
    pub const READ_DICTIONARY: &str = "shim_read_dictionary";
    /// `[int molNo, text style]` -> bytes mesh
    pub const GET_BONDS_MESH: &str = "get_bonds_mesh_instanced";
    /// `[int molNo, text style]` -> bytes mesh
    pub const GET_REPRESENTATION_MESH: &str = "get_molecular_representation_mesh";
    /// `[bytes map, text name, bool isDifference]` -> int molNo
    pub const READ_MAP_DATA: &str = "shim_read_map_data";
    /// `[int molNo]` -> bytes map
    pub const GET_MAP: &str = "get_map";
    /// `[int mapMolNo]` -> bytes reflection data
    pub const GET_REFLECTION_DATA: &str = "get_mtz_data";
    /// `[int mapMolNo, text fileName, bytes data, text F, text SIGF, text FREE]` -> status
    pub const ASSOCIATE_REFLECTION_DATA: &str = "shim_associate_data_mtz_file_with_map";
    /// `[int molecule, int reflectionMap, int twoFoFcMap, int foFcMap]` -> status
    pub const CONNECT_UPDATING_MAPS: &str = "connect_updating_maps";
    /// `[int molecule, int twoFoFcMap, int foFcMap, int reflectionMap]` -> status
    pub const SFCALC_GENMAPS: &str = "sfcalc_genmaps_using_bulk_solvent";
}

/// Shared handle to an engine client
pub type EngineHandle = Arc<dyn EngineClient>;

/// One argument of an engine command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArg {
    Int(i64),
    Bool(bool),
    Text(String),
    Bytes(Bytes),
}

impl CommandArg {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            CommandArg::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CommandArg::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            CommandArg::Bytes(value) => Some(value),
            _ => None,
        }
    }
}

impl From<i32> for CommandArg {
    fn from(value: i32) -> Self {
        CommandArg::Int(value.into())
    }
}

impl From<&str> for CommandArg {
    fn from(value: &str) -> Self {
        CommandArg::Text(value.to_string())
    }
}

impl From<String> for CommandArg {
    fn from(value: String) -> Self {
        CommandArg::Text(value)
    }
}

impl From<bool> for CommandArg {
    fn from(value: bool) -> Self {
        CommandArg::Bool(value)
    }
}

impl From<Bytes> for CommandArg {
    fn from(value: Bytes) -> Self {
        CommandArg::Bytes(value)
    }
}

/// Completion status reported by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum CommandStatus {
    Completed,
    Exception(String),
}

/// Result payload of an engine command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// The command reports status only
    Status,
    Int(i64),
    Text(String),
    Bytes(Bytes),
}

/// Engine answer: status plus result
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub status: CommandStatus,
    pub result: CommandResult,
}

impl CommandResponse {
    pub fn completed(result: CommandResult) -> Self {
        Self {
            status: CommandStatus::Completed,
            result,
        }
    }

    pub fn exception<S: Into<String>>(message: S) -> Self {
        Self {
            status: CommandStatus::Exception(message.into()),
            result: CommandResult::Status,
        }
    }

    /// Fail unless the engine reported completion.
    pub fn ensure_completed(self, command: &str) -> Result<Self> {
        match self.status {
            CommandStatus::Completed => Ok(self),
            CommandStatus::Exception(message) => Err(CapsuleError::engine(command, message)),
        }
    }

    /// Interpret the result as an engine-assigned molecule number.
    pub fn into_mol_no(self, command: &str) -> Result<i32> {
        match self.ensure_completed(command)?.result {
            CommandResult::Int(value) if value >= 0 => i32::try_from(value)
                .map_err(|_| CapsuleError::engine(command, format!("molNo {value} out of range"))),
            CommandResult::Int(value) => Err(CapsuleError::engine(
                command,
                format!("engine returned invalid molNo {value}"),
            )),
            other => Err(unexpected(command, "int", &other)),
        }
    }

    pub fn into_text(self, command: &str) -> Result<String> {
        match self.ensure_completed(command)?.result {
            CommandResult::Text(value) => Ok(value),
            other => Err(unexpected(command, "text", &other)),
        }
    }

    pub fn into_bytes(self, command: &str) -> Result<Bytes> {
        match self.ensure_completed(command)?.result {
            CommandResult::Bytes(value) => Ok(value),
            other => Err(unexpected(command, "bytes", &other)),
        }
    }
}

fn unexpected(command: &str, wanted: &str, got: &CommandResult) -> CapsuleError {
    let got = match got {
        CommandResult::Status => "status",
        CommandResult::Int(_) => "int",
        CommandResult::Text(_) => "text",
        CommandResult::Bytes(_) => "bytes",
    };
    CapsuleError::engine(command, format!("expected {wanted} result, got {got}"))
}

/// Asynchronous client for the worker-hosted compute engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Run one engine command
    ///
    /// Transport failures are returned as errors; failures inside the engine
    /// come back as a response with [`CommandStatus::Exception`].
    async fn command(&self, name: &str, args: Vec<CommandArg>) -> Result<CommandResponse>;
}

/// Run a command and require completion.
pub(crate) async fn run(engine: &dyn EngineClient, name: &str, args: Vec<CommandArg>) -> Result<CommandResponse> {
    engine.command(name, args).await?.ensure_completed(name)
}
